//! # Watch Loop
//!
//! Watches VirtualClusterInstance resources across all namespaces and drives
//! the reconciler with `(namespace, name)` keys. Apply and delete events both
//! map to the same reconcile entry point; a deleted VCI is observed as
//! absence and triggers garbage collection (the VCI is read-only to this
//! controller, so finalizers are not an option).
//!
//! Events and backoff redeliveries are processed sequentially on one task,
//! which guarantees at most one in-flight reconciliation per key. Failed keys
//! are redelivered after a per-key Fibonacci delay, reset on success.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{pin_mut, StreamExt};
use kube::core::{DynamicObject, Selector};
use kube::{Api, Client};
use kube_runtime::watcher;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Options;
use crate::controller::Reconciler;
use crate::crd;
use crate::runtime::backoff::FibonacciBackoff;

/// First redelivery delay for a failing key.
const ERROR_BACKOFF_MIN_SECS: u64 = 5;
/// Redelivery delay cap.
const ERROR_BACKOFF_MAX_SECS: u64 = 300;
/// Pause before restarting an ended watch stream.
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(5);

/// A reconcile request key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReconcileKey {
    namespace: String,
    name: String,
}

impl ReconcileKey {
    fn from_object(obj: &DynamicObject) -> Option<Self> {
        Some(Self {
            namespace: obj.metadata.namespace.clone()?,
            name: obj.metadata.name.clone()?,
        })
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// SIGINT/SIGTERM listener, installed once before the event loop so a signal
/// arriving while a reconcile is in flight is buffered and observed on the
/// next poll instead of being dropped.
struct ShutdownSignal {
    sigint: Signal,
    sigterm: Signal,
}

impl ShutdownSignal {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for either signal; resolves to the signal's name.
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }
}

/// Run the controller until a shutdown signal arrives.
///
/// The watch stream recovers from transient errors on its own; if it ends it
/// is restarted after a short delay so the controller keeps converging.
pub async fn run_watch_loop(client: Client, opts: Arc<Options>) -> Result<(), anyhow::Error> {
    let reconciler = Arc::new(Reconciler::new(client.clone(), Arc::clone(&opts)));
    let vci_resource = crd::virtual_cluster_instance();

    let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<ReconcileKey>();
    let mut backoffs: HashMap<ReconcileKey, FibonacciBackoff> = HashMap::new();
    let mut shutdown = ShutdownSignal::new()?;

    loop {
        let vcis: Api<DynamicObject> = Api::all_with(client.clone(), &vci_resource);
        let stream = watcher(vcis, watcher_config(&opts.label_selector));
        pin_mut!(stream);
        info!("starting VCI watch");

        loop {
            tokio::select! {
                signal = shutdown.recv() => {
                    info!(signal, "received shutdown signal, stopping watch loop");
                    return Ok(());
                }
                Some(key) = requeue_rx.recv() => {
                    process_key(&reconciler, key, &mut backoffs, &requeue_tx).await;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        handle_event(&reconciler, event, &mut backoffs, &requeue_tx).await;
                    }
                    Some(Err(err)) => {
                        // The watcher retries internally; errors here are transient.
                        warn!(error = %err, "VCI watch error");
                    }
                    None => {
                        warn!("VCI watch stream ended, restarting");
                        break;
                    }
                }
            }
        }

        tokio::time::sleep(WATCH_RESTART_DELAY).await;
    }
}

async fn handle_event(
    reconciler: &Reconciler,
    event: watcher::Event<DynamicObject>,
    backoffs: &mut HashMap<ReconcileKey, FibonacciBackoff>,
    requeue_tx: &mpsc::UnboundedSender<ReconcileKey>,
) {
    match event {
        // Deletions reconcile too: the get observes absence and runs GC.
        watcher::Event::Apply(obj)
        | watcher::Event::InitApply(obj)
        | watcher::Event::Delete(obj) => {
            let Some(key) = ReconcileKey::from_object(&obj) else {
                warn!("ignoring VCI event without namespace/name");
                return;
            };
            process_key(reconciler, key, backoffs, requeue_tx).await;
        }
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}

async fn process_key(
    reconciler: &Reconciler,
    key: ReconcileKey,
    backoffs: &mut HashMap<ReconcileKey, FibonacciBackoff>,
    requeue_tx: &mpsc::UnboundedSender<ReconcileKey>,
) {
    match reconciler.reconcile(&key.namespace, &key.name).await {
        Ok(()) => {
            backoffs.remove(&key);
        }
        Err(err) => {
            error!(vci = %key, error = %err, "reconciliation failed");
            let delay = backoffs
                .entry(key.clone())
                .or_insert_with(|| {
                    FibonacciBackoff::new(ERROR_BACKOFF_MIN_SECS, ERROR_BACKOFF_MAX_SECS)
                })
                .next_delay();
            info!(vci = %key, delay_secs = delay.as_secs(), "scheduling redelivery");
            let tx = requeue_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(key);
            });
        }
    }
}

/// Build the watcher config from the configured label selector.
///
/// An unparseable selector fails open: dropping in-scope VCIs silently would
/// be worse than reconciling a few extra ones, so the watch runs unfiltered.
fn watcher_config(selector: &str) -> watcher::Config {
    if selector.is_empty() {
        return watcher::Config::default();
    }
    match selector.parse::<Selector>() {
        Ok(parsed) => watcher::Config::default().labels_from(&parsed),
        Err(err) => {
            warn!(selector, error = %err, "unparseable label selector, accepting all VCIs");
            watcher::Config::default()
        }
    }
}
