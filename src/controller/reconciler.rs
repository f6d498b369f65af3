//! # Reconciler
//!
//! The per-VCI control loop, invoked once per watch event with a
//! `(namespace, name)` key.
//!
//! ## Reconciliation Flow
//!
//! 1. Fetch the VCI; absence means it was deleted and runs garbage collection
//! 2. Gate on `status.phase == Ready`; anything else is a normal no-op
//! 3. Ensure the bearer token and AccessKey exist (token is reused, never
//!    rotated)
//! 4. Render the server URL and kubeconfig bytes + fingerprint
//! 5. Fetch the custom CA, best-effort (a missing or unreadable CA secret
//!    produces a kubeconfig without one)
//! 6. Resolve the target Flux namespaces and upsert the kubeconfig Secret
//!    into each, sequentially
//!
//! Any hard failure aborts the pass and is returned to the watch loop, which
//! redelivers the key with backoff. Upserts are idempotent, so retrying all
//! namespaces after a partial failure is safe.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ApiResource;
use kube::core::DynamicObject;
use kube::{Api, Client};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::kubeconfig::{self, ServerVars};
use super::namespaces::{self, NamespacePatterns};
use super::{secrets, token};
use crate::config::Options;
use crate::crd;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("kubernetes api request failed: {0}")]
    Kube(#[from] kube::Error),
    #[error("template rendering failed: {0}")]
    Template(#[from] minijinja::Error),
    #[error("kubeconfig serialization failed: {0}")]
    Kubeconfig(#[from] serde_json::Error),
    #[error("token entropy unavailable: {0}")]
    Entropy(#[from] rand::Error),
}

/// Reconciles one VirtualClusterInstance per call. Holds no per-VCI state;
/// everything derived is persisted in the cluster, keyed by VCI identity.
pub struct Reconciler {
    client: Client,
    opts: Arc<Options>,
    patterns: NamespacePatterns,
    vci_resource: ApiResource,
    access_key_resource: ApiResource,
}

impl Reconciler {
    pub fn new(client: Client, opts: Arc<Options>) -> Self {
        let patterns = NamespacePatterns::parse(&opts.namespace_patterns);
        Self {
            client,
            opts,
            patterns,
            vci_resource: crd::virtual_cluster_instance(),
            access_key_resource: crd::access_key(),
        }
    }

    /// Reconcile the VCI identified by `(vci_namespace, vci_name)`.
    ///
    /// An `Err` asks the caller to redeliver the key later; `Ok` means the
    /// derived state converged (including the deleted-VCI GC outcome).
    pub async fn reconcile(
        &self,
        vci_namespace: &str,
        vci_name: &str,
    ) -> Result<(), ReconcileError> {
        let vcis: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), vci_namespace, &self.vci_resource);

        let Some(vci) = vcis.get_opt(vci_name).await? else {
            // VCI deleted: tear down secrets, AccessKey, and token. GC is
            // best-effort per step; there is nothing left to retry against.
            secrets::garbage_collect(&self.client, &self.opts, vci_namespace, vci_name).await;
            return Ok(());
        };

        let phase = crd::phase(&vci);
        if phase != Some(crd::PHASE_READY) {
            debug!(
                vci = %vci_name,
                vci_namespace = %vci_namespace,
                phase = phase.unwrap_or(""),
                "VCI not ready yet, skipping"
            );
            return Ok(());
        }

        let access_token = token::ensure_token(
            &self.client,
            &self.opts,
            &self.access_key_resource,
            vci_namespace,
            vci_name,
        )
        .await?;

        let server_url = kubeconfig::render_server_url(
            &self.opts.server_template,
            &ServerVars {
                domain: &self.opts.domain,
                project: token::project_from_namespace(vci_namespace),
                namespace: vci_namespace,
                name: vci_name,
            },
        )?;

        let ca_pem = self.fetch_ca_pem().await;
        let (kubeconfig_bytes, fingerprint) = kubeconfig::build_kubeconfig(
            &server_url,
            vci_name,
            &access_token,
            ca_pem.as_deref(),
        )?;

        let targets =
            namespaces::resolve_target_namespaces(self.client.clone(), &self.patterns).await?;
        for target in &targets {
            secrets::upsert_kubeconfig_secret(
                &self.client,
                &self.opts,
                &vci,
                vci_namespace,
                vci_name,
                target,
                &kubeconfig_bytes,
                &fingerprint,
            )
            .await?;
        }

        info!(
            vci = %vci_name,
            vci_namespace = %vci_namespace,
            namespaces = %targets.iter().cloned().collect::<Vec<_>>().join(","),
            "reconciled VCI"
        );
        Ok(())
    }

    /// Read the custom CA PEM, if configured. Best-effort: any failure yields
    /// a kubeconfig without a custom CA rather than failing the pass.
    async fn fetch_ca_pem(&self) -> Option<Vec<u8>> {
        if !self.opts.ca_secret_configured() {
            return None;
        }
        let api: Api<Secret> =
            Api::namespaced(self.client.clone(), &self.opts.ca_secret_namespace);
        match api.get_opt(&self.opts.ca_secret_name).await {
            Ok(Some(secret)) => secret
                .data
                .as_ref()
                .and_then(|data| data.get(&self.opts.ca_secret_key))
                .map(|pem| pem.0.clone()),
            Ok(None) => None,
            Err(err) => {
                warn!(
                    secret = %self.opts.ca_secret_name,
                    namespace = %self.opts.ca_secret_namespace,
                    error = %err,
                    "failed to read CA secret, building kubeconfig without custom CA"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}
