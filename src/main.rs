//! Controller entry point: parses flags, initializes logging, connects to the
//! cluster, and runs the watch loop until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tracing::info;

use vci_flux_secret_controller::config::Options;
use vci_flux_secret_controller::runtime;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Arc::new(Options::parse());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vci_flux_secret_controller=info".into()),
        )
        .init();

    info!(
        selector = %opts.label_selector,
        controller_namespace = %opts.controller_namespace,
        "starting VCI Flux secret controller"
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    runtime::run_watch_loop(client, opts).await
}
