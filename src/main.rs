//! # Kubernetes Credentials Provider
//!
//! Controller entry point: wires logging, metrics, the probe server,
//! and the credential sync pipeline together, then runs until a
//! shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use kubernetes_credentials_provider::constants::{DEFAULT_METRICS_PORT, ENV_METRICS_PORT};
use kubernetes_credentials_provider::server::{start_server, ServerState};
use kubernetes_credentials_provider::{
    metrics, ConverterRegistry, CredentialCache, ProviderSettings, SettingsStore, SyncController,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kubernetes_credentials_provider=info".into()),
        )
        .init();

    info!("Starting Kubernetes Credentials Provider");

    metrics::register_metrics()?;

    let settings = SettingsStore::new(ProviderSettings::from_env());
    let cache = Arc::new(CredentialCache::new());
    let registry = Arc::new(ConverterRegistry::with_defaults());
    let controller = SyncController::new(Arc::clone(&cache), registry, settings);

    // Start HTTP server for metrics and probes
    let server_state = Arc::new(ServerState {
        sync_state: controller.state(),
    });
    let server_port = std::env::var(ENV_METRICS_PORT)
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(DEFAULT_METRICS_PORT);

    tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Initial snapshot + watch; a failed first listing is fatal and the
    // orchestrator's restart policy decides what happens next
    Arc::clone(&controller)
        .start()
        .await
        .context("Failed to start the credential sync pipeline")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping credential sync");
    controller.stop().await;

    Ok(())
}
