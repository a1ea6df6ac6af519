//! Daemon command: watches namespaces and keeps their registry secrets current.
//!
//! Wiring:
//! - `MemoryStore` mirrors the namespaces
//! - `SharedInformer` fills it from the listing and the event input
//! - `Controller` drains namespace keys into the secret handler
//! - Ctrl-C flips the shared stop signal

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use kctlr_core::{Controller, ControllerConfig};
use kctlr_store::{MemoryStore, SharedInformer};

use crate::feed;
use crate::handler::NamespaceSecretHandler;
use crate::secret::{MemorySecretTarget, RegistryCredentials, SecretTarget};

/// Default resync period in hours.
pub const DEFAULT_RESYNC_HOURS: u64 = 5;

/// Capacity of the channel between the event reader and the informer.
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub controller: ControllerConfig,
    /// Resync period in hours (0 to disable).
    pub resync_hours: u64,
    pub secret_name: String,
    pub exclude_namespaces: Vec<String>,
    pub credentials: RegistryCredentials,
    /// JSON array of namespaces applied before any watch event.
    pub listing: Option<PathBuf>,
    /// JSON-lines watch events, `-` for stdin.
    pub events: String,
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
pub fn parse_comma_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn run_with_config(config: DaemonConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let target = MemorySecretTarget::new();
    serve(config, target.clone(), shutdown_rx).await?;

    info!(secrets = ?target.list(), "kctlr daemon stopped");
    Ok(())
}

/// Run the controller against `target` until `shutdown_rx` fires.
pub async fn serve(
    config: DaemonConfig,
    target: Arc<dyn SecretTarget>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let listing = match &config.listing {
        Some(path) => feed::read_listing(path).await?,
        None => Vec::new(),
    };
    let events = feed::open_events(&config.events).await?;

    let (watch_tx, watch_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    let store = MemoryStore::new();
    let informer = Arc::new(
        SharedInformer::new(Arc::clone(&store), listing, watch_rx).with_resync_period(
            Duration::from_secs(config.resync_hours.saturating_mul(3600)),
        ),
    );

    let handler = NamespaceSecretHandler::new(
        target,
        config.credentials,
        config.exclude_namespaces,
        &config.secret_name,
    );

    info!(
        workers = config.controller.worker_count,
        max_retries = config.controller.max_retries,
        resync_hours = config.resync_hours,
        secret = handler.secret_name(),
        "starting kctlr daemon"
    );

    let controller =
        Controller::with_config(&config.controller, Arc::clone(&informer), store, handler);
    informer.add_event_handler(Arc::new(controller.event_handler("namespace")));

    let feeder = tokio::spawn(feed::pump_events(events, watch_tx, shutdown_rx.clone()));

    controller
        .run(config.controller.worker_count, shutdown_rx)
        .await
        .map_err(|e| miette::miette!("controller failed: {}", e))?;

    match feeder.await {
        Ok(forwarded) => info!(forwarded, "event feeder finished"),
        Err(e) => warn!(error = %e, "event feeder task failed"),
    }

    Ok(())
}
