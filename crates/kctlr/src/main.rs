//! kctlr: namespace controller for registry pull secrets.
//!
//! Watches namespaces and keeps a docker-config secret in each one that
//! is not excluded. The watch is fed from an optional JSON listing plus a
//! JSON-lines event stream (a file or stdin).

use std::path::PathBuf;

use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kctlr_core::ControllerConfig;
use kctlr_core::config::{DEFAULT_MAX_RETRIES, DEFAULT_WORKER_COUNT};

mod daemon;
mod feed;
mod handler;
mod namespace;
mod secret;

use daemon::{DEFAULT_RESYNC_HOURS, DaemonConfig, parse_comma_list};
use handler::DEFAULT_SECRET_NAME;
use secret::RegistryCredentials;

#[derive(Parser, Debug)]
#[command(name = "kctlr")]
#[command(about = "Projects registry credentials into every namespace", long_about = None)]
struct Cli {
    /// Number of concurrent workers
    #[arg(long, env = "KCTLR_WORKER_NUMBER", default_value_t = DEFAULT_WORKER_COUNT)]
    workers: usize,

    /// Retries per namespace before it is dropped until its next event
    #[arg(long, env = "KCTLR_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Credential refresh period in hours (0 disables resync)
    #[arg(long, env = "KCTLR_RESYNC_PERIOD", default_value_t = DEFAULT_RESYNC_HOURS)]
    resync_period: u64,

    /// Name of the secret to create
    #[arg(long, env = "KCTLR_SECRET_NAME", default_value = DEFAULT_SECRET_NAME)]
    secret_name: String,

    /// Comma-separated namespaces that must not carry the secret
    #[arg(long, env = "KCTLR_EXCLUDE_NAMESPACES", default_value = "")]
    exclude_namespaces: String,

    /// Registry endpoint the credentials are for
    #[arg(long, env = "KCTLR_REGISTRY")]
    registry: String,

    /// Registry user name
    #[arg(long, env = "KCTLR_REGISTRY_USERNAME", default_value = "AWS")]
    registry_username: String,

    /// Registry password or token
    #[arg(long, env = "KCTLR_REGISTRY_PASSWORD", hide_env_values = true)]
    registry_password: String,

    /// JSON array of namespaces forming the initial listing
    #[arg(long, env = "KCTLR_LISTING")]
    listing: Option<PathBuf>,

    /// JSON-lines watch events ("-" for stdin)
    #[arg(long, env = "KCTLR_EVENTS", default_value = "-")]
    events: String,
}

impl Cli {
    fn into_config(self) -> DaemonConfig {
        DaemonConfig {
            controller: ControllerConfig {
                worker_count: self.workers.max(1),
                max_retries: self.max_retries,
                ..ControllerConfig::default()
            },
            resync_hours: self.resync_period,
            secret_name: self.secret_name,
            exclude_namespaces: parse_comma_list(&self.exclude_namespaces),
            credentials: RegistryCredentials {
                endpoint: self.registry,
                username: self.registry_username,
                password: self.registry_password,
            },
            listing: self.listing,
            events: self.events,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "kctlr=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    daemon::run_with_config(cli.into_config()).await
}
