//! brokernode: a Kafka-wire-compatible streaming broker.
//!
//! Partitioned append-only log storage, Kafka protocol dispatch,
//! consensus-backed cluster metadata, consumer group coordination, and
//! transactional produce, in one binary.
//!
//! Exit codes: 0 normal, 1 configuration error, 2 storage error at
//! startup, 3 network bind failure.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use broker_core::BrokerConfig;
use server::{BrokerServer, ServerError};
use telemetry::init_tracing_from_env;

const EXIT_CONFIG: u8 = 1;
const EXIT_STORAGE: u8 = 2;
const EXIT_BIND: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "brokernode", version, about = "Kafka-wire-compatible streaming broker")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for logs, consensus state, and coordinator snapshots
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Unique broker id within the cluster
    #[arg(long)]
    broker_id: Option<i32>,

    /// Comma-separated client listener addresses
    #[arg(long)]
    listeners: Option<String>,

    /// Address advertised to clients (defaults to the first listener)
    #[arg(long)]
    advertised_listeners: Option<String>,

    /// Comma-separated consensus peers as id@host:port
    #[arg(long)]
    cluster_peers: Option<String>,

    /// Initialize a fresh cluster on first start
    #[arg(long)]
    bootstrap: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    dotenvy::dotenv().ok();
    init_tracing_from_env();

    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!("Configuration error: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(err) = config.validate() {
        error!("Configuration error: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }

    info!(
        broker_id = config.broker_id,
        data_dir = %config.data_dir.display(),
        listeners = ?config.listeners,
        clustered = !config.cluster_peers.is_empty(),
        bootstrap = config.bootstrap,
        "Starting brokernode v{}",
        env!("CARGO_PKG_VERSION")
    );

    let broker = match BrokerServer::start(config).await {
        Ok(broker) => broker,
        Err(err) => {
            error!("Startup failed: {err}");
            return ExitCode::from(match err {
                ServerError::Config(_) => EXIT_CONFIG,
                ServerError::Storage(_) => EXIT_STORAGE,
                ServerError::Bind(_) => EXIT_BIND,
                ServerError::Cluster(_) => EXIT_STORAGE,
            });
        }
    };
    info!(addrs = ?broker.local_addrs(), "Broker is serving");

    shutdown_signal().await;
    broker.shutdown().await;
    ExitCode::SUCCESS
}

/// Configuration layering: struct defaults, optional TOML file,
/// `BROKER__*` environment overrides, then CLI flags.
fn load_config(cli: &Cli) -> anyhow::Result<BrokerConfig> {
    let mut builder = config::Config::builder()
        .add_source(config::Config::try_from(&BrokerConfig::default())?);

    match &cli.config {
        Some(path) => {
            builder = builder.add_source(
                config::File::from(path.as_path()).format(config::FileFormat::Toml),
            );
        }
        None => {
            builder = builder.add_source(
                config::File::with_name("config/broker")
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }
    }

    let config = builder
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("BROKER")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: BrokerConfig = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    // CLI flags override everything.
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(broker_id) = cli.broker_id {
        config.broker_id = broker_id;
    }
    if let Some(listeners) = &cli.listeners {
        config.listeners = listeners.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(advertised) = &cli.advertised_listeners {
        config.advertised_listeners = Some(advertised.clone());
    }
    if let Some(peers) = &cli.cluster_peers {
        config.cluster_peers = peers.split(',').map(|s| s.trim().to_string()).collect();
    }
    if cli.bootstrap {
        config.bootstrap = true;
    }
    Ok(config)
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
