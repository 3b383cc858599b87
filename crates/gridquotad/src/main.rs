//! gridquotad: the GridQuota daemon.
//!
//! Single binary that assembles the quota subsystems:
//! - State store (redb)
//! - Ledger service (reservations, validation, conflict retry)
//! - Capacity monitor (host aggregation + fair-share redistribution)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! gridquotad serve --config /etc/gridquota/gridquota.toml --port 8480
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridquota_capacity::CapacityMonitor;
use gridquota_core::config::GridQuotaConfig;
use gridquota_ledger::LedgerService;

#[derive(Parser)]
#[command(name = "gridquotad", about = "GridQuota placement quota daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Serve {
        /// Path to gridquota.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Log output format.
        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            log_format,
        } => {
            let mut config = match config {
                Some(path) => GridQuotaConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => GridQuotaConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            init_tracing(&config, log_format)?;
            run(config).await
        }
    }
}

fn init_tracing(config: &GridQuotaConfig, format: LogFormat) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.filter)
            .with_context(|| format!("invalid log filter {:?}", config.logging.filter))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

async fn run(config: GridQuotaConfig) -> anyhow::Result<()> {
    info!("GridQuota daemon starting");

    std::fs::create_dir_all(&config.server.data_dir)
        .with_context(|| format!("creating {}", config.server.data_dir.display()))?;
    let db_path = config.database_path();

    // ── Initialize subsystems ──────────────────────────────────

    let store = gridquota_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let (monitor, capacity) = CapacityMonitor::new(store.clone(), &config.capacity);
    let monitor = monitor.with_max_conflict_retries(config.reservation.max_conflict_retries);

    let rebalance = capacity.clone();
    let ledger = LedgerService::new(store)
        .with_max_conflict_retries(config.reservation.max_conflict_retries)
        .with_pool_change_callback(Arc::new(move |pool: &str| rebalance.rebalance(pool)));
    let ledger = Arc::new(ledger);

    if config.bootstrap.default_pool {
        ledger.ensure_defaults()?;
        info!("default pool and placement ensured");
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor_handle = tokio::spawn(async move {
        monitor.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = gridquota_api::build_router(gridquota_api::ApiState::new(ledger, Some(capacity)));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = monitor_handle.await;

    info!("GridQuota daemon stopped");
    Ok(())
}
