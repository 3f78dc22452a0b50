//! deskgridd — the deskgrid daemon.
//!
//! Single binary that assembles the fleet control plane:
//! - State store (redb) and server registry
//! - Runtime client pool (one client per workspace server)
//! - Orchestrator
//! - Health monitor (server and workspace loops)
//!
//! # Usage
//!
//! ```text
//! deskgridd run --config /etc/deskgrid/deskgrid.toml --data-dir /var/lib/deskgrid
//! deskgridd check-config --config deskgrid.toml
//! deskgridd status --data-dir /var/lib/deskgrid
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use deskgrid_health::{HealthEvent, HealthMonitor};
use deskgrid_orchestrator::Orchestrator;
use deskgrid_runtime::ClientPool;
use deskgrid_state::{Registry, StateStore};

use crate::config::FleetConfig;

const DEFAULT_FILTER: &str = "info,deskgridd=debug,deskgrid=debug";
const DEFAULT_DATA_DIR: &str = "/var/lib/deskgrid";
const DB_FILE: &str = "deskgrid.redb";

#[derive(Parser)]
#[command(name = "deskgridd", about = "deskgrid workspace fleet daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the registry and health monitor until interrupted.
    Run {
        /// Fleet configuration file.
        #[arg(long, env = "DESKGRID_CONFIG", default_value = "deskgrid.toml")]
        config: PathBuf,

        /// Data directory for persistent state. Overrides `data_dir` in the config.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, env = "DESKGRID_CONFIG", default_value = "deskgrid.toml")]
        config: PathBuf,
    },
    /// Print persisted server and workspace health as JSON.
    Status {
        #[arg(long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config, data_dir } => run(&config, data_dir).await,
        Command::CheckConfig { config } => check_config(&config),
        Command::Status { data_dir } => status(&data_dir),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_registry(data_dir: &Path) -> anyhow::Result<Registry> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join(DB_FILE);
    let store = StateStore::open(&db_path)
        .with_context(|| format!("opening state store {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");
    Ok(Registry::open(store)?)
}

async fn run(config_path: &Path, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "deskgrid daemon starting");
    let config = FleetConfig::from_file(config_path)?;
    let data_dir = data_dir
        .or_else(|| config.data_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

    // ── Initialize subsystems ──────────────────────────────────

    let registry = Arc::new(open_registry(&data_dir)?);
    let pool = Arc::new(ClientPool::new(config.pool.clone()));
    let orchestrator = Orchestrator::new(registry.clone(), pool.clone());

    // Persisted records keep their live counters; configured capacity only
    // applies to servers the registry has not seen before.
    for server in &config.servers {
        match registry.get_server(&server.server_id) {
            Some(existing) => {
                if existing.total_cpu_cores != server.total_cpu_cores
                    || existing.total_memory_mb != server.total_memory_mb
                    || existing.max_workspaces != server.max_workspaces
                {
                    warn!(
                        server_id = %server.server_id,
                        "configured capacity differs from persisted record; keeping persisted"
                    );
                }
            }
            None => {
                orchestrator.add_server(server.clone())?;
                info!(server_id = %server.server_id, host = %server.host, "server registered");
            }
        }
    }

    for record in registry.list_servers() {
        if pool.contains(&record.server_id) {
            continue;
        }
        if !config.servers.iter().any(|s| s.server_id == record.server_id) {
            warn!(
                server_id = %record.server_id,
                workspaces = record.current_workspace_count,
                "persisted server missing from configuration"
            );
        }
        pool.add_server(&record)?;
    }
    info!(
        servers = pool.len(),
        workspaces = orchestrator.list_workspaces().len(),
        "fleet loaded"
    );

    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        pool.clone(),
        config.monitor.clone(),
    ));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let events = tokio::spawn(log_events(monitor.subscribe(), shutdown_rx.clone()));
    let monitor_handle = monitor.spawn(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    monitor_handle.join().await;
    let _ = events.await;

    info!(
        pending = registry.pending_reservations(),
        workspaces = registry.list_workspaces().len(),
        "deskgrid daemon stopped"
    );
    Ok(())
}

/// Forward health events to the log until shutdown.
async fn log_events(
    mut events: broadcast::Receiver<HealthEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => info!(event = %line, "health event"),
                    Err(e) => warn!(error = %e, "failed to encode health event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "health event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("health event logger stopped");
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(path)?;
    for server in &config.servers {
        let record = deskgrid_state::ServerRecord::from_config(server.clone());
        // Builds the client so TLS bundles are validated too.
        deskgrid_runtime::DockerClient::connect(&record, &config.pool)
            .with_context(|| format!("server {}", server.server_id))?;
    }
    println!(
        "{}: ok ({} server(s))",
        path.display(),
        config.servers.len()
    );
    Ok(())
}

fn status(data_dir: &Path) -> anyhow::Result<()> {
    let registry = open_registry(data_dir)?;
    let servers: Vec<_> = registry
        .list_servers()
        .iter()
        .map(|s| s.health_snapshot())
        .collect();
    let workspaces: Vec<_> = registry
        .list_workspaces()
        .iter()
        .map(|w| w.snapshot())
        .collect();
    let report = serde_json::json!({
        "servers": servers,
        "workspaces": workspaces,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
