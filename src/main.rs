//! The solmux daemon: wires configuration, inventory discovery, the session
//! supervisor, and the retention scheduler together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use solmux::analytics::Analytics;
use solmux::config::Config;
use solmux::inventory::{HttpInventorySource, InventoryCache, InventorySync, Registry};
use solmux::logs::LogWriter;
use solmux::supervisor::{Credentials, Supervisor};

/// Cadence of the log retention sweep.
const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Parser)]
#[command(name = "solmux", version, about = "IPMI SOL console aggregator")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let log_path = Path::new(&cfg.logs.path);
    std::fs::create_dir_all(log_path)
        .with_context(|| format!("failed to create log directory {}", log_path.display()))?;

    // Analytics and the inventory cache live next to the log tree.
    let data_dir: PathBuf = log_path.parent().unwrap_or(log_path).to_path_buf();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bmh_url = %cfg.discovery.bmh_url,
        namespace = %cfg.discovery.namespace,
        logs = %cfg.logs.path,
        "starting console aggregator"
    );

    let log_writer = Arc::new(LogWriter::new(&cfg.logs.path, cfg.logs.retention_days));
    let analytics = Arc::new(Analytics::new(
        Some(data_dir.clone()),
        &cfg.reboot_detection.sol_patterns,
    ));
    analytics.clone().spawn_persister();

    let supervisor = Supervisor::new(
        Credentials {
            username: cfg.ipmi.username.clone(),
            password: cfg.ipmi.password.clone(),
        },
        log_writer.clone(),
        analytics.clone(),
    );

    let registry = Arc::new(Registry::new());
    for seed in &cfg.servers {
        registry.seed(&seed.name, &seed.host);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if cfg.discovery.bmh_url.is_empty() {
        // No inventory source: run the statically configured servers only.
        for (name, record) in registry.snapshot() {
            supervisor.start_session(&name, &record.bmc_address, "", "");
        }
        if cfg.servers.is_empty() {
            warn!("no inventory source and no static servers configured");
        }
    } else {
        let source = Arc::new(HttpInventorySource::new(
            cfg.discovery.bmh_url.clone(),
            Some(cfg.discovery.namespace.clone()),
        ));
        let sync = Arc::new(InventorySync::new(
            source,
            registry.clone(),
            Some(InventoryCache::new(&data_dir)),
            supervisor.clone(),
        ));
        tokio::spawn(sync.run(shutdown_rx.clone()));
    }

    // Retention sweep on a 24-hour cadence.
    {
        let log_writer = log_writer.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => log_writer.cleanup(),
                }
            }
        });
    }

    wait_for_shutdown().await;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    supervisor.stop_all();
    analytics.save();
    log_writer.close();

    // Give spawned teardown tasks a moment to issue their courtesies.
    tokio::time::sleep(Duration::from_secs(1)).await;

    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
