use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use voltra::engine::Engine;
use voltra::gateway::StaticGateway;
use voltra::notify::NotifyHub;
use voltra::sweeper::{self, SweepConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("VOLTRA_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    voltra::observability::init(metrics_port);

    let data_dir = std::env::var("VOLTRA_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let sweep_interval_secs: u64 = std::env::var("VOLTRA_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);
    let pending_expiry_mins: i64 = std::env::var("VOLTRA_PENDING_EXPIRY_MINS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);
    let compact_threshold: u64 = std::env::var("VOLTRA_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let compact_interval_secs: u64 = std::env::var("VOLTRA_COMPACT_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("voltra.wal");

    // No real gateway is wired in this build; the scripted double keeps
    // payments in a demo-resolvable state.
    tracing::warn!("no payment gateway configured, using the in-memory double");
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        wal_path.clone(),
        notify,
        Arc::new(StaticGateway::new()),
    )?);

    info!("voltra booking core started");
    info!("  wal: {}", wal_path.display());
    info!("  sweep interval: {sweep_interval_secs}s");
    info!("  pending expiry: {pending_expiry_mins}m");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    let sweep_cfg = SweepConfig {
        interval: Duration::from_secs(sweep_interval_secs),
        pending_expiry_ms: pending_expiry_mins * 60_000,
        ..Default::default()
    };
    tokio::spawn(sweeper::run_sweeper(engine.clone(), sweep_cfg));
    tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        Duration::from_secs(compact_interval_secs),
        compact_threshold,
    ));

    // Run until SIGTERM/ctrl-c; the WAL writer flushes every append before
    // acknowledging it, so there is nothing to drain at shutdown.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("voltra stopped");
    Ok(())
}
