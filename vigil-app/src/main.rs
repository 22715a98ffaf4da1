use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use vigil_core::{EngineConfig, WatchCoordinator};
use vigil_interfaces::ScanEvent;

fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        info!(
            "no configuration at {}, using built-in defaults",
            path.display()
        );
        return Ok(EngineConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn log_event(event: ScanEvent) {
    match event {
        ScanEvent::ThreatDetected { path, verdict } => {
            warn!(path = %path.display(), ?verdict, "threat detected");
        }
        ScanEvent::QuarantineAction {
            record_id,
            path,
            restored,
        } => {
            let action = if restored { "restored" } else { "captured" };
            info!(record = %record_id, path = %path.display(), "quarantine {}", action);
        }
        ScanEvent::ScanError { path, reason } => {
            warn!(path = %path.display(), "scan failed: {}", reason);
        }
        ScanEvent::ScanCompleted { path, .. } => {
            debug!(path = %path.display(), "scan completed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("vigil.toml"));
    let config = load_config(&config_path)?;

    let coordinator =
        WatchCoordinator::from_config(config.clone()).context("engine construction failed")?;
    coordinator.start().await.context("engine startup failed")?;

    let mut events = coordinator.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "event consumer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Baseline pass over the watched roots; changes stream in afterwards.
    for root in &config.watch_paths {
        let queued = coordinator.sweep(root).await;
        info!(root = %root.display(), queued, "initial sweep queued tasks");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    coordinator.stop().await;

    let snapshot = coordinator.metrics_snapshot();
    info!(
        scans = snapshot.scans_completed,
        threats = snapshot.threats_detected,
        quarantined = snapshot.quarantined,
        "engine stopped"
    );
    Ok(())
}
