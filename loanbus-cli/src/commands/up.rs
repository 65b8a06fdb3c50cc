//! `loanbus up` command - Create the segment and keep it alive.
//!
//! Owns the shared memory object for as long as it runs, periodically
//! reclaims ports left behind by dead processes and serves pool metrics.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use loanbus_core::{ConfigLoader, PortReaper, ProcessLiveness, Segment};

use crate::metrics;

pub async fn execute(
    config_path: &str,
    metrics_port: u16,
    reap_interval_ms: u64,
    force: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(config = %config_path, "Starting segment owner");

    // Load and validate configuration - fail fast on invalid config
    let config = ConfigLoader::load_file(config_path)?;
    let name = config.segment.name.clone();

    if force {
        if let Err(e) = Segment::unlink(&name) {
            tracing::debug!(name = %name, error = %e, "No stale segment to unlink");
        }
    }

    let segment = Segment::create(&config.segment)?;
    let reaper = PortReaper::new(Arc::clone(&segment));
    let server = metrics::spawn_metrics_server(metrics_port, Arc::clone(&segment), shutdown.clone());

    println!("Segment '{}' is up", name);
    println!("  Size:      {} bytes", segment.size());
    for pool in segment.memory().pools() {
        println!(
            "  Pool:      {} chunks x {} bytes",
            pool.chunk_count(),
            pool.chunk_size()
        );
    }
    println!(
        "  Ports:     {} publishers, {} subscribers",
        segment.limits().max_publishers,
        segment.limits().max_subscribers
    );
    println!("  Metrics:   http://localhost:{}/metrics", metrics_port);
    println!();
    println!("Press Ctrl+C to stop...");

    let mut ticker = tokio::time::interval(Duration::from_millis(reap_interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = reaper.reap(&ProcessLiveness);
                if report.ports_reclaimed() > 0 {
                    tracing::info!(
                        publishers = report.publishers_reclaimed,
                        subscribers = report.subscribers_reclaimed,
                        chunks = report.chunks_released,
                        "Reclaimed ports of dead processes"
                    );
                }
                metrics::record_reap(&report);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    println!();
    println!("Shutting down...");
    tracing::info!(name = %name, "Unlinking segment");
    // Dropping the creating handle unlinks the shared memory object.
    if let Err(e) = server.await {
        tracing::debug!(error = %e, "Metrics server task ended abnormally");
    }
    drop(reaper);
    drop(segment);
    Ok(())
}
