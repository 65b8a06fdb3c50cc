use std::sync::Arc;

use lazy_static::lazy_static;
use loanbus_core::{ReapReport, Segment, SegmentStats};
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounter,
    IntCounterVec, IntGaugeVec, TextEncoder,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

lazy_static! {
    pub static ref POOL_USED_CHUNKS: IntGaugeVec = register_int_gauge_vec!(
        "loanbus_pool_used_chunks",
        "Chunks currently loaned out of each pool",
        &["chunk_size"]
    )
    .unwrap();
    pub static ref POOL_HIGH_WATER: IntGaugeVec = register_int_gauge_vec!(
        "loanbus_pool_high_water_chunks",
        "Most chunks ever loaned out of each pool at once",
        &["chunk_size"]
    )
    .unwrap();
    pub static ref CLAIMED_PORTS: IntGaugeVec = register_int_gauge_vec!(
        "loanbus_claimed_ports",
        "Claimed publisher and subscriber ports",
        &["kind"]
    )
    .unwrap();
    pub static ref PORTS_RECLAIMED: IntCounterVec = register_int_counter_vec!(
        "loanbus_ports_reclaimed_total",
        "Ports reclaimed from dead processes",
        &["kind"]
    )
    .unwrap();
    pub static ref CHUNKS_RECLAIMED: IntCounter = register_int_counter!(
        "loanbus_chunks_reclaimed_total",
        "Chunk references released while reclaiming dead ports"
    )
    .unwrap();
}

/// Refresh gauges from a segment snapshot.
pub fn record_stats(stats: &SegmentStats) {
    for pool in &stats.pools {
        let label = pool.chunk_size.to_string();
        POOL_USED_CHUNKS
            .with_label_values(&[label.as_str()])
            .set(pool.used as i64);
        POOL_HIGH_WATER
            .with_label_values(&[label.as_str()])
            .set(pool.high_water as i64);
    }
    for kind in ["publisher", "subscriber"] {
        let claimed = stats
            .ports
            .iter()
            .filter(|port| port.kind.name() == kind)
            .count();
        CLAIMED_PORTS.with_label_values(&[kind]).set(claimed as i64);
    }
}

pub fn record_reap(report: &ReapReport) {
    PORTS_RECLAIMED
        .with_label_values(&["publisher"])
        .inc_by(report.publishers_reclaimed as u64);
    PORTS_RECLAIMED
        .with_label_values(&["subscriber"])
        .inc_by(report.subscribers_reclaimed as u64);
    CHUNKS_RECLAIMED.inc_by(report.chunks_released as u64);
}

/// Serve `/metrics` until `shutdown` flips. Every scrape refreshes the
/// gauges from a fresh snapshot of `segment` first.
pub fn spawn_metrics_server(
    port: u16,
    segment: Arc<Segment>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "Failed to bind metrics server");
                return;
            }
        };
        tracing::info!(addr = %addr, "Metrics server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let mut socket = match accepted {
                        Ok((socket, _)) => socket,
                        Err(e) => {
                            tracing::debug!(error = %e, "Metrics connection failed");
                            continue;
                        }
                    };
                    let body = render(&segment);
                    tokio::spawn(async move {
                        let response = format!(
                            "HTTP/1.0 200 OK\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: text/plain; version=0.0.4\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        if let Err(e) = socket.write_all(response.as_bytes()).await {
                            tracing::debug!(error = %e, "Failed to write metrics response");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Snapshot `segment` into the gauges and encode the whole registry.
pub fn render(segment: &Segment) -> String {
    record_stats(&segment.stats());

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
