//! `loanbus publish` command - Publish an incrementing counter.

use std::time::Duration;

use tokio::sync::watch;

use loanbus_core::{ConfigLoader, Publisher, Segment, ServiceDescription};

pub async fn execute(
    config_path: &str,
    service: &str,
    interval_ms: u64,
    count: Option<u64>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file(config_path)?;
    let service = ServiceDescription::parse(service)?;
    let segment = Segment::open(&config.segment.name)?;

    let publisher = Publisher::new(segment, service.clone(), config.publisher)?;
    publisher.offer();
    tracing::info!(port = %publisher.id(), service = %service, "Publishing");

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut counter: u64 = 0;
    while count.map_or(true, |limit| counter < limit) {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match publisher.publish_copy_of(&counter) {
            Ok(report) => {
                println!(
                    "sent {:>8}  delivered={} rejected={} timed_out={} discarded={}",
                    counter, report.delivered, report.rejected, report.timed_out, report.discarded
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, counter, "Failed to loan chunk");
            }
        }
        counter += 1;
    }

    publisher.stop_offer();
    Ok(())
}
