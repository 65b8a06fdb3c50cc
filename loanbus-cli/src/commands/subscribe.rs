//! `loanbus subscribe` command - Print counters as they arrive.

use std::time::Duration;

use tokio::sync::watch;

use loanbus_core::{ConfigLoader, Segment, ServiceDescription, Subscriber};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub async fn execute(
    config_path: &str,
    service: &str,
    count: Option<u64>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file(config_path)?;
    let service = ServiceDescription::parse(service)?;
    let segment = Segment::open(&config.segment.name)?;

    let subscriber = Subscriber::new(segment, service.clone(), config.subscriber)?;
    subscriber.subscribe();
    tracing::info!(port = %subscriber.id(), service = %service, "Subscribed");

    let mut received: u64 = 0;
    while count.map_or(true, |limit| received < limit) && !*shutdown.borrow() {
        if !subscriber.wait_for_data_async(POLL_TIMEOUT).await {
            continue;
        }
        while let Some(sample) = subscriber.take()? {
            let meta = sample.metadata();
            match sample.read_copy::<u64>() {
                Some(value) => println!(
                    "got  {:>8}  seq={} from={}",
                    value,
                    meta.sequence,
                    meta.origin.map(|id| id.to_string()).unwrap_or_default()
                ),
                None => println!("got  {} bytes  seq={}", sample.len(), meta.sequence),
            }
            if sample.verify_checksum() == Some(false) {
                tracing::warn!(chunk = %sample.chunk_ref(), "Checksum mismatch");
            }
            received += 1;
        }
    }

    if subscriber.missed_chunks() > 0 {
        println!("missed {} samples", subscriber.missed_chunks());
    }
    subscriber.unsubscribe();
    Ok(())
}
