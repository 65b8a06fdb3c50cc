//! `loanbus stats` command - Show pool and port statistics.
//!
//! Reads the counters straight out of the shared segment.

use std::time::Duration;

use tokio::sync::watch;

use loanbus_core::{ConfigLoader, Segment};

const WATCH_INTERVAL: Duration = Duration::from_secs(1);

pub async fn execute(
    config_path: &str,
    watch: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file(config_path)?;
    let segment = Segment::open(&config.segment.name)?;

    loop {
        println!("{}", segment.stats().to_json()?);
        if !watch {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(WATCH_INTERVAL) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}
