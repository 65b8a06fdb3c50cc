//! `loanbus down` command - Remove the segment.

use loanbus_core::{ConfigLoader, Segment};

pub async fn execute(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file(config_path)?;
    let name = &config.segment.name;
    tracing::info!(name = %name, "Removing segment");

    Segment::unlink(name)?;

    println!("✓ Segment '{}' removed", name);
    Ok(())
}
