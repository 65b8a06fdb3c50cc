// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `loanbus validate` command - Validate configuration file.

use loanbus_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            let segment = &config.segment;
            println!("✓ Configuration is valid");
            println!();
            println!("Segment '{}':", segment.name);
            println!("  Max Publishers:     {}", segment.limits.max_publishers);
            println!("  Max Subscribers:    {}", segment.limits.max_subscribers);
            println!("  Max Queue Capacity: {}", segment.limits.max_queue_capacity);
            println!("  Max Chunks Held:    {}", segment.limits.max_chunks_held);
            println!("  Max History:        {}", segment.limits.max_history);
            println!("  Payload Bytes:      {}", segment.payload_bytes());
            println!();
            println!("Pools ({}):", segment.pools.len());
            for pool in &segment.pools {
                println!("  - {} chunks x {} bytes", pool.chunk_count, pool.chunk_size);
            }
            println!();
            println!(
                "Publisher: history={} max_loans={} checksum={}",
                config.publisher.history_capacity,
                config.publisher.max_loans,
                config.publisher.checksum
            );
            println!(
                "Subscriber: queue={} policy={} block_timeout={}ms held={} history={}",
                config.subscriber.queue.capacity,
                config.subscriber.queue.overflow_policy,
                config.subscriber.queue.block_timeout.as_millis(),
                config.subscriber.max_chunks_held,
                config.subscriber.history_request
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
