// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Loanbus CLI
//!
//! Command-line interface for creating, inspecting and exercising loanbus
//! shared-memory segments.

use clap::{Parser, Subcommand};
use tokio::sync::watch;

mod commands;
mod metrics;

/// Default service used by the demo publisher and subscriber.
const DEFAULT_SERVICE: &str = "Radar/FrontLeft/Counter";

/// Loanbus - zero-copy shared-memory publish/subscribe
#[derive(Parser)]
#[command(name = "loanbus")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "loanbus.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the segment and keep it alive, reclaiming ports of dead processes
    Up {
        /// Port for the Prometheus metrics endpoint
        #[arg(long, default_value_t = 9100)]
        metrics_port: u16,

        /// Milliseconds between reaper passes
        #[arg(long, default_value_t = 500)]
        reap_interval_ms: u64,

        /// Unlink a stale segment of the same name first
        #[arg(short, long)]
        force: bool,
    },

    /// Remove the segment
    Down,

    /// Publish an incrementing counter
    Publish {
        /// Service as service/instance/event
        #[arg(short, long, default_value = DEFAULT_SERVICE)]
        service: String,

        /// Milliseconds between samples
        #[arg(short, long, default_value_t = 1000)]
        interval_ms: u64,

        /// Stop after this many samples
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },

    /// Print counters received from publishers
    Subscribe {
        /// Service as service/instance/event
        #[arg(short, long, default_value = DEFAULT_SERVICE)]
        service: String,

        /// Stop after this many samples
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },

    /// Show pool and port statistics as JSON
    Stats {
        /// Watch mode - print a snapshot every second
        #[arg(short, long)]
        watch: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

/// Shutdown flag fed by Ctrl-C; long-running commands poll or await it.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let shutdown = shutdown_signal();

    // Dispatch to command handlers
    match cli.command {
        Commands::Up {
            metrics_port,
            reap_interval_ms,
            force,
        } => {
            commands::up::execute(&cli.config, metrics_port, reap_interval_ms, force, shutdown)
                .await
        }
        Commands::Down => commands::down::execute(&cli.config).await,
        Commands::Publish {
            service,
            interval_ms,
            count,
        } => commands::publish::execute(&cli.config, &service, interval_ms, count, shutdown).await,
        Commands::Subscribe { service, count } => {
            commands::subscribe::execute(&cli.config, &service, count, shutdown).await
        }
        Commands::Stats { watch } => commands::stats::execute(&cli.config, watch, shutdown).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
