// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rendezvous relay for SDR I/Q streams.
//!
//! A single always-on process that fans a producer's sample stream out to
//! many consumers, bridges a paired control channel, hands producers a
//! private port pair through a rendezvous handshake, and tracks which
//! edge nodes advertise which services.
//!
//! # Usage
//!
//! ```bash
//! # Start the full relay on its default ports
//! sdr-relay
//!
//! # Minimal three-port deployment, no registry or rendezvous
//! sdr-relay --mode dumb-pipe
//!
//! # Load settings from a config file
//! sdr-relay --config relay.json
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod server;

pub use config::RelayConfig;
pub use server::Relay;

use config::Mode;

/// Rendezvous relay for SDR I/Q streams.
#[derive(Parser, Debug)]
#[command(name = "sdr-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Deployment shape: full (five ports) or dumb-pipe (three ports, no registry/rendezvous)
    #[arg(long, value_enum, default_value = "full")]
    mode: ModeArg,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// EdgeNode / SplitterSlot idle timeout in seconds
    #[arg(long, default_value = "120")]
    lease_duration: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ModeArg {
    Full,
    DumbPipe,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Full => Mode::Full,
            ModeArg::DumbPipe => Mode::DumbPipe,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        RelayConfig::from_file(&config_path)?
    } else {
        RelayConfig {
            bind_address: args.bind.parse()?,
            mode: args.mode.into(),
            lease_duration_secs: args.lease_duration,
            ..Default::default()
        }
    };

    info!("+----------------------------------------------------+");
    info!(
        "|       SDR Rendezvous Relay v{}                |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:   {:40} |", config.bind_address);
    info!(
        "|  Mode:   {:40} |",
        match config.mode {
            Mode::Full => "full",
            Mode::DumbPipe => "dumb-pipe",
        }
    );
    info!("|  Lease:  {:40} |", format!("{}s", config.lease_duration_secs));
    info!("+----------------------------------------------------+");

    let relay = Relay::new(config).await?;

    let relay_handle = relay.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping relay...");
        relay_handle.shutdown().await;
    });

    relay.run().await?;

    info!("Relay stopped");
    Ok(())
}
