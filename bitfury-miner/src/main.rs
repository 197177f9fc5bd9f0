use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use bitfury_miner::config::{ClockOverrides, DriverConfig};
use bitfury_miner::daemon::{Daemon, DaemonOptions};
use bitfury_miner::tracing::{self, prelude::*};

/// Adaptive clock control for Bitfury chip arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Clock option: a bare setting for all chips and/or slot:position:bits pins
    #[arg(long, env = "BITFURY_CLOCK_BITS", default_value = "")]
    clock_bits: String,

    /// Number of slots in the array
    #[arg(long, env = "BITFURY_SLOTS", default_value_t = 1)]
    slots: u8,

    /// Chips per slot
    #[arg(long, env = "BITFURY_CHIPS", default_value_t = 16)]
    chips: u8,

    /// Clock record file (overrides BITFURY_RECORD)
    #[arg(long)]
    record: Option<PathBuf>,

    /// Do not persist clock tables
    #[arg(long, conflicts_with = "record")]
    no_record: bool,

    /// Keep every chip at its initial setting
    #[arg(long)]
    no_autoclock: bool,

    /// Seconds between status lines
    #[arg(long, default_value_t = 30)]
    status_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing::init_journald_or_stdout();

    let mut config = DriverConfig::from_env();
    if let Some(path) = args.record {
        config.record_path = Some(path);
    }
    if args.no_record {
        config.record_path = None;
    }
    if args.no_autoclock {
        config.autoclock = false;
    }

    let clock = ClockOverrides::parse(&args.clock_bits);
    if !clock.is_empty() {
        info!(default = ?clock.default, pinned = clock.chips.len(), "Clock option applied.");
    }

    let options = DaemonOptions {
        slots: args.slots,
        chips_per_slot: args.chips,
        clock,
        config,
        status_interval: Duration::from_secs(args.status_secs.max(1)),
    };
    Daemon::new(options)
        .run()
        .await
        .context("bitfury-miner daemon failed")
}
