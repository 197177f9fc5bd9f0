//! Daemon lifecycle management for bitfury-miner.
//!
//! Owns the host work queue, starts the scan thread and the async tasks
//! that feed and watch it, and tears everything down on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::{ClockOverrides, DriverConfig};
use crate::driver::BitfuryDriver;
use crate::prefetch::PrefetchQueue;
use crate::sim::SimBus;
use crate::tracing::prelude::*;
use crate::work::{HostQueue, Work};
use crate::worker::ArrayWorker;

/// How often the host refills its queue and tops up the prefetch buffer.
const FILL_INTERVAL: Duration = Duration::from_millis(10);

/// Host queue depth kept per chip.
const HOST_ITEMS_PER_CHIP: usize = 2;

/// What to run and how.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Simulated array geometry
    pub slots: u8,
    pub chips_per_slot: u8,
    pub clock: ClockOverrides,
    pub config: DriverConfig,
    /// Period of the status log line
    pub status_interval: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            slots: 1,
            chips_per_slot: 16,
            clock: ClockOverrides::default(),
            config: DriverConfig::default(),
            status_interval: Duration::from_secs(30),
        }
    }
}

/// The main daemon.
pub struct Daemon {
    options: DaemonOptions,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(options: DaemonOptions) -> Self {
        Self {
            options,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Token that stops the daemon when cancelled, as a signal would.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let options = self.options;
        let host = Arc::new(HostQueue::new());

        let bus = SimBus::new(options.slots, options.chips_per_slot);
        let mut driver = BitfuryDriver::new(bus, host.clone(), &options.config)?;
        let chip_count = driver.chips().len();
        driver.prepare(&options.clock);
        let prefetch = Arc::clone(driver.prefetch());

        info!(
            chips = chip_count,
            autoclock = options.config.autoclock,
            prefetch = prefetch.capacity(),
            "Chip array ready."
        );

        let worker = ArrayWorker::spawn("array", driver, options.config.scan_delay)?;
        let worker = Arc::new(worker);

        // Host side: keep synthetic work queued and the prefetch buffer full
        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            let host = host.clone();
            let prefetch = Arc::clone(&prefetch);
            async move {
                let mut next_id = 0u64;
                let mut interval = tokio::time::interval(FILL_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            next_id = fill_host(&host, &prefetch, chip_count, next_id);
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        });

        // Periodic status line
        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            let worker = Arc::clone(&worker);
            let status_interval = options.status_interval;
            async move {
                let mut interval = tokio::time::interval(status_interval);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let status = worker.status();
                            match status.stats {
                                Some(stats) => info!(
                                    cycles = status.cycles,
                                    hashrate = %stats.hashrate(),
                                    hw_errors = stats.total_hw,
                                    windows = stats.windows,
                                    "Mining status."
                                ),
                                None => info!(cycles = status.cycles, "Warming up."),
                            }
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        });

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=bitfury_miner=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
            _ = self.shutdown.cancelled() => {}
        }

        self.shutdown.cancel();
        self.tracker.wait().await;

        // The async tasks are gone, so this is the last handle
        let worker = Arc::into_inner(worker)
            .ok_or_else(|| anyhow::anyhow!("scan worker still shared at shutdown"))?;
        let final_status = tokio::task::spawn_blocking(move || worker.join()).await?;
        if let Some(stats) = &final_status.stats {
            info!(
                hashrate = %stats.hashrate(),
                hw_errors = stats.total_hw,
                "Final statistics."
            );
            debug!(stats = %serde_json::to_string(stats)?, "Final per-chip statistics.");
        }
        info!(returned = host.completed_ids().len(), "Exiting.");

        Ok(())
    }
}

/// Top the host queue up to its target depth, then feed the prefetch
/// buffer until it reports full. Returns the next unused work id.
fn fill_host(host: &HostQueue, prefetch: &PrefetchQueue, chips: usize, mut next_id: u64) -> u64 {
    let target = chips * HOST_ITEMS_PER_CHIP;
    while host.pending_len() < target {
        host.push(Work::synthetic(next_id));
        next_id += 1;
    }
    for _ in 0..prefetch.capacity() {
        if prefetch.fill(host) {
            break;
        }
    }
    next_id
}
