//! Dedicated scan thread.
//!
//! Polling a chip array is blocking, timing-sensitive work, so it runs on
//! its own `std::thread` rather than on the async runtime. The daemon keeps
//! an [`ArrayWorker`] handle to read status and to stop the thread.

use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, PoisonError, RwLock,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::bus::ChipBus;
use crate::config::SLOW_POLL;
use crate::driver::BitfuryDriver;
use crate::stats::DriverStats;
use crate::tracing::prelude::*;

/// Status published by the scan thread.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    /// Polls run so far
    pub cycles: u64,
    /// Hashes credited by accepted results
    pub hashes: u64,
    /// Snapshot taken at the end of the last statistics window
    pub stats: Option<DriverStats>,
    /// The driver has been shut down and the thread is about to exit
    pub finished: bool,
}

pub struct ArrayWorker {
    name: String,
    status: Arc<RwLock<WorkerStatus>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ArrayWorker {
    /// Start polling `driver` every `scan_delay` on a new thread.
    ///
    /// The driver must already be prepared. It is shut down on the scan
    /// thread when the worker is stopped.
    pub fn spawn<B>(name: &str, driver: BitfuryDriver<B>, scan_delay: Duration) -> io::Result<Self>
    where
        B: ChipBus + 'static,
    {
        let status = Arc::new(RwLock::new(WorkerStatus::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = std::thread::Builder::new().name(format!("scan-{}", name)).spawn({
            let status = Arc::clone(&status);
            let shutdown = Arc::clone(&shutdown);
            move || scan_loop(driver, scan_delay, status, shutdown)
        })?;

        Ok(Self {
            name: name.to_string(),
            status,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ask the scan thread to stop after its current poll.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Stop the scan thread and wait for it to power the array down.
    ///
    /// Returns the last published status.
    pub fn join(mut self) -> WorkerStatus {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "Scan thread panicked.");
            }
        }
        self.status()
    }
}

impl Drop for ArrayWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scan_loop<B: ChipBus>(
    mut driver: BitfuryDriver<B>,
    scan_delay: Duration,
    status: Arc<RwLock<WorkerStatus>>,
    shutdown: Arc<AtomicBool>,
) {
    debug!(scan_delay_ms = scan_delay.as_millis() as u64, "Scan thread started.");

    while !shutdown.load(Ordering::Relaxed) {
        let started = Instant::now();
        let report = driver.poll_at(started);
        let stats = report.window.is_some().then(|| driver.export_stats());

        {
            let mut status = status.write().unwrap_or_else(PoisonError::into_inner);
            status.cycles += 1;
            status.hashes += report.hashes;
            if stats.is_some() {
                status.stats = stats;
            }
        }

        let took = started.elapsed();
        if took > SLOW_POLL {
            warn!(took_ms = took.as_millis() as u64, "Slow poll.");
        }
        if let Some(rest) = scan_delay.checked_sub(took) {
            std::thread::sleep(rest);
        }
    }

    driver.shutdown();
    let final_stats = driver.export_stats();
    let mut status = status.write().unwrap_or_else(PoisonError::into_inner);
    status.stats = Some(final_stats);
    status.finished = true;
    debug!("Scan thread exiting.");
}
