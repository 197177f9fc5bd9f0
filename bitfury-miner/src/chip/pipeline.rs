//! Triple-buffered work slots of one chip.
//!
//! A chip hashes its work with some latency: results for a work item surface
//! one or two job switches after it was written. The pipeline therefore keeps
//! the two previously loaded items alive and attributes results to them:
//!
//! ```text
//!   load        job switch              job switch
//!    │              │                        │
//!    ▼              ▼                        ▼
//! current ──► previous ──────────► two_back ──────► report_complete
//! ```
//!
//! A normal result belongs to `previous`; an "old" tagged result to
//! `two_back`; a "future" tagged result to `current`.

use std::time::Instant;

use super::clock::ema;
use super::results::ResultLog;
use crate::bus::ChipReadout;
use crate::tracing::prelude::*;
use crate::types::{ChipKey, HASHES_PER_RESULT};
use crate::work::{Submission, Work, WorkQueue};

/// EMA weight for cycle and wait time medians (~150-sample time constant).
pub const TIMING_EMA_WEIGHT: f64 = 0.007;

/// Wait-time samples at or above this many microseconds are outliers.
pub const MAX_WAIT_SAMPLE_US: f64 = 1_000_000.0;

/// Result of trying to load work into a chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    AlreadyBusy,
    NoWorkAvailable,
}

#[derive(Debug, Default)]
pub struct Pipeline {
    current: Option<Work>,
    previous: Option<Work>,
    two_back: Option<Work>,
    work_started_at: Option<Instant>,
    work_finished_at: Option<Instant>,
    /// EMA of load-to-eviction time, microseconds
    pub median_cycle_time: f64,
    /// EMA of idle time between an eviction and the next load, microseconds
    pub median_wait_time: f64,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Work> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&Work> {
        self.previous.as_ref()
    }

    pub fn two_back(&self) -> Option<&Work> {
        self.two_back.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Number of work items the chip currently owns.
    pub fn live(&self) -> usize {
        [&self.current, &self.previous, &self.two_back]
            .iter()
            .filter(|w| w.is_some())
            .count()
    }

    /// Load one work item from `supply` if the chip is idle.
    pub fn try_load(
        &mut self,
        supply: impl FnOnce() -> Option<Work>,
        now: Instant,
    ) -> LoadOutcome {
        if self.current.is_some() {
            return LoadOutcome::AlreadyBusy;
        }
        let Some(work) = supply() else {
            return LoadOutcome::NoWorkAvailable;
        };

        self.current = Some(work);
        self.work_started_at = Some(now);

        if let Some(finished) = self.work_finished_at {
            let gap = now.saturating_duration_since(finished).as_secs_f64() * 1e6;
            if gap > 0.0 && gap < MAX_WAIT_SAMPLE_US {
                self.median_wait_time = ema(self.median_wait_time, gap, TIMING_EMA_WEIGHT);
            }
        }

        LoadOutcome::Loaded
    }

    /// Process one readout from the chip.
    ///
    /// On a job switch, attributes the reported nonces, evicts the oldest
    /// work upstream and shifts the slots. Returns the number of hashes the
    /// accepted nonces stand for.
    pub fn advance(
        &mut self,
        key: ChipKey,
        readout: &ChipReadout,
        log: &mut ResultLog,
        host: &dyn WorkQueue,
        now: Instant,
    ) -> u64 {
        if !readout.job_switched {
            return 0;
        }
        if self.current.is_none() {
            trace!(chip = %key, "Job switch without current work ignored");
            return 0;
        }

        let mut accepted = 0u64;

        for &nonce in readout.results.iter().rev() {
            if let Some(work) = self.previous.as_ref().or(self.two_back.as_ref()) {
                accepted += u64::from(submit(log, host, work, nonce, now));
            }
        }
        if let (Some(nonce), Some(work)) = (readout.old_nonce, self.two_back.as_ref()) {
            accepted += u64::from(submit(log, host, work, nonce, now));
        }
        if let (Some(nonce), Some(work)) = (readout.future_nonce, self.current.as_ref()) {
            accepted += u64::from(submit(log, host, work, nonce, now));
        }

        if let Some(evicted) = self.two_back.take() {
            if let Some(started) = self.work_started_at {
                let took = now.saturating_duration_since(started).as_secs_f64() * 1e6;
                self.median_cycle_time = ema(self.median_cycle_time, took, TIMING_EMA_WEIGHT);
            }
            self.work_finished_at = Some(now);
            host.report_complete(evicted);
        }

        self.two_back = self.previous.take();
        self.previous = self.current.take();

        log.matching_results += accepted;
        accepted * HASHES_PER_RESULT
    }

    /// Remove every work item, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Work> {
        [self.two_back.take(), self.previous.take(), self.current.take()]
            .into_iter()
            .flatten()
    }
}

/// De-duplicate `nonce` and forward it upstream if new.
fn submit(log: &mut ResultLog, host: &dyn WorkQueue, work: &Work, nonce: u32, now: Instant) -> bool {
    if !log.accept(nonce, now) {
        trace!(work_id = work.id, nonce = format!("{:#010x}", nonce), "Duplicate nonce");
        return false;
    }
    if host.submit_result(nonce, work) == Submission::Rejected {
        log.rejected_results += 1;
        debug!(work_id = work.id, nonce = format!("{:#010x}", nonce), "Result rejected by host");
    }
    true
}
