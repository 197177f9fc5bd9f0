//! Per-chip result bookkeeping: duplicate filter and submission log.

use std::time::{Duration, Instant};

use crate::ring::Ring;

/// Depth of the duplicate filter.
///
/// This guards against a chip re-reporting a nonce around a job boundary. It
/// is not a long-run uniqueness guarantee.
pub const NONCE_HISTORY: usize = 32;

/// Number of submission timestamps kept for windowed rate queries.
pub const STAT_N: usize = 1024;

/// Accepted-result history of one chip.
#[derive(Debug, Clone, Default)]
pub struct ResultLog {
    nonces: Ring<u32, NONCE_HISTORY>,
    submissions: Ring<Instant, STAT_N>,
    /// Results accepted since startup
    pub matching_results: u64,
    /// Of those, results the host refused
    pub rejected_results: u64,
    /// Hardware errors reported since the last statistics window
    pub hardware_errors: u32,
    /// Hardware errors reported since startup
    pub hardware_errors_total: u64,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `nonce` unless it is among the last accepted ones.
    ///
    /// Returns `false` for a duplicate, leaving the log untouched. Otherwise
    /// the nonce enters the history and a submission timestamp is logged.
    pub fn accept(&mut self, nonce: u32, now: Instant) -> bool {
        if self.nonces.contains(&nonce) {
            return false;
        }
        self.nonces.push(nonce);
        self.submissions.push(now);
        true
    }

    /// Results accepted within `window` before `now`.
    pub fn results_within(&self, now: Instant, window: Duration) -> usize {
        self.submissions
            .iter()
            .filter(|&&ts| now.saturating_duration_since(ts) < window)
            .count()
    }

    pub fn add_hardware_errors(&mut self, count: u32) {
        self.hardware_errors = self.hardware_errors.saturating_add(count);
        self.hardware_errors_total += u64::from(count);
    }

    /// Take the per-window hardware error count, resetting it.
    pub fn take_hardware_errors(&mut self) -> u32 {
        std::mem::take(&mut self.hardware_errors)
    }
}
