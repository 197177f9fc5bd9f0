//! Per-chip state: clock, tuning table, work pipeline and results.
//!
//! A [`Chip`] is created for every detected chip when the driver starts and
//! lives for the lifetime of the process. Everything the scan worker knows
//! about a chip is stored here; nothing is kept in globals.

pub mod clock;
pub mod pipeline;
pub mod results;

use std::time::Instant;

pub use clock::{ClockState, ClockTable, RateHistogram};
pub use pipeline::{LoadOutcome, Pipeline};
pub use results::ResultLog;

use crate::autoclock::TuningState;
use crate::types::{ChipKey, ClockBits};

#[derive(Debug)]
pub struct Chip {
    pub key: ChipKey,
    pub clock: ClockState,
    pub table: ClockTable,
    pub tuning: TuningState,
    pub pipeline: Pipeline,
    pub results: ResultLog,
    /// EMA of the hardware error percentage per window
    pub hw_error_rate: f64,
    /// Throughput measured in the most recent statistics window, GH/s
    pub last_rate: f64,
    /// Settled rates seen at each candidate setting
    pub rate_history: RateHistogram,
    /// Histogram mean of the active setting, GH/s; zero until known
    pub eff_speed: f64,
}

impl Chip {
    pub fn new(key: ChipKey, bits: ClockBits, now: Instant) -> Self {
        Self {
            key,
            clock: ClockState::new(bits, now),
            table: ClockTable::default(),
            tuning: TuningState::default(),
            pipeline: Pipeline::new(),
            results: ResultLog::new(),
            hw_error_rate: 0.0,
            last_rate: 0.0,
            rate_history: RateHistogram::default(),
            eff_speed: 0.0,
        }
    }

    /// Apply a pending setting change to the chip's bookkeeping.
    ///
    /// Returns the new setting when the hardware must be reclocked. The clock
    /// table is kept: its entries belong to the settings they were measured
    /// at. Only the rate normalisation window restarts.
    pub fn take_reclock(&mut self, now: Instant) -> Option<ClockBits> {
        if !self.clock.reclock_pending() {
            return None;
        }
        self.clock.active = self.clock.requested;
        self.clock.last_reset = now;
        self.tuning.switch_count += 1;
        self.tuning.cycles_since_switch = 0;
        Some(self.clock.active)
    }

    /// Table index of the active setting, if it is a candidate.
    pub fn active_index(&self) -> Option<usize> {
        ClockTable::index_of(self.clock.active)
    }

    /// Seed tuning state from a persisted table.
    ///
    /// Unless the chip is locked, the setting chosen most often in the past
    /// becomes the requested setting.
    pub fn seed(&mut self, table: ClockTable) {
        self.table = table;
        if self.clock.locked {
            return;
        }
        if let Some(best) = self.table.most_selected() {
            self.clock.requested = ClockTable::bits_of(best);
        }
    }
}
