//! The driver: one chip array, its host queue and its tuning state.
//!
//! [`BitfuryDriver`] is the single entry point the worker talks to:
//! [`prepare`](BitfuryDriver::prepare) once, then
//! [`poll_once`](BitfuryDriver::poll_once) in a loop, and finally
//! [`shutdown`](BitfuryDriver::shutdown). Statistics are available at any
//! time through [`export_stats`](BitfuryDriver::export_stats).

use std::sync::Arc;
use std::time::Instant;

use crate::autoclock::{AutoClockController, ControllerState, TuningState};
use crate::bus::ChipBus;
use crate::chip::clock::{ClockState, DEFAULT_CLOCK_BITS};
use crate::chip::Chip;
use crate::config::{ClockOverrides, DriverConfig};
use crate::error::{Error, Result};
use crate::persist::RecordStore;
use crate::prefetch::PrefetchQueue;
use crate::scan::{CycleReport, ScanCycle};
use crate::stats::DriverStats;
use crate::tracing::prelude::*;
use crate::types::ChipKey;
use crate::work::WorkQueue;

pub struct BitfuryDriver<B: ChipBus> {
    bus: B,
    host: Arc<dyn WorkQueue>,
    prefetch: Arc<PrefetchQueue>,
    chips: Vec<Chip>,
    scan: ScanCycle,
    record: Option<RecordStore>,
    autoclock: bool,
    shut_down: bool,
}

impl<B: ChipBus> BitfuryDriver<B> {
    /// Detect the chips on `bus` and set up per-chip state.
    pub fn new(mut bus: B, host: Arc<dyn WorkQueue>, config: &DriverConfig) -> Result<Self> {
        let keys = bus.detect();
        if keys.is_empty() {
            return Err(Error::NoChips);
        }

        let now = Instant::now();
        let chips: Vec<Chip> = keys
            .into_iter()
            .map(|key| Chip::new(key, DEFAULT_CLOCK_BITS, now))
            .collect();
        info!(chips = chips.len(), "Chip array detected.");

        Ok(Self {
            bus,
            host,
            prefetch: Arc::new(PrefetchQueue::new(config.prefetch_capacity, chips.len())),
            chips,
            scan: ScanCycle::new(
                AutoClockController::new(config.tuning.clone()).with_autoclock(config.autoclock),
            ),
            record: config.record_path.clone().map(RecordStore::new),
            autoclock: config.autoclock,
            shut_down: false,
        })
    }

    /// Bring every chip up before the first poll.
    ///
    /// Chips are re-initialised at the default setting. Then, in order of
    /// precedence from lowest: the bare default from `overrides`, the
    /// persisted clock tables, and the per-chip pins (which also lock the
    /// chip). Pending setting changes are applied right away.
    pub fn prepare(&mut self, overrides: &ClockOverrides) {
        self.prepare_at(overrides, Instant::now());
    }

    pub fn prepare_at(&mut self, overrides: &ClockOverrides, now: Instant) {
        for chip in &mut self.chips {
            self.bus.reinit(chip.key, DEFAULT_CLOCK_BITS);
            chip.clock = ClockState::new(DEFAULT_CLOCK_BITS, now);
            if let Some(bits) = overrides.default {
                chip.clock.requested = bits;
            }
        }

        for &(key, bits) in &overrides.chips {
            match self.chip_mut(key) {
                Some(chip) => {
                    chip.clock.requested = bits;
                    chip.clock.locked = true;
                    info!(chip = %key, bits = %bits, "Clock pinned.");
                }
                None => warn!(error = %Error::UnknownChip(key), "Ignoring clock pin."),
            }
        }

        self.load_record();

        for chip in &mut self.chips {
            if !self.autoclock {
                chip.clock.locked = true;
            }
            if let Some(bits) = chip.take_reclock(now) {
                self.bus.apply_clock(chip.key, bits);
            }
            // The initial setting is not an exploration trial
            chip.tuning = TuningState::default();
            if chip.clock.locked {
                chip.tuning.state = ControllerState::Locked;
            }
        }
    }

    fn load_record(&mut self) {
        let Some(store) = &self.record else {
            return;
        };
        let record = match store.load() {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %store.path().display(), error = %e, "Failed to load clock record.");
                return;
            }
        };
        if !record.is_empty() {
            info!(path = %store.path().display(), chips = record.len(), "Clock record loaded.");
        }
        for (key, table) in record {
            match self.chips.iter_mut().find(|c| c.key == key) {
                Some(chip) => chip.seed(table),
                None => debug!(chip = %key, "Clock record for absent chip."),
            }
        }
    }

    /// Run one scan cycle now.
    pub fn poll_once(&mut self) -> CycleReport {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> CycleReport {
        let report = self.scan.run(
            &mut self.chips,
            &mut self.bus,
            &self.prefetch,
            self.host.as_ref(),
            now,
        );
        if let Some(summary) = &report.window {
            summary.log();
            if summary.persist {
                self.persist();
            }
        }
        report
    }

    /// Write every chip's clock table to the record, if one is configured.
    pub fn persist(&self) {
        let Some(store) = &self.record else {
            return;
        };
        match store.save(self.chips.iter().map(|c| (c.key, &c.table))) {
            Ok(()) => debug!(path = %store.path().display(), "Clock record saved."),
            Err(e) => warn!(path = %store.path().display(), error = %e, "Failed to save clock record."),
        }
    }

    /// Power the array down and hand all work back to the host.
    ///
    /// Terminal: polling after shutdown does nothing useful. Calling it
    /// twice is harmless.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let mut returned = 0;
        for chip in &mut self.chips {
            self.bus.shutdown(chip.key);
            for work in chip.pipeline.drain() {
                self.host.report_complete(work);
                returned += 1;
            }
        }
        returned += self.prefetch.drain_into(self.host.as_ref());
        self.persist();
        info!(returned, "Chip array shut down.");
    }

    pub fn export_stats(&self) -> DriverStats {
        self.export_stats_at(Instant::now())
    }

    pub fn export_stats_at(&self, now: Instant) -> DriverStats {
        DriverStats::export(&self.chips, self.prefetch.occupied(), self.scan.windows(), now)
    }

    pub fn chips(&self) -> &[Chip] {
        &self.chips
    }

    pub fn chip(&self, key: ChipKey) -> Option<&Chip> {
        self.chips.iter().find(|c| c.key == key)
    }

    fn chip_mut(&mut self, key: ChipKey) -> Option<&mut Chip> {
        self.chips.iter_mut().find(|c| c.key == key)
    }

    /// Buffer the host fills from its own context.
    pub fn prefetch(&self) -> &Arc<PrefetchQueue> {
        &self.prefetch
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}
