//! One polling cycle over the chip array.
//!
//! [`ScanCycle`] holds the state that survives between polls: the rotating
//! load offset, window timing and starvation counters. Each call to
//! [`ScanCycle::run`] does, in order:
//!
//! 1. drain every chip's results,
//! 2. load work into idle chips, round robin from the rotating offset,
//! 3. write the batch to the bus,
//! 4. drain again,
//! 5. close the statistics window if it elapsed, running the clock
//!    controller for every chip.
//!
//! Draining before loading keeps a chip's results from being attributed to
//! work loaded in the same cycle.

use std::time::{Duration, Instant};

use crate::autoclock::AutoClockController;
use crate::bus::{ChipBus, ChipLoad};
use crate::chip::clock::ema;
use crate::chip::{Chip, LoadOutcome};
use crate::prefetch::PrefetchQueue;
use crate::stats::{long_window_totals, WindowSummary};
use crate::tracing::prelude::*;
use crate::types::ChipKey;
use crate::work::WorkQueue;

/// EMA weight of the poll interval.
const CALL_PERIOD_WEIGHT: f64 = 0.001;

/// Length of the long statistics window.
pub const LONG_WINDOW: Duration = Duration::from_secs(900);

/// Starvation is logged on every this many occurrences.
const STARVATION_LOG_EVERY: u64 = 10;

/// What a single poll did.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Hashes represented by the results accepted in this cycle
    pub hashes: u64,
    /// Chips that received new work
    pub loaded: usize,
    /// The load round ran out of work
    pub starved: bool,
    /// Set when this cycle closed a statistics window
    pub window: Option<WindowSummary>,
}

#[derive(Debug)]
pub struct ScanCycle {
    controller: AutoClockController,
    next_chip: usize,
    cycles: u64,
    windows: u64,
    window_started: Option<Instant>,
    long_window_started: Option<Instant>,
    last_poll: Option<Instant>,
    /// Smoothed poll interval, microseconds
    call_period_us: f64,
    polls_in_window: u64,
    starved_in_window: u64,
    starved_total: u64,
}

impl ScanCycle {
    pub fn new(controller: AutoClockController) -> Self {
        Self {
            controller,
            next_chip: 0,
            cycles: 0,
            windows: 0,
            window_started: None,
            long_window_started: None,
            last_poll: None,
            call_period_us: 0.0,
            polls_in_window: 0,
            starved_in_window: 0,
            starved_total: 0,
        }
    }

    pub fn controller(&self) -> &AutoClockController {
        &self.controller
    }

    /// Polls run since startup.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Statistics windows closed since startup.
    pub fn windows(&self) -> u64 {
        self.windows
    }

    /// Index of the chip the next load round starts at.
    pub fn next_chip(&self) -> usize {
        self.next_chip
    }

    pub fn run<B: ChipBus>(
        &mut self,
        chips: &mut [Chip],
        bus: &mut B,
        prefetch: &PrefetchQueue,
        host: &dyn WorkQueue,
        now: Instant,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        self.cycles += 1;
        self.polls_in_window += 1;
        self.track_call_period(now);

        report.hashes += drain(chips, bus, host, now);
        self.load_round(chips, prefetch, host, now, &mut report);

        let loads: Vec<ChipLoad<'_>> = chips
            .iter()
            .map(|chip| ChipLoad {
                chip: chip.key,
                work: chip.pipeline.current(),
            })
            .collect();
        bus.send_batch(&loads);

        report.hashes += drain(chips, bus, host, now);

        if self.cycles >= self.controller.params().warmup_cycles {
            let started = *self.window_started.get_or_insert(now);
            if now.saturating_duration_since(started) >= self.controller.params().window {
                let mut summary = self.close_window(chips, bus, now);
                summary.prefetched = prefetch.occupied();
                report.window = Some(summary);
            }
        }

        report
    }

    fn track_call_period(&mut self, now: Instant) {
        if let Some(last) = self.last_poll {
            if self.cycles > 2 {
                let us = now.saturating_duration_since(last).as_secs_f64() * 1e6;
                self.call_period_us = ema(self.call_period_us, us, CALL_PERIOD_WEIGHT);
            }
        }
        self.last_poll = Some(now);
    }

    fn load_round(
        &mut self,
        chips: &mut [Chip],
        prefetch: &PrefetchQueue,
        host: &dyn WorkQueue,
        now: Instant,
        report: &mut CycleReport,
    ) {
        if chips.is_empty() {
            return;
        }
        for _ in 0..chips.len() {
            let chip = &mut chips[self.next_chip];
            let supply = || prefetch.take().or_else(|| host.take_work());
            match chip.pipeline.try_load(supply, now) {
                LoadOutcome::Loaded => report.loaded += 1,
                LoadOutcome::AlreadyBusy => {}
                LoadOutcome::NoWorkAvailable => {
                    report.starved = true;
                    self.starved_in_window += 1;
                    self.starved_total += 1;
                    if self.starved_total % STARVATION_LOG_EVERY == 0 {
                        warn!(
                            chip = %chip.key,
                            cycle = self.cycles,
                            prefetched = prefetch.occupied(),
                            occurrences = self.starved_total,
                            "No work available for chip."
                        );
                    }
                    return;
                }
            }
            self.next_chip = (self.next_chip + 1) % chips.len();
        }
    }

    fn close_window<B: ChipBus>(
        &mut self,
        chips: &mut [Chip],
        bus: &mut B,
        now: Instant,
    ) -> WindowSummary {
        self.windows += 1;
        let window = self.windows;
        let started = self.window_started.replace(now).unwrap_or(now);

        let mut rates: Vec<(ChipKey, f64)> = Vec::with_capacity(chips.len());
        for chip in chips.iter_mut() {
            let sample = self.controller.measure(chip, now);
            let verdict = self.controller.evaluate(chip, sample, window, now);
            self.controller.apply(chip, verdict, bus, now);
            rates.push((chip.key, sample.ghash));
        }

        let mut summary = WindowSummary::new(window, now.saturating_duration_since(started), &rates);
        summary.polls = std::mem::take(&mut self.polls_in_window);
        summary.starved = std::mem::take(&mut self.starved_in_window);
        summary.call_period = Duration::from_secs_f64(self.call_period_us / 1e6);
        let every = self.controller.params().decision_every.max(1);
        summary.persist = window >= every && window % every == 0;

        let long_started = *self.long_window_started.get_or_insert(started);
        if now.saturating_duration_since(long_started) >= LONG_WINDOW {
            summary.long = Some(long_window_totals(chips, now, LONG_WINDOW));
            self.long_window_started = Some(now);
        }

        summary
    }
}

/// Read every chip's results and advance its pipeline.
///
/// A reclock requested since the last drain is applied once the chip's
/// readout has been processed.
fn drain<B: ChipBus>(chips: &mut [Chip], bus: &mut B, host: &dyn WorkQueue, now: Instant) -> u64 {
    let mut hashes = 0;
    for readout in bus.read_results() {
        let Some(chip) = chips.iter_mut().find(|c| c.key == readout.chip) else {
            warn!(chip = %readout.chip, "Readout from unknown chip.");
            continue;
        };
        hashes += chip
            .pipeline
            .advance(chip.key, &readout, &mut chip.results, host, now);
        chip.results.add_hardware_errors(readout.hardware_errors);
        if let Some(bits) = chip.take_reclock(now) {
            info!(chip = %chip.key, bits = %bits, "Reclocking chip.");
            bus.apply_clock(chip.key, bits);
        }
    }
    hashes
}
