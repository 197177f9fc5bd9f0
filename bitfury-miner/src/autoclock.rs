//! Adaptive per-chip oscillator tuning.
//!
//! Once per statistics window the controller measures each chip's accepted
//! result rate, folds it into the chip's [`ClockTable`] entry for the active
//! setting, and watches for a chip that stopped producing. Every
//! [`TuningParams::decision_every`] windows it decides whether to keep the
//! setting, try another one, or settle on the best one measured so far:
//!
//! ```text
//!            explore (round robin)          argmax(rate_estimate)
//!  Exploring ─────────────────────► Exploring ─────────────────► Converged
//!      ▲                                                            │
//!      │    restart: rate in (fault_rate, low_rate)                 │
//!      └────────────────────────────────────────────────────────────┘
//!
//!  any chip: 4 consecutive low windows ──► Faulted ──► recover ──► Exploring
//! ```
//!
//! Settled windows also feed a per-setting rate histogram. At a decision
//! window its mean replaces the active setting's estimate, and a locked chip
//! whose mean stays under [`TuningParams::low_rate`] is handed back to the
//! tuner.

use std::time::{Duration, Instant};

use strum::Display;

use crate::bus::ChipBus;
use crate::chip::clock::{FALLBACK_CLOCK_BITS, SETTING_COUNT};
use crate::chip::{Chip, ClockTable};
use crate::tracing::prelude::*;
use crate::types::{results_to_ghashes, ClockBits};

/// Tuning constants.
///
/// These are empirically chosen values; the `Default` impl carries the
/// numbers the hardware was tuned with.
#[derive(Debug, Clone)]
pub struct TuningParams {
    /// Length of one statistics window
    pub window: Duration,
    /// A setting decision is made every this many windows
    pub decision_every: u64,
    /// Rate EMA weight while the chip is still settling after a switch
    pub fast_weight: f64,
    /// Rate EMA weight once settled
    pub settled_weight: f64,
    /// Windows after a switch before the slow weight applies
    pub settle_windows: u32,
    /// Throughput (GH/s) at or below which a window counts as low
    pub fault_rate: f64,
    /// Windows since switch a chip must exceed before low windows count
    pub fault_min_windows: u32,
    /// Consecutive low windows that fault a chip
    pub fault_consecutive: u32,
    /// Throughput (GH/s) under which a settled chip restarts exploration
    pub low_rate: f64,
    /// Windows since switch a chip must exceed before it may restart
    pub restart_min_windows: u32,
    /// Windows since switch a chip must exceed before its smoothed rate
    /// enters the rate histogram
    pub histogram_min_windows: u32,
    /// Windows since switch after which a locked chip with a poor histogram
    /// rate is released to the tuner
    pub release_min_windows: u32,
    /// Upper bound for the elapsed time rates are normalised over
    pub elapsed_cap: Duration,
    /// Poll cycles without statistics after startup
    pub warmup_cycles: u64,
    /// EMA weight of the hardware error rate
    pub hw_error_weight: f64,
    /// Windows during which the hardware error rate is taken raw
    pub hw_error_raw_windows: u64,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(20),
            decision_every: 16,
            fast_weight: 1.0 / 32.0,
            settled_weight: 1.0 / 100.0,
            settle_windows: 32,
            fault_rate: 1.0,
            fault_min_windows: 31,
            fault_consecutive: 4,
            low_rate: 1.8,
            restart_min_windows: 32,
            histogram_min_windows: 12,
            release_min_windows: 50,
            elapsed_cap: Duration::from_secs(500),
            warmup_cycles: 10,
            hw_error_weight: 0.07,
            hw_error_raw_windows: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum ControllerState {
    #[default]
    Exploring,
    Converged,
    Locked,
    Faulted,
}

/// Tuning bookkeeping of one chip.
#[derive(Debug, Clone, Default)]
pub struct TuningState {
    pub state: ControllerState,
    /// Statistics windows since the last reclock or re-initialisation
    pub cycles_since_switch: u32,
    /// Setting changes since exploration (re)started
    pub switch_count: u32,
    /// Consecutive windows at or below the fault threshold
    pub consecutive_low_rate: u32,
}

/// Throughput observed for one chip over its rate normalisation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    /// Results accepted inside the window
    pub results: usize,
    /// Window length in seconds
    pub seconds: f64,
    /// Results converted to GH/s
    pub ghash: f64,
}

impl WindowSample {
    pub fn new(results: usize, seconds: f64) -> Self {
        Self {
            results,
            seconds,
            ghash: results_to_ghashes(results, seconds),
        }
    }
}

/// What the scan cycle has to do for a chip after a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Hold,
    Reclock(ClockBits),
    Faulted,
}

#[derive(Debug, Clone)]
pub struct AutoClockController {
    params: TuningParams,
    /// Tuning is enabled; when off, chips stay locked at their setting
    autoclock: bool,
}

impl Default for AutoClockController {
    fn default() -> Self {
        Self::new(TuningParams::default())
    }
}

impl AutoClockController {
    pub fn new(params: TuningParams) -> Self {
        Self {
            params,
            autoclock: true,
        }
    }

    pub fn with_autoclock(mut self, enabled: bool) -> Self {
        self.autoclock = enabled;
        self
    }

    pub fn params(&self) -> &TuningParams {
        &self.params
    }

    /// Throughput of `chip` since its last reset, capped to
    /// [`TuningParams::elapsed_cap`].
    pub fn measure(&self, chip: &Chip, now: Instant) -> WindowSample {
        let elapsed = now
            .saturating_duration_since(chip.clock.last_reset)
            .min(self.params.elapsed_cap);
        let results = chip.results.results_within(now, elapsed);
        WindowSample::new(results, elapsed.as_secs_f64())
    }

    /// Run one statistics window for `chip`.
    ///
    /// `window` counts windows since startup, starting at 1.
    pub fn evaluate(
        &self,
        chip: &mut Chip,
        sample: WindowSample,
        window: u64,
        now: Instant,
    ) -> Verdict {
        let p = &self.params;
        chip.tuning.cycles_since_switch += 1;
        chip.last_rate = sample.ghash;

        self.track_hardware_errors(chip, sample, window);

        // The first window after startup and any window cut short by a reset
        // do not describe the setting.
        let settled_for = now.saturating_duration_since(chip.clock.last_reset);
        if window > 1 && settled_for >= p.window {
            if let Some(index) = chip.active_index() {
                let weight = if chip.tuning.cycles_since_switch < p.settle_windows {
                    p.fast_weight
                } else {
                    p.settled_weight
                };
                chip.table.record(index, sample.ghash, weight);
            }
        }
        self.track_rate_history(chip);

        if chip.tuning.cycles_since_switch > p.fault_min_windows && sample.ghash <= p.fault_rate
        {
            chip.tuning.consecutive_low_rate += 1;
        } else {
            chip.tuning.consecutive_low_rate = 0;
        }
        if chip.tuning.consecutive_low_rate >= p.fault_consecutive {
            warn!(
                chip = %chip.key,
                ghash = format!("{:.2}", sample.ghash),
                windows = chip.tuning.consecutive_low_rate,
                "Chip underperforming, marking faulted."
            );
            chip.tuning.state = ControllerState::Faulted;
            return Verdict::Faulted;
        }

        let every = p.decision_every.max(1);
        let decision = window >= every && window % every == 0;
        if decision && chip.eff_speed > 0.0 {
            if let Some(index) = chip.active_index() {
                chip.table.rate_estimate[index] = chip.eff_speed;
            }
            self.release_if_poor(chip);
        }

        if chip.clock.locked {
            chip.tuning.state = ControllerState::Locked;
            return Verdict::Hold;
        }
        if !decision {
            return Verdict::Hold;
        }

        if chip.tuning.cycles_since_switch > p.restart_min_windows
            && sample.ghash > p.fault_rate
            && sample.ghash < p.low_rate
        {
            warn!(
                chip = %chip.key,
                ghash = format!("{:.2}", sample.ghash),
                "Low median hashrate, restarting clock exploration."
            );
            chip.tuning.switch_count = 0;
            chip.tuning.state = ControllerState::Exploring;
            chip.table.clear_rates();
        }

        let next = self.decide(chip);
        if next == chip.clock.active {
            return Verdict::Hold;
        }
        chip.clock.requested = next;
        debug!(
            chip = %chip.key,
            from = %chip.clock.active,
            to = %next,
            state = %chip.tuning.state,
            "Clock change requested."
        );
        Verdict::Reclock(next)
    }

    /// Pick the setting for the next decision period.
    fn decide(&self, chip: &mut Chip) -> ClockBits {
        let total = chip.table.selection_total();
        let test_count = if total > 2 { 2 } else { 4 };
        let active = chip.active_index();

        if chip.tuning.switch_count < test_count {
            chip.tuning.state = ControllerState::Exploring;
            let from = active.unwrap_or(SETTING_COUNT - 1);
            let optimal = match active {
                Some(i) if total > 4 => chip.table.selection_count[i],
                _ => 1,
            };

            let mut next = (from + 1) % SETTING_COUNT;
            if total > 2 {
                for _ in 0..SETTING_COUNT {
                    if chip.table.selection_count[next] >= optimal {
                        break;
                    }
                    next = (next + 1) % SETTING_COUNT;
                }
            }
            if Some(next) == active {
                // Nothing else qualifies; the step still counts as a trial
                chip.tuning.switch_count += 1;
            }
            return ClockTable::bits_of(next);
        }

        let best = chip.table.best_rate(active);
        chip.table.selection_count[best] += 1;
        chip.tuning.state = ControllerState::Converged;
        ClockTable::bits_of(best)
    }

    /// Count the active setting's smoothed rate once the chip has settled
    /// and refresh [`Chip::eff_speed`] from the histogram.
    fn track_rate_history(&self, chip: &mut Chip) {
        let Some(index) = chip.active_index() else {
            chip.eff_speed = 0.0;
            return;
        };
        if chip.tuning.cycles_since_switch > self.params.histogram_min_windows {
            chip.rate_history.add(index, chip.table.rate_estimate[index]);
        }
        chip.eff_speed = chip.rate_history.effective_rate(index).unwrap_or(0.0);
    }

    /// Unlock a chip that has run long enough at a setting that keeps
    /// underdelivering. Chips stay pinned while tuning is disabled.
    fn release_if_poor(&self, chip: &mut Chip) {
        if !self.autoclock
            || !chip.clock.locked
            || chip.tuning.cycles_since_switch <= self.params.release_min_windows
            || chip.eff_speed >= self.params.low_rate
        {
            return;
        }
        info!(
            chip = %chip.key,
            eff_ghash = format!("{:.2}", chip.eff_speed),
            "Releasing locked chip to the tuner."
        );
        chip.clock.locked = false;
        chip.tuning.switch_count = 0;
        chip.tuning.state = ControllerState::Exploring;
    }

    fn track_hardware_errors(&self, chip: &mut Chip, sample: WindowSample, window: u64) {
        let errors = chip.results.take_hardware_errors();
        let seen = u64::from(errors) + sample.results as u64;
        let percent = if seen > 0 {
            100.0 * f64::from(errors) / seen as f64
        } else {
            0.0
        };
        chip.hw_error_rate = if window < self.params.hw_error_raw_windows {
            percent
        } else {
            let w = self.params.hw_error_weight;
            chip.hw_error_rate * (1.0 - w) + percent * w
        };
    }

    /// Reset a faulted chip to the fallback setting and restart tuning.
    ///
    /// With tuning disabled the chip stays locked, now at the fallback
    /// setting. Returns the setting the chip must be re-initialised at.
    pub fn recover(&self, chip: &mut Chip, now: Instant) -> ClockBits {
        chip.clock.active = FALLBACK_CLOCK_BITS;
        chip.clock.requested = FALLBACK_CLOCK_BITS;
        chip.clock.locked = !self.autoclock;
        chip.clock.last_reset = now;
        chip.table.invalidate();
        chip.rate_history.clear();
        chip.eff_speed = 0.0;
        chip.tuning.cycles_since_switch = 0;
        chip.tuning.consecutive_low_rate = 0;
        chip.tuning.switch_count = 0;
        chip.tuning.state = if chip.clock.locked {
            ControllerState::Locked
        } else {
            ControllerState::Exploring
        };
        FALLBACK_CLOCK_BITS
    }

    /// Carry out `verdict` on the hardware.
    pub fn apply<B: ChipBus>(&self, chip: &mut Chip, verdict: Verdict, bus: &mut B, now: Instant) {
        match verdict {
            Verdict::Faulted => {
                let bits = self.recover(chip, now);
                info!(chip = %chip.key, bits = %bits, "Re-initialising faulted chip.");
                bus.shutdown(chip.key);
                bus.reinit(chip.key, bits);
            }
            Verdict::Hold | Verdict::Reclock(_) => {
                if let Some(bits) = chip.take_reclock(now) {
                    bus.apply_clock(chip.key, bits);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::clock::ema;
    use crate::sim::{BusCall, SimBus};
    use crate::types::ChipKey;

    const KEY: ChipKey = ChipKey::new(0, 0);

    /// Drive one chip through `windows`, feeding each window the rate
    /// `rates` assigns to the active setting.
    fn run_windows(
        ctl: &AutoClockController,
        chip: &mut Chip,
        bus: &mut SimBus,
        start: Instant,
        windows: std::ops::RangeInclusive<u64>,
        rates: impl Fn(ClockBits) -> f64,
    ) {
        let step = ctl.params().window;
        for window in windows {
            let now = start + step * window as u32;
            let ghash = rates(chip.clock.active);
            let sample = WindowSample {
                results: 100,
                seconds: step.as_secs_f64(),
                ghash,
            };
            let verdict = ctl.evaluate(chip, sample, window, now);
            ctl.apply(chip, verdict, bus, now);
        }
    }

    fn rates(table: [f64; 4]) -> impl Fn(ClockBits) -> f64 {
        move |bits| ClockTable::index_of(bits).map_or(0.0, |i| table[i])
    }

    #[test]
    fn explores_every_setting_then_converges() {
        let ctl = AutoClockController::default();
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(54), start);

        run_windows(&ctl, &mut chip, &mut bus, start, 1..=79, rates([2.0, 2.4, 3.2, 2.6]));
        assert_eq!(chip.tuning.state, ControllerState::Exploring);
        assert_eq!(chip.tuning.switch_count, 4);
        // Every setting has been measured
        assert!(chip.table.rate_estimate.iter().all(|&r| r > 0.0));

        run_windows(&ctl, &mut chip, &mut bus, start, 80..=80, rates([2.0, 2.4, 3.2, 2.6]));
        assert_eq!(chip.clock.active, ClockBits(55));
        assert_eq!(chip.tuning.state, ControllerState::Converged);

        run_windows(&ctl, &mut chip, &mut bus, start, 81..=400, rates([2.0, 2.4, 3.2, 2.6]));
        assert_eq!(chip.clock.active, ClockBits(55));
        assert_eq!(chip.table.most_selected(), Some(2));
    }

    #[test]
    fn dominant_setting_holds_after_decision() {
        let ctl = AutoClockController::default();
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(55), start);
        chip.tuning.switch_count = 10;
        chip.table.rate_estimate = [2.0, 2.4, 0.0, 2.6];

        run_windows(&ctl, &mut chip, &mut bus, start, 1..=17, rates([2.0, 2.4, 3.2, 2.6]));
        assert_eq!(chip.clock.active, ClockBits(55));
        assert_eq!(chip.tuning.state, ControllerState::Converged);
        assert_eq!(chip.table.selection_count, [0, 0, 1, 0]);
        assert!(bus.calls().is_empty());

        run_windows(&ctl, &mut chip, &mut bus, start, 18..=200, rates([2.0, 2.4, 3.2, 2.6]));
        assert_eq!(chip.clock.active, ClockBits(55));
    }

    #[test]
    fn seeded_chip_skips_rarely_chosen_settings() {
        let ctl = AutoClockController::default();
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(54), start);
        chip.seed(ClockTable {
            rate_estimate: [2.0, 2.4, 3.2, 2.6],
            selection_count: [0, 1, 6, 0],
        });
        let verdict = ctl.evaluate(&mut chip, WindowSample::new(0, 0.0), 1, start);
        ctl.apply(&mut chip, verdict, &mut bus, start);
        assert_eq!(chip.clock.active, ClockBits(55));

        run_windows(&ctl, &mut chip, &mut bus, start, 2..=17, rates([2.0, 2.4, 3.2, 2.6]));
        assert_eq!(chip.clock.active, ClockBits(55));
        // Only the seeded reclock reached the hardware
        assert_eq!(bus.calls(), &[BusCall::ApplyClock(KEY, ClockBits(55))]);
    }

    #[test]
    fn rate_collapse_faults_exactly_once() {
        let ctl = AutoClockController::default();
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(55), start);
        chip.tuning.switch_count = 10;
        chip.table.selection_count = [0, 1, 5, 0];

        run_windows(&ctl, &mut chip, &mut bus, start, 1..=40, rates([2.0, 2.4, 3.2, 2.6]));
        assert!(chip.tuning.cycles_since_switch > 31);

        run_windows(&ctl, &mut chip, &mut bus, start, 41..=43, |_| 0.5);
        assert_eq!(chip.tuning.consecutive_low_rate, 3);
        assert!(bus.calls().is_empty());

        run_windows(&ctl, &mut chip, &mut bus, start, 44..=44, |_| 0.5);
        assert_eq!(
            bus.calls(),
            &[
                BusCall::Shutdown(KEY),
                BusCall::Reinit(KEY, FALLBACK_CLOCK_BITS)
            ]
        );
        assert_eq!(chip.tuning.state, ControllerState::Exploring);
        assert_eq!(chip.table.selection_count, [0; 4]);
        assert_eq!(chip.tuning.consecutive_low_rate, 0);
        assert_eq!(chip.clock.active, FALLBACK_CLOCK_BITS);

        // Still dead, but the window count since the reset starts over
        run_windows(&ctl, &mut chip, &mut bus, start, 45..=60, |_| 0.5);
        let resets = bus
            .calls()
            .iter()
            .filter(|call| matches!(call, BusCall::Shutdown(_)))
            .count();
        assert_eq!(resets, 1);
        assert_eq!(chip.tuning.state, ControllerState::Exploring);
    }

    #[test]
    fn low_windows_must_be_consecutive() {
        let ctl = AutoClockController::default();
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(54), start);
        chip.clock.locked = true;

        run_windows(&ctl, &mut chip, &mut bus, start, 1..=40, |_| 2.5);
        for window in 41..=60u64 {
            let rate = if window % 3 == 0 { 2.5 } else { 0.2 };
            run_windows(&ctl, &mut chip, &mut bus, start, window..=window, |_| rate);
        }
        assert!(bus.calls().is_empty());
        assert_eq!(chip.tuning.state, ControllerState::Locked);
    }

    #[test]
    fn locked_chip_never_changes_setting() {
        let ctl = AutoClockController::default();
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(50), start);
        chip.clock.locked = true;

        run_windows(&ctl, &mut chip, &mut bus, start, 1..=200, |_| 3.0);
        assert_eq!(chip.clock.active, ClockBits(50));
        assert_eq!(chip.clock.requested, ClockBits(50));
        assert_eq!(chip.tuning.state, ControllerState::Locked);
        assert!(bus.calls().is_empty());
    }

    #[test]
    fn settled_low_rate_restarts_exploration() {
        let ctl = AutoClockController::default();
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(55), start);
        chip.tuning.switch_count = 10;
        chip.table.rate_estimate = [2.0, 2.4, 0.0, 2.6];

        run_windows(&ctl, &mut chip, &mut bus, start, 1..=47, |_| 3.2);
        assert_eq!(chip.tuning.state, ControllerState::Converged);

        run_windows(&ctl, &mut chip, &mut bus, start, 48..=48, |_| 1.5);
        assert_eq!(chip.tuning.state, ControllerState::Exploring);
        assert_eq!(chip.tuning.switch_count, 1);
        assert_eq!(chip.clock.active, ClockBits(56));
        assert_eq!(chip.table.rate_estimate, [0.0; 4]);
    }

    #[test]
    fn histogram_mean_replaces_estimate_at_decision() {
        let ctl = AutoClockController::default();
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(55), start);
        chip.tuning.switch_count = 10;
        chip.table.rate_estimate = [2.0, 2.4, 0.0, 2.6];
        for _ in 0..10 {
            chip.rate_history.add(2, 2.9);
        }

        run_windows(&ctl, &mut chip, &mut bus, start, 1..=15, |_| 3.2);
        assert!((chip.table.rate_estimate[2] - 3.2).abs() < 1e-9);

        run_windows(&ctl, &mut chip, &mut bus, start, 16..=16, |_| 3.2);
        assert!((chip.eff_speed - 2.9).abs() < 1e-9);
        assert!((chip.table.rate_estimate[2] - 2.9).abs() < 1e-9);
        assert_eq!(chip.tuning.state, ControllerState::Converged);
        assert_eq!(chip.table.selection_count, [0, 0, 1, 0]);
    }

    #[test]
    fn poor_locked_chip_is_released() {
        let ctl = AutoClockController::default();
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(54), start);
        chip.clock.locked = true;

        // Decisions at 16, 32 and 48 come too early after the switch
        run_windows(&ctl, &mut chip, &mut bus, start, 1..=63, |_| 1.5);
        assert!(chip.clock.locked);
        assert_eq!(chip.tuning.state, ControllerState::Locked);
        assert!((chip.eff_speed - 1.5).abs() < 1e-9);
        assert!(bus.calls().is_empty());

        run_windows(&ctl, &mut chip, &mut bus, start, 64..=64, |_| 1.5);
        assert!(!chip.clock.locked);
        assert_eq!(chip.tuning.state, ControllerState::Exploring);
        assert_eq!(chip.clock.active, ClockBits(55));
        assert_eq!(bus.calls(), &[BusCall::ApplyClock(KEY, ClockBits(55))]);
    }

    #[test]
    fn poor_chip_stays_locked_without_autoclock() {
        let ctl = AutoClockController::default().with_autoclock(false);
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(54), start);
        chip.clock.locked = true;

        run_windows(&ctl, &mut chip, &mut bus, start, 1..=100, |_| 1.5);
        assert!(chip.clock.locked);
        assert_eq!(chip.clock.active, ClockBits(54));
        assert_eq!(chip.tuning.state, ControllerState::Locked);
        assert!(bus.calls().is_empty());
    }

    #[test]
    fn recovered_chip_stays_locked_without_autoclock() {
        let ctl = AutoClockController::default().with_autoclock(false);
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(55), start);
        chip.clock.locked = true;

        run_windows(&ctl, &mut chip, &mut bus, start, 1..=40, |_| 3.2);
        run_windows(&ctl, &mut chip, &mut bus, start, 41..=44, |_| 0.5);
        assert_eq!(
            bus.calls(),
            &[
                BusCall::Shutdown(KEY),
                BusCall::Reinit(KEY, FALLBACK_CLOCK_BITS)
            ]
        );
        assert!(chip.clock.locked);
        assert_eq!(chip.tuning.state, ControllerState::Locked);
        assert_eq!(chip.eff_speed, 0.0);
        assert_eq!(chip.rate_history.effective_rate(2), None);

        run_windows(&ctl, &mut chip, &mut bus, start, 45..=120, |_| 2.5);
        assert_eq!(chip.clock.active, FALLBACK_CLOCK_BITS);
        assert_eq!(chip.clock.requested, FALLBACK_CLOCK_BITS);
        assert_eq!(bus.calls().len(), 2);
    }

    #[test]
    fn zero_decision_period_decides_every_window() {
        let params = TuningParams {
            decision_every: 0,
            ..Default::default()
        };
        let ctl = AutoClockController::new(params);
        let mut bus = SimBus::new(1, 1);
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(54), start);

        run_windows(&ctl, &mut chip, &mut bus, start, 1..=1, |_| 2.0);
        assert_eq!(chip.clock.active, ClockBits(55));
        run_windows(&ctl, &mut chip, &mut bus, start, 2..=3, |_| 2.0);
        assert_eq!(chip.clock.active, ClockBits(53));
        assert_eq!(chip.tuning.switch_count, 3);
    }

    #[test]
    fn first_window_does_not_feed_table() {
        let ctl = AutoClockController::default();
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(54), start);
        let now = start + ctl.params().window;
        ctl.evaluate(&mut chip, WindowSample::new(100, 20.0), 1, now);
        assert_eq!(chip.table.rate_estimate, [0.0; 4]);

        let sample = WindowSample::new(100, 20.0);
        ctl.evaluate(&mut chip, sample, 2, now + ctl.params().window);
        assert_eq!(chip.table.rate_estimate[1], sample.ghash);
    }

    #[test]
    fn settled_chip_uses_slow_weight() {
        let ctl = AutoClockController::default();
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(54), start);
        chip.clock.locked = true;
        chip.tuning.cycles_since_switch = 40;
        chip.table.rate_estimate[1] = 3.0;

        let now = start + Duration::from_secs(60);
        let sample = WindowSample {
            results: 10,
            seconds: 20.0,
            ghash: 2.0,
        };
        ctl.evaluate(&mut chip, sample, 3, now);
        let expected = ema(3.0, 2.0, 1.0 / 100.0);
        assert!((chip.table.rate_estimate[1] - expected).abs() < 1e-12);
    }

    #[test]
    fn measure_caps_elapsed_time() {
        let ctl = AutoClockController::default();
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(54), start);
        let now = start + Duration::from_secs(1000);
        for i in 0..10u32 {
            chip.results.accept(i, now - Duration::from_secs(u64::from(i) * 100));
        }
        let sample = ctl.measure(&chip, now);
        assert_eq!(sample.seconds, 500.0);
        // Submissions at 0, 100, .. 400 s ago fall inside the 500 s window
        assert_eq!(sample.results, 5);
        assert!((sample.ghash - 5.0 * 4.294967296 / 500.0).abs() < 1e-9);
    }

    #[test]
    fn hardware_error_rate_tracks_window_ratio() {
        let ctl = AutoClockController::default();
        let start = Instant::now();
        let mut chip = Chip::new(KEY, ClockBits(54), start);
        chip.results.add_hardware_errors(25);
        ctl.evaluate(&mut chip, WindowSample::new(75, 20.0), 1, start);
        assert_eq!(chip.hw_error_rate, 25.0);
        assert_eq!(chip.results.hardware_errors, 0);

        chip.results.add_hardware_errors(0);
        ctl.evaluate(&mut chip, WindowSample::new(75, 20.0), 5, start);
        assert!((chip.hw_error_rate - 25.0 * 0.93).abs() < 1e-9);
    }
}
