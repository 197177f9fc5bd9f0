//! Statistics: per-window summaries and the exported driver snapshot.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::chip::Chip;
use crate::tracing::prelude::*;
use crate::types::{results_to_ghashes, ChipKey, ClockBits, HashRate};

/// Buckets of the chips-by-rate histogram.
pub const RATE_BUCKETS: usize = 50;

/// Width of one histogram bucket, GH/s.
pub const RATE_BUCKET_GHS: f64 = 0.1;

/// Chips per bank; slot totals are split at half of this.
pub const BANK_CHIPS: u8 = 8;

/// Window exported per-chip rates are measured over.
pub const EXPORT_WINDOW: Duration = Duration::from_secs(60);

/// Throughput of one slot, split by bank half.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SlotTotals {
    pub slot: u8,
    /// GH/s of positions below `BANK_CHIPS / 2`
    pub first_half: f64,
    pub second_half: f64,
}

impl SlotTotals {
    pub fn total(&self) -> f64 {
        self.first_half + self.second_half
    }

    fn add(&mut self, position: u8, ghash: f64) {
        if position < BANK_CHIPS / 2 {
            self.first_half += ghash;
        } else {
            self.second_half += ghash;
        }
    }
}

fn slot_totals(rates: impl Iterator<Item = (ChipKey, f64)>) -> Vec<SlotTotals> {
    let mut slots: BTreeMap<u8, SlotTotals> = BTreeMap::new();
    for (key, ghash) in rates {
        slots
            .entry(key.slot)
            .or_insert_with(|| SlotTotals {
                slot: key.slot,
                ..Default::default()
            })
            .add(key.position, ghash);
    }
    slots.into_values().collect()
}

/// Histogram bucket of a rate.
pub fn rate_bucket(ghash: f64) -> usize {
    let bucket = (ghash / RATE_BUCKET_GHS).round();
    if bucket <= 0.0 {
        0
    } else {
        (bucket as usize).min(RATE_BUCKETS - 1)
    }
}

/// Everything one statistics window produced.
#[derive(Debug, Clone)]
pub struct WindowSummary {
    /// Window number since startup, starting at 1
    pub window: u64,
    /// Wall time the window actually covered
    pub elapsed: Duration,
    /// Poll cycles run in the window
    pub polls: u64,
    /// Load rounds cut short for lack of work
    pub starved: u64,
    /// Smoothed interval between polls
    pub call_period: Duration,
    /// Work items waiting in the prefetch queue at window end
    pub prefetched: usize,
    /// Chips per rate bucket
    pub histogram: [u16; RATE_BUCKETS],
    pub slots: Vec<SlotTotals>,
    /// Per-slot totals over the long window, when one completed
    pub long: Option<Vec<SlotTotals>>,
    /// Clock tables should be written out after this window
    pub persist: bool,
}

impl WindowSummary {
    /// Summarise `rates`, the per-chip GH/s measured in this window.
    pub fn new(window: u64, elapsed: Duration, rates: &[(ChipKey, f64)]) -> Self {
        let mut histogram = [0u16; RATE_BUCKETS];
        for &(_, ghash) in rates {
            histogram[rate_bucket(ghash)] += 1;
        }
        Self {
            window,
            elapsed,
            polls: 0,
            starved: 0,
            call_period: Duration::ZERO,
            prefetched: 0,
            histogram,
            slots: slot_totals(rates.iter().copied()),
            long: None,
            persist: false,
        }
    }

    pub fn total_ghash(&self) -> f64 {
        self.slots.iter().map(SlotTotals::total).sum()
    }

    /// Non-empty histogram buckets as `rate:count` pairs.
    pub fn histogram_line(&self) -> String {
        let mut line = String::new();
        for (bucket, &count) in self.histogram.iter().enumerate() {
            if count == 0 {
                continue;
            }
            if !line.is_empty() {
                line.push(' ');
            }
            let _ = write!(line, "{:.1}:{}", bucket as f64 * RATE_BUCKET_GHS, count);
        }
        line
    }

    pub fn log(&self) {
        info!(
            window = self.window,
            elapsed_s = format!("{:.3}", self.elapsed.as_secs_f64()),
            polls = self.polls,
            starved = self.starved,
            call_period_ms = format!("{:.2}", self.call_period.as_secs_f64() * 1e3),
            prefetched = self.prefetched,
            hashrate = %HashRate::from_gigahashes(self.total_ghash()),
            "Statistics window."
        );
        debug!(histogram = %self.histogram_line(), "Chips by rate.");
        for slot in &self.slots {
            debug!(
                slot = format!("{:X}", slot.slot),
                first_half = format!("{:.1}", slot.first_half),
                second_half = format!("{:.1}", slot.second_half),
                total = format!("{:.1}", slot.total()),
                "Slot rate."
            );
        }
        if let Some(long) = &self.long {
            for slot in long {
                info!(
                    slot = format!("{:X}", slot.slot),
                    ghash = format!("{:.1}", slot.total()),
                    "Long-window slot rate."
                );
            }
        }
    }
}

/// Per-slot totals of results accepted within `window` before `now`.
pub fn long_window_totals(chips: &[Chip], now: Instant, window: Duration) -> Vec<SlotTotals> {
    let seconds = window.as_secs_f64();
    slot_totals(chips.iter().map(|chip| {
        let results = chip.results.results_within(now, window);
        (chip.key, results_to_ghashes(results, seconds))
    }))
}

/// Exported state of one chip.
#[derive(Debug, Clone, Serialize)]
pub struct ChipStats {
    pub chip: ChipKey,
    pub clock_bits: ClockBits,
    pub requested_bits: ClockBits,
    pub locked: bool,
    pub state: String,
    pub matching_results: u64,
    /// Results the host refused
    pub rejected: u64,
    pub hw_errors: u64,
    /// Hardware error percentage, smoothed over windows
    pub hw_error_rate: f64,
    /// GH/s over [`EXPORT_WINDOW`]
    pub ghash: f64,
    /// GH/s implied by the median job time
    pub work_time_ghash: f64,
    /// Idle time relative to job time
    pub wait_ratio: f64,
    /// Histogram mean of the active setting, GH/s
    pub eff_ghash: f64,
    pub rate_estimate: [f64; 4],
    pub selection_count: [u32; 4],
}

impl ChipStats {
    pub fn of(chip: &Chip, now: Instant) -> Self {
        let median = chip.pipeline.median_cycle_time;
        let (work_time_ghash, wait_ratio) = if median > 0.0 {
            (3e6 / median, chip.pipeline.median_wait_time / median)
        } else {
            (0.0, 0.0)
        };
        let results = chip.results.results_within(now, EXPORT_WINDOW);
        Self {
            chip: chip.key,
            clock_bits: chip.clock.active,
            requested_bits: chip.clock.requested,
            locked: chip.clock.locked,
            state: chip.tuning.state.to_string(),
            matching_results: chip.results.matching_results,
            rejected: chip.results.rejected_results,
            hw_errors: chip.results.hardware_errors_total,
            hw_error_rate: chip.hw_error_rate,
            ghash: results_to_ghashes(results, EXPORT_WINDOW.as_secs_f64()),
            work_time_ghash,
            wait_ratio,
            eff_ghash: chip.eff_speed,
            rate_estimate: chip.table.rate_estimate,
            selection_count: chip.table.selection_count,
        }
    }
}

/// Snapshot of the whole array.
#[derive(Debug, Clone, Serialize)]
pub struct DriverStats {
    pub chips: Vec<ChipStats>,
    pub total_hw: u64,
    pub total_gh: f64,
    pub avg_gh_per_chip: f64,
    pub prefetched: usize,
    pub windows: u64,
}

impl DriverStats {
    pub fn export(chips: &[Chip], prefetched: usize, windows: u64, now: Instant) -> Self {
        let chips: Vec<ChipStats> = chips.iter().map(|c| ChipStats::of(c, now)).collect();
        let total_hw = chips.iter().map(|c| c.hw_errors).sum();
        let total_gh: f64 = chips.iter().map(|c| c.ghash).sum();
        let avg_gh_per_chip = if chips.is_empty() {
            0.0
        } else {
            total_gh / chips.len() as f64
        };
        Self {
            chips,
            total_hw,
            total_gh,
            avg_gh_per_chip,
            prefetched,
            windows,
        }
    }

    pub fn hashrate(&self) -> HashRate {
        HashRate::from_gigahashes(self.total_gh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0.0, 0; "zero")]
    #[test_case(0.04, 0; "rounds down")]
    #[test_case(0.26, 3; "rounds up")]
    #[test_case(3.2, 32; "typical")]
    #[test_case(4.9, 49; "last")]
    #[test_case(12.0, 49; "clamped")]
    #[test_case(-1.0, 0; "negative")]
    fn bucket_of_rate(ghash: f64, expected: usize) {
        assert_eq!(rate_bucket(ghash), expected);
    }

    #[test]
    fn slots_split_by_bank_half() {
        let rates = [
            (ChipKey::new(1, 0), 3.0),
            (ChipKey::new(1, 5), 2.0),
            (ChipKey::new(0, 3), 1.0),
            (ChipKey::new(1, 7), 0.5),
        ];
        let summary = WindowSummary::new(1, Duration::from_secs(20), &rates);
        assert_eq!(
            summary.slots,
            vec![
                SlotTotals {
                    slot: 0,
                    first_half: 1.0,
                    second_half: 0.0
                },
                SlotTotals {
                    slot: 1,
                    first_half: 3.0,
                    second_half: 2.5
                },
            ]
        );
        assert_eq!(summary.total_ghash(), 6.5);
        assert_eq!(summary.histogram_line(), "0.5:1 1.0:1 2.0:1 3.0:1");
    }

    #[test]
    fn export_totals() {
        let now = Instant::now();
        let mut a = Chip::new(ChipKey::new(0, 0), ClockBits(54), now);
        let b = Chip::new(ChipKey::new(0, 1), ClockBits(55), now);
        for nonce in 0..14u32 {
            a.results.accept(nonce, now);
        }
        a.results.add_hardware_errors(3);

        let stats = DriverStats::export(&[a, b], 2, 7, now);
        assert_eq!(stats.total_hw, 3);
        let expected = 14.0 * 4.294967296 / 60.0;
        assert!((stats.total_gh - expected).abs() < 1e-9);
        assert!((stats.avg_gh_per_chip - expected / 2.0).abs() < 1e-9);
        assert_eq!(stats.chips[1].clock_bits, ClockBits(55));
        assert_eq!(stats.chips[0].state, "Exploring");

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["chips"][0]["chip"]["slot"], 0);
        assert_eq!(json["total_hw"], 3);
    }

    #[test]
    fn work_time_rate_from_median_cycle() {
        let now = Instant::now();
        let mut chip = Chip::new(ChipKey::new(0, 0), ClockBits(54), now);
        chip.pipeline.median_cycle_time = 1_000_000.0;
        chip.pipeline.median_wait_time = 50_000.0;
        let stats = ChipStats::of(&chip, now);
        assert_eq!(stats.work_time_ghash, 3.0);
        assert_eq!(stats.wait_ratio, 0.05);
    }

    #[test]
    fn rejections_and_effective_rate_are_exported() {
        let now = Instant::now();
        let mut chip = Chip::new(ChipKey::new(0, 0), ClockBits(54), now);
        chip.results.matching_results = 10;
        chip.results.rejected_results = 3;
        chip.eff_speed = 2.7;
        let stats = ChipStats::of(&chip, now);
        assert_eq!(stats.rejected, 3);
        assert_eq!(stats.eff_ghash, 2.7);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["rejected"], 3);
    }
}
