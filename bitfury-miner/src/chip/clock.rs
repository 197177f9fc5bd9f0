//! Per-chip oscillator state and the candidate clock table.

use std::time::Instant;

use crate::stats::{rate_bucket, RATE_BUCKETS, RATE_BUCKET_GHS};
use crate::types::ClockBits;

/// Number of candidate oscillator settings the tuner chooses between.
pub const SETTING_COUNT: usize = 4;

/// Setting at table index 0. Index `i` maps to `BASE_CLOCK_BITS + i`.
pub const BASE_CLOCK_BITS: ClockBits = ClockBits(53);

/// Setting a chip is re-initialised at after a fault.
pub const FALLBACK_CLOCK_BITS: ClockBits = BASE_CLOCK_BITS;

/// Setting applied to every chip at startup before any override.
pub const DEFAULT_CLOCK_BITS: ClockBits = ClockBits(BASE_CLOCK_BITS.0 + 1);

/// Oscillator state of one chip.
#[derive(Debug, Clone)]
pub struct ClockState {
    /// Setting currently applied to the hardware
    pub active: ClockBits,
    /// Setting to apply at the next reclock opportunity
    pub requested: ClockBits,
    /// Frozen by operator override; the tuner leaves the chip alone
    pub locked: bool,
    /// When the chip was last reclocked or re-initialised
    pub last_reset: Instant,
}

impl ClockState {
    pub fn new(bits: ClockBits, now: Instant) -> Self {
        Self {
            active: bits,
            requested: bits,
            locked: false,
            last_reset: now,
        }
    }

    pub fn reclock_pending(&self) -> bool {
        self.active != self.requested
    }
}

/// Running throughput estimate and selection count for each candidate
/// setting.
///
/// Rates are in GH/s. A zero rate means "no valid estimate": either the
/// setting has not run for a full window since the last reset or the table
/// was invalidated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClockTable {
    pub rate_estimate: [f64; SETTING_COUNT],
    pub selection_count: [u32; SETTING_COUNT],
}

impl ClockTable {
    /// Setting stored at table index `index`.
    pub fn bits_of(index: usize) -> ClockBits {
        debug_assert!(index < SETTING_COUNT);
        ClockBits(BASE_CLOCK_BITS.0 + index as u8)
    }

    /// Table index of `bits`, if it is one of the candidates.
    pub fn index_of(bits: ClockBits) -> Option<usize> {
        let index = bits.0.checked_sub(BASE_CLOCK_BITS.0)? as usize;
        (index < SETTING_COUNT).then_some(index)
    }

    /// Fold `sample` into the estimate for `index` with EMA weight `weight`.
    ///
    /// An invalid (zero) estimate takes the sample as is.
    pub fn record(&mut self, index: usize, sample: f64, weight: f64) {
        let slot = &mut self.rate_estimate[index];
        *slot = ema(*slot, sample, weight);
    }

    /// Index with the highest rate estimate. Ties keep `prefer` when it is
    /// among the best, otherwise the lowest index wins.
    pub fn best_rate(&self, prefer: Option<usize>) -> usize {
        let mut best = prefer.unwrap_or(0);
        for (i, rate) in self.rate_estimate.iter().enumerate() {
            if *rate > self.rate_estimate[best] {
                best = i;
            }
        }
        best
    }

    /// Index chosen most often, if any setting was ever chosen.
    pub fn most_selected(&self) -> Option<usize> {
        let mut best = None;
        let mut best_count = 0;
        for (i, &count) in self.selection_count.iter().enumerate() {
            if count > best_count {
                best_count = count;
                best = Some(i);
            }
        }
        best
    }

    pub fn selection_total(&self) -> u32 {
        self.selection_count.iter().sum()
    }

    /// Forget rate estimates only; selection history survives.
    pub fn clear_rates(&mut self) {
        self.rate_estimate = [0.0; SETTING_COUNT];
    }

    /// Forget everything; used when the chip is re-initialised.
    pub fn invalidate(&mut self) {
        *self = Self::default();
    }
}

/// Buckets seen fewer times than this are noise and left out of
/// [`RateHistogram::effective_rate`].
pub const MIN_BUCKET_SAMPLES: u16 = 5;

/// How often each candidate setting settled at each rate.
///
/// Buckets are [`RATE_BUCKET_GHS`] wide. The count-weighted mean over the
/// well-populated buckets is a steadier figure for a setting than its EMA,
/// which a few bad windows can drag down.
#[derive(Debug, Clone)]
pub struct RateHistogram {
    buckets: [[u16; RATE_BUCKETS]; SETTING_COUNT],
}

impl Default for RateHistogram {
    fn default() -> Self {
        Self {
            buckets: [[0; RATE_BUCKETS]; SETTING_COUNT],
        }
    }
}

impl RateHistogram {
    /// Count one observation of `ghash` for setting `index`.
    pub fn add(&mut self, index: usize, ghash: f64) {
        let count = &mut self.buckets[index][rate_bucket(ghash)];
        *count = count.saturating_add(1);
    }

    pub fn count(&self, index: usize, bucket: usize) -> u16 {
        self.buckets[index][bucket]
    }

    /// Count-weighted mean rate of setting `index`, GH/s.
    ///
    /// The zero bucket and buckets below [`MIN_BUCKET_SAMPLES`] are skipped;
    /// `None` when nothing is left.
    pub fn effective_rate(&self, index: usize) -> Option<f64> {
        let mut weighted = 0.0;
        let mut total = 0u32;
        for (bucket, &count) in self.buckets[index].iter().enumerate().skip(1) {
            if count < MIN_BUCKET_SAMPLES {
                continue;
            }
            weighted += RATE_BUCKET_GHS * bucket as f64 * f64::from(count);
            total += u32::from(count);
        }
        (total > 0).then(|| weighted / f64::from(total))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Exponential moving average step. A zero `prev` is treated as "no history"
/// and replaced by `sample`.
pub(crate) fn ema(prev: f64, sample: f64, weight: f64) -> f64 {
    if prev == 0.0 {
        sample
    } else {
        prev * (1.0 - weight) + sample * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(52, None; "below table")]
    #[test_case(53, Some(0); "first")]
    #[test_case(55, Some(2); "middle")]
    #[test_case(56, Some(3); "last")]
    #[test_case(57, None; "above table")]
    fn index_of_bits(bits: u8, expected: Option<usize>) {
        assert_eq!(ClockTable::index_of(ClockBits(bits)), expected);
        if let Some(i) = expected {
            assert_eq!(ClockTable::bits_of(i), ClockBits(bits));
        }
    }

    #[test]
    fn record_seeds_then_smooths() {
        let mut table = ClockTable::default();
        table.record(1, 3.0, 0.5);
        assert_eq!(table.rate_estimate[1], 3.0);
        table.record(1, 1.0, 0.5);
        assert_eq!(table.rate_estimate[1], 2.0);
    }

    #[test]
    fn best_rate_prefers_current_on_tie() {
        let table = ClockTable {
            rate_estimate: [2.0, 3.0, 3.0, 1.0],
            selection_count: [0; 4],
        };
        assert_eq!(table.best_rate(Some(2)), 2);
        assert_eq!(table.best_rate(Some(0)), 1);
        assert_eq!(table.best_rate(None), 1);
    }

    #[test]
    fn most_selected_requires_a_selection() {
        let mut table = ClockTable::default();
        assert_eq!(table.most_selected(), None);
        table.selection_count = [1, 4, 4, 0];
        assert_eq!(table.most_selected(), Some(1));
        assert_eq!(table.selection_total(), 9);
    }

    #[test]
    fn effective_rate_ignores_sparse_buckets() {
        let mut history = RateHistogram::default();
        assert_eq!(history.effective_rate(2), None);

        for _ in 0..6 {
            history.add(2, 3.0);
        }
        for _ in 0..4 {
            history.add(2, 0.5);
        }
        for _ in 0..9 {
            history.add(2, 0.0);
        }
        assert_eq!(history.count(2, 30), 6);
        assert_eq!(history.count(2, 0), 9);
        let rate = history.effective_rate(2).unwrap();
        assert!((rate - 3.0).abs() < 1e-9);

        for _ in 0..12 {
            history.add(2, 2.0);
        }
        // (6 * 3.0 + 12 * 2.0) / 18
        let rate = history.effective_rate(2).unwrap();
        assert!((rate - 42.0 / 18.0).abs() < 1e-9);
        assert_eq!(history.effective_rate(1), None);

        history.clear();
        assert_eq!(history.effective_rate(2), None);
    }

    #[test_case(-1.0, 0; "negative")]
    #[test_case(0.04, 0; "rounds down to zero")]
    #[test_case(1.87, 19; "rounds up")]
    #[test_case(12.0, 49; "clamped")]
    fn histogram_buckets(ghash: f64, bucket: usize) {
        let mut history = RateHistogram::default();
        history.add(0, ghash);
        assert_eq!(history.count(0, bucket), 1);
    }

    #[test]
    fn clear_rates_keeps_selections() {
        let mut table = ClockTable {
            rate_estimate: [1.0; 4],
            selection_count: [2; 4],
        };
        table.clear_rates();
        assert_eq!(table.rate_estimate, [0.0; 4]);
        assert_eq!(table.selection_count, [2; 4]);
        table.invalidate();
        assert_eq!(table, ClockTable::default());
    }
}
