//! Core types for bitfury-miner.
//!
//! Chip addressing, oscillator settings and hashrate units shared by the
//! pipeline, the clock controller and the statistics code.

use std::fmt;

use serde::Serialize;

/// Expected hashes behind one accepted nonce (difficulty-1 share).
pub const HASHES_PER_RESULT: u64 = 1 << 32;

/// Stable identity of a chip in the array: bank slot plus position in bank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChipKey {
    pub slot: u8,
    pub position: u8,
}

impl ChipKey {
    pub const fn new(slot: u8, position: u8) -> Self {
        Self { slot, position }
    }
}

impl fmt::Display for ChipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}:{}", self.slot, self.position)
    }
}

/// Raw oscillator setting ("osc6 bits") applied to a chip.
///
/// Higher values run the chip faster. Only a narrow band is usable; the
/// accepted range for operator overrides is [`ClockBits::MIN`] to
/// [`ClockBits::MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ClockBits(pub u8);

impl ClockBits {
    pub const MIN: ClockBits = ClockBits(48);
    pub const MAX: ClockBits = ClockBits(56);

    /// Returns `Some` if `bits` lies inside the operator-settable range.
    pub fn checked(bits: u8) -> Option<Self> {
        let bits = ClockBits(bits);
        (Self::MIN..=Self::MAX).contains(&bits).then_some(bits)
    }
}

impl fmt::Display for ClockBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hashrate measurement.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize)]
#[serde(transparent)]
pub struct HashRate(pub u64); // hashes per second

impl HashRate {
    /// Create from gigahashes per second
    pub fn from_gigahashes(gh: f64) -> Self {
        Self((gh * 1_000_000_000.0) as u64)
    }

    /// Get value as megahashes per second
    pub fn as_megahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Get value as gigahashes per second
    pub fn as_gigahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Get value as terahashes per second
    pub fn as_terahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000_000_000.0
    }

    /// Format as human-readable string with appropriate units
    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000_000_000 {
            format!("{:.2} TH/s", self.as_terahashes())
        } else if self.0 >= 1_000_000_000 {
            format!("{:.2} GH/s", self.as_gigahashes())
        } else if self.0 >= 1_000_000 {
            format!("{:.2} MH/s", self.as_megahashes())
        } else {
            format!("{} H/s", self.0)
        }
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_human_readable())
    }
}

/// Convert an accepted-result count over `seconds` into GH/s.
///
/// Each result stands for 2^32 hashes, i.e. 4.294967296 GH.
pub fn results_to_ghashes(results: usize, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return 0.0;
    }
    results as f64 * (HASHES_PER_RESULT as f64 / 1e9) / seconds
}
