//! Hardware collaborator interface.
//!
//! The bit-level protocol that shifts commands and responses to the chips
//! lives behind [`ChipBus`]. Every call is synchronous and blocking, and
//! failures are not modelled: the chip library offers no way to report them,
//! so a command that did not take effect shows up later as a chip that
//! underperforms and is handled by the clock controller.

use crate::types::{ChipKey, ClockBits};
use crate::work::Work;

/// Work slot content sent to one chip in a batch.
#[derive(Debug, Clone, Copy)]
pub struct ChipLoad<'a> {
    pub chip: ChipKey,
    /// The chip's current work, or `None` when the pipeline is idle
    pub work: Option<&'a Work>,
}

/// What one chip reported since the previous read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipReadout {
    pub chip: ChipKey,
    /// Chip moved on to the most recently written work
    pub job_switched: bool,
    /// Nonces for the work that just finished, oldest first
    pub results: Vec<u32>,
    /// Nonce that surfaced before the job boundary; belongs to the newest work
    pub future_nonce: Option<u32>,
    /// Late nonce that belongs to the work two generations back
    pub old_nonce: Option<u32>,
    /// Results that failed on-chip validation
    pub hardware_errors: u32,
}

impl ChipReadout {
    pub fn idle(chip: ChipKey) -> Self {
        Self {
            chip,
            ..Default::default()
        }
    }
}

/// Access to the chip array hardware.
pub trait ChipBus: Send {
    /// Enumerate the chips present on the bus.
    fn detect(&mut self) -> Vec<ChipKey>;

    /// Change the oscillator setting of a running chip.
    fn apply_clock(&mut self, chip: ChipKey, bits: ClockBits);

    /// Fully re-initialise a chip at `bits`.
    fn reinit(&mut self, chip: ChipKey, bits: ClockBits);

    /// Power a chip down.
    fn shutdown(&mut self, chip: ChipKey);

    /// Write the current work of every chip in one bus transaction.
    fn send_batch(&mut self, loads: &[ChipLoad<'_>]);

    /// Collect what every chip reported since the last read.
    fn read_results(&mut self) -> Vec<ChipReadout>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_readout_reports_nothing() {
        let key = ChipKey::new(2, 5);
        let readout = ChipReadout::idle(key);
        assert_eq!(readout.chip, key);
        assert!(!readout.job_switched);
        assert!(readout.results.is_empty());
        assert_eq!(readout.future_nonce, None);
        assert_eq!(readout.old_nonce, None);
        assert_eq!(readout.hardware_errors, 0);
        assert_eq!(ChipReadout::default().chip, ChipKey::new(0, 0));
    }
}
