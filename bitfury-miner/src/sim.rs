//! Deterministic simulated chip array.
//!
//! [`SimBus`] stands in for the hardware when no chip library is linked. Each
//! simulated chip starts hashing the work written to it at the next read,
//! and at that point reports the nonces of the job it just finished. Nonces
//! are derived from the work id, so every run produces the same results.
//!
//! Some jobs exercise the odd corners of the result stream:
//! - a repeated nonce in the same readout,
//! - a late nonce reported one switch after its job finished ("old"),
//! - an early nonce reported at the switch into its own job ("future"),
//! - a hardware error.

use std::collections::{BTreeMap, HashSet};

use crate::bus::{ChipBus, ChipLoad, ChipReadout};
use crate::tracing::prelude::*;
use crate::types::{ChipKey, ClockBits};

/// Hardware command issued through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCall {
    ApplyClock(ChipKey, ClockBits),
    Reinit(ChipKey, ClockBits),
    Shutdown(ChipKey),
}

#[derive(Debug, Default)]
struct SimChip {
    active: Option<u64>,
    pending: Option<u64>,
    /// Nonce held back from the last finished job
    late: Option<u32>,
    /// Nonce of the active job already reported as "future"
    early: Option<u32>,
    bits: Option<ClockBits>,
    powered: bool,
    muted: bool,
}

#[derive(Debug)]
pub struct SimBus {
    chips: BTreeMap<ChipKey, SimChip>,
    emitted: HashSet<u32>,
    calls: Vec<BusCall>,
}

/// Nonce number `index` found while hashing work `id`.
pub fn sim_nonce(id: u64, index: u32) -> u32 {
    (((id << 3) as u32) | (index & 7)).wrapping_mul(0x9E37_79B1)
}

/// Nonces a simulated chip finds for work `id`.
fn nonces_for(id: u64) -> u32 {
    (id % 3) as u32 + 1
}

impl SimBus {
    /// Array of `slots` banks with `per_slot` chips each.
    pub fn new(slots: u8, per_slot: u8) -> Self {
        let chips = (0..slots)
            .flat_map(|slot| (0..per_slot).map(move |pos| ChipKey::new(slot, pos)))
            .map(|key| {
                (
                    key,
                    SimChip {
                        powered: true,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            chips,
            emitted: HashSet::new(),
            calls: Vec::new(),
        }
    }

    /// Every distinct nonce reported so far.
    pub fn emitted(&self) -> &HashSet<u32> {
        &self.emitted
    }

    /// Clock, reinit and shutdown commands in issue order.
    pub fn calls(&self) -> &[BusCall] {
        &self.calls
    }

    /// Oscillator setting last written to `chip`.
    pub fn clock_of(&self, chip: ChipKey) -> Option<ClockBits> {
        self.chips.get(&chip).and_then(|c| c.bits)
    }

    pub fn is_powered(&self, chip: ChipKey) -> bool {
        self.chips.get(&chip).is_some_and(|c| c.powered)
    }

    /// Make `chip` keep switching jobs without finding anything.
    pub fn mute(&mut self, chip: ChipKey, muted: bool) {
        if let Some(c) = self.chips.get_mut(&chip) {
            c.muted = muted;
        }
    }

    fn emit(&mut self, nonce: u32) -> u32 {
        self.emitted.insert(nonce);
        nonce
    }

    fn finish_job(&mut self, key: ChipKey, readout: &mut ChipReadout) {
        let Some(chip) = self.chips.get_mut(&key) else {
            return;
        };
        let Some(next) = chip.pending.take() else {
            return;
        };
        readout.job_switched = true;

        let finished = chip.active.replace(next);
        let early = chip.early.take();
        let late = chip.late.take();
        let muted = chip.muted;

        // Work ids picked so that each quirk shows up every few jobs
        let future = (!muted && next % 11 == 5).then(|| sim_nonce(next, 0));
        chip.early = future;

        let mut results = Vec::new();
        let mut held_back = None;
        if let (Some(id), false) = (finished, muted) {
            let count = nonces_for(id);
            for index in 0..count {
                let nonce = sim_nonce(id, index);
                if Some(nonce) == early {
                    continue;
                }
                if id % 7 == 3 && index + 1 == count {
                    held_back = Some(nonce);
                    continue;
                }
                results.push(nonce);
            }
            if id % 5 == 0 {
                if let Some(&first) = results.first() {
                    results.push(first);
                }
            }
            if id % 13 == 0 {
                readout.hardware_errors = 1;
            }
        }
        chip.late = held_back;

        for &nonce in &results {
            self.emit(nonce);
        }
        readout.results = results;
        readout.old_nonce = late.map(|n| self.emit(n));
        readout.future_nonce = future.map(|n| self.emit(n));
    }
}

impl ChipBus for SimBus {
    fn detect(&mut self) -> Vec<ChipKey> {
        self.chips.keys().copied().collect()
    }

    fn apply_clock(&mut self, chip: ChipKey, bits: ClockBits) {
        if let Some(c) = self.chips.get_mut(&chip) {
            c.bits = Some(bits);
        }
        self.calls.push(BusCall::ApplyClock(chip, bits));
    }

    fn reinit(&mut self, chip: ChipKey, bits: ClockBits) {
        if let Some(c) = self.chips.get_mut(&chip) {
            *c = SimChip {
                bits: Some(bits),
                powered: true,
                muted: c.muted,
                ..Default::default()
            };
        }
        self.calls.push(BusCall::Reinit(chip, bits));
    }

    fn shutdown(&mut self, chip: ChipKey) {
        if let Some(c) = self.chips.get_mut(&chip) {
            c.powered = false;
            c.active = None;
            c.pending = None;
        }
        self.calls.push(BusCall::Shutdown(chip));
    }

    fn send_batch(&mut self, loads: &[ChipLoad<'_>]) {
        for load in loads {
            let (Some(chip), Some(work)) = (self.chips.get_mut(&load.chip), load.work) else {
                continue;
            };
            if !chip.powered {
                continue;
            }
            if chip.active != Some(work.id) {
                chip.pending = Some(work.id);
            }
        }
    }

    fn read_results(&mut self) -> Vec<ChipReadout> {
        let keys: Vec<ChipKey> = self.chips.keys().copied().collect();
        let mut readouts = Vec::with_capacity(keys.len());
        for key in keys {
            let mut readout = ChipReadout::idle(key);
            self.finish_job(key, &mut readout);
            if readout.job_switched {
                trace!(
                    chip = %key,
                    results = readout.results.len(),
                    "Simulated job switch."
                );
            }
            readouts.push(readout);
        }
        readouts
    }
}
