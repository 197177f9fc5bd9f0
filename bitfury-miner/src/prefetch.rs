//! Prefetch buffer between the host work queue and the scan worker.
//!
//! The host fills the buffer from its own context (under its own queue lock)
//! and the scan worker drains it on the hot dispatch path without touching
//! the host queue at all. The buffer is small: a third of the chip count plus
//! one, capped by its capacity.
//!
//! Both sides hold the same mutex for the full cursor scan plus the slot
//! mutation, so a concurrent `fill` and `take` can neither lose nor duplicate
//! an item.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::tracing::prelude::*;
use crate::work::{Work, WorkQueue};

#[derive(Debug)]
struct Slots {
    slots: Vec<Option<Work>>,
    write: usize,
    read: usize,
}

impl Slots {
    fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn next(&self, i: usize) -> usize {
        (i + 1) % self.slots.len()
    }
}

/// Bounded circular buffer of prefetched work, shared by all chips.
#[derive(Debug)]
pub struct PrefetchQueue {
    inner: Mutex<Slots>,
    target: usize,
}

impl PrefetchQueue {
    /// Create a buffer with `capacity` slots serving `chip_count` chips.
    ///
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize, chip_count: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            inner: Mutex::new(Slots {
                slots,
                write: 0,
                read: 0,
            }),
            target: capacity.min(chip_count / 3 + 1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Occupancy the fill policy aims for.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Number of slots currently holding work.
    pub fn occupied(&self) -> usize {
        self.lock().occupied()
    }

    /// Top the buffer up by at most one item from `host`.
    ///
    /// Returns `true` once occupancy meets the target, which the host uses as
    /// a back-pressure signal to hold off the next call.
    pub fn fill(&self, host: &dyn WorkQueue) -> bool {
        let mut inner = self.lock();
        if inner.occupied() >= self.target {
            return true;
        }

        let Some(work) = host.take_work() else {
            return false;
        };

        // occupied < target <= capacity, so a free slot exists
        for _ in 0..inner.slots.len() {
            let w = inner.write;
            if inner.slots[w].is_none() {
                trace!(slot = w, work_id = work.id, "Work prefetched");
                inner.slots[w] = Some(work);
                inner.write = inner.next(w);
                break;
            }
            inner.write = inner.next(w);
        }

        inner.occupied() >= self.target
    }

    /// Remove and return the next prefetched item, scanning from the read
    /// cursor.
    pub fn take(&self) -> Option<Work> {
        let mut inner = self.lock();
        for _ in 0..inner.slots.len() {
            let r = inner.read;
            inner.read = inner.next(r);
            if let Some(work) = inner.slots[r].take() {
                return Some(work);
            }
        }
        None
    }

    /// Hand every prefetched item back to `host` as complete.
    ///
    /// Used at shutdown so no work is stranded in the buffer.
    pub fn drain_into(&self, host: &dyn WorkQueue) -> usize {
        let mut inner = self.lock();
        let mut returned = 0;
        for slot in inner.slots.iter_mut() {
            if let Some(work) = slot.take() {
                host.report_complete(work);
                returned += 1;
            }
        }
        returned
    }
}
