//! Work items and the upstream work collaborator.
//!
//! A [`Work`] is one unit of hashing assigned to a chip. It flows from the
//! host queue (possibly through the [`PrefetchQueue`](crate::prefetch)) into
//! a chip's pipeline and back upstream when the pipeline evicts it.
//!
//! Work is deliberately not `Clone`: a work item has exactly one owner at a
//! time, and ownership returns upstream through
//! [`WorkQueue::report_complete`].

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::tracing::prelude::*;

/// One unit of work as written to a chip.
#[derive(Debug, PartialEq, Eq)]
pub struct Work {
    /// Host-assigned identifier, unique for the lifetime of the process
    pub id: u64,
    /// SHA-256 midstate of the first header chunk
    pub midstate: [u8; 32],
    /// Last word of the merkle root (header bytes 64..68)
    pub m7: u32,
    /// Block timestamp
    pub ntime: u32,
    /// Encoded network target
    pub nbits: u32,
}

impl Work {
    /// Build a work item with a payload derived from `id` only.
    ///
    /// Useful for generated work where the header content does not matter.
    pub fn synthetic(id: u64) -> Self {
        let mut midstate = [0u8; 32];
        for (i, b) in midstate.iter_mut().enumerate() {
            *b = (id.wrapping_mul(31).wrapping_add(i as u64) & 0xff) as u8;
        }
        Self {
            id,
            midstate,
            m7: id as u32,
            ntime: 0x6500_0000,
            nbits: 0x1d00_ffff,
        }
    }
}

/// Outcome of forwarding a nonce upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    Rejected,
}

/// The host side of the driver: supplies work, takes completed work back and
/// validates results.
///
/// Implementations do their own locking; every method takes `&self` so the
/// scan worker and the host fill task can share one instance.
pub trait WorkQueue: Send + Sync {
    /// Take one queued work item, if any.
    fn take_work(&self) -> Option<Work>;

    /// Hand a work item back after the pipeline evicted it.
    fn report_complete(&self, work: Work);

    /// Forward a de-duplicated nonce found while hashing `work`.
    fn submit_result(&self, nonce: u32, work: &Work) -> Submission;
}

#[derive(Debug, Default)]
struct HostState {
    pending: VecDeque<Work>,
    completed: Vec<u64>,
    submitted: Vec<(u64, u32)>,
}

/// In-process host queue.
///
/// Holds pending work in FIFO order and records what comes back, which makes
/// it usable both as the daemon's host queue and as a test double.
#[derive(Debug, Default)]
pub struct HostQueue {
    state: Mutex<HostState>,
}

impl HostQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue preloaded with synthetic work items `ids`.
    pub fn with_synthetic(ids: impl IntoIterator<Item = u64>) -> Self {
        let queue = Self::new();
        for id in ids {
            queue.push(Work::synthetic(id));
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, work: Work) {
        self.lock().pending.push_back(work);
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Ids of work reported complete, in completion order.
    pub fn completed_ids(&self) -> Vec<u64> {
        self.lock().completed.clone()
    }

    /// `(work id, nonce)` pairs submitted, in submission order.
    pub fn submitted(&self) -> Vec<(u64, u32)> {
        self.lock().submitted.clone()
    }
}

impl WorkQueue for HostQueue {
    fn take_work(&self) -> Option<Work> {
        self.lock().pending.pop_front()
    }

    fn report_complete(&self, work: Work) {
        trace!(work_id = work.id, "Work completed");
        self.lock().completed.push(work.id);
    }

    fn submit_result(&self, nonce: u32, work: &Work) -> Submission {
        trace!(work_id = work.id, nonce = format!("{:#010x}", nonce), "Result submitted");
        self.lock().submitted.push((work.id, nonce));
        Submission::Accepted
    }
}
