//! Fixed-capacity overwrite rings.
//!
//! Used for the per-chip nonce history and the submission timestamp log. The
//! ring never grows: once full, each push overwrites the oldest entry.

/// Fixed-capacity ring that overwrites its oldest entry when full.
#[derive(Debug, Clone)]
pub struct Ring<T, const N: usize> {
    slots: [Option<T>; N],
    next: usize,
}

impl<T: Copy + PartialEq, const N: usize> Ring<T, N> {
    pub fn new() -> Self {
        Self {
            slots: [None; N],
            next: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Store `value` at the cursor and advance it, wrapping at `N`.
    pub fn push(&mut self, value: T) {
        self.slots[self.next] = Some(value);
        self.next += 1;
        if self.next >= N {
            self.next = 0;
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.slots.iter().flatten().any(|v| v == value)
    }

    /// Iterate over occupied slots in storage order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn clear(&mut self) {
        self.slots = [None; N];
        self.next = 0;
    }
}

impl<T: Copy + PartialEq, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
