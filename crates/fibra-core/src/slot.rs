//! Generation-tagged index allocator
//!
//! Hands out small dense indices and recycles released ones through a LIFO
//! free stack. Every reuse bumps the index's generation, so storage keyed by
//! `(index, generation)` can tell a value left behind by a previous owner
//! from its own.

use core::sync::atomic::{AtomicUsize, Ordering};
use crate::spinlock::SpinLock;

/// An allocated index plus the generation it was handed out under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub index: usize,
    pub generation: u32,
}

pub struct SlotAllocator {
    /// Released indices with the generation their next owner gets
    free_stack: SpinLock<Vec<SlotKey>>,
    /// Next never-used index
    next_fresh: AtomicUsize,
    /// Upper bound on fresh indices (exclusive)
    max_slots: usize,
    allocated: AtomicUsize,
}

impl SlotAllocator {
    pub const fn new(max_slots: usize) -> Self {
        Self {
            free_stack: SpinLock::new(Vec::new()),
            next_fresh: AtomicUsize::new(0),
            max_slots,
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocate an index, preferring the most recently released one.
    /// Returns `None` once `max_slots` fresh indices are in use.
    pub fn allocate(&self) -> Option<SlotKey> {
        if let Some(key) = self.free_stack.lock().pop() {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            return Some(key);
        }

        let mut current = self.next_fresh.load(Ordering::Acquire);
        loop {
            if current >= self.max_slots {
                return None;
            }
            match self.next_fresh.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.allocated.fetch_add(1, Ordering::Relaxed);
                    return Some(SlotKey { index: current, generation: 1 });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `key` to the allocator. Its next owner sees generation + 1.
    pub fn release(&self, key: SlotKey) {
        debug_assert!(key.index < self.next_fresh.load(Ordering::Relaxed));
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        self.free_stack.lock().push(SlotKey {
            index: key.index,
            generation: key.generation.wrapping_add(1).max(1),
        });
    }

    #[inline]
    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Highest index handed out so far, plus one.
    #[inline]
    pub fn high_water(&self) -> usize {
        self.next_fresh.load(Ordering::Relaxed)
    }
}
