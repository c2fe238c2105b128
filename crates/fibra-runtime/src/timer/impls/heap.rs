//! BinaryHeap-based timer backend
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy, the heap entry is skipped when it surfaces)
//! - Poll expired: O(k log n) where k = number of expired timers
//! - Next deadline: O(1)
//!
//! # Cancellation
//!
//! Live ids are tracked in a `HashSet`. Cancel removes the id; an entry
//! whose id is no longer live is discarded when popped. Periodic entries
//! are re-inserted inside the same critical section that popped them, so
//! a cancel either lands before the pop or removes the re-inserted entry.

use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::timer::{BackendStats, TimerBackend, TimerEntry, TimerId};

/// Min-heap ordering by deadline, ties broken by id
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.id == other.0.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.id.cmp(&self.0.id),
            ord => ord,
        }
    }
}

struct HeapInner {
    heap: BinaryHeap<HeapEntry>,
    /// Ids that are neither cancelled nor (for one-shots) fired
    pending: HashSet<TimerId>,
    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl HeapInner {
    fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            pending: HashSet::with_capacity(capacity),
            total_inserted: 0,
            total_fired: 0,
            total_cancelled: 0,
        }
    }
}

pub struct HeapTimerBackend {
    inner: Mutex<HeapInner>,
}

impl HeapTimerBackend {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HeapInner::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapInner> {
        // Nothing user-supplied runs under this lock
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HeapTimerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerBackend for HeapTimerBackend {
    fn insert(&self, entry: TimerEntry) {
        let mut inner = self.lock();
        inner.pending.insert(entry.id);
        inner.heap.push(HeapEntry(entry));
        inner.total_inserted += 1;
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.lock();
        let removed = inner.pending.remove(&id);
        if removed {
            inner.total_cancelled += 1;
        }
        if inner.pending.is_empty() {
            // Everything left in the heap is dead
            inner.heap.clear();
        }
        removed
    }

    fn poll_expired(&self, now: Instant) -> Vec<TimerEntry> {
        let mut inner = self.lock();
        let mut expired = Vec::new();
        let mut to_reschedule = Vec::new();

        while let Some(top) = inner.heap.peek() {
            if top.0.deadline > now {
                break;
            }
            let Some(HeapEntry(entry)) = inner.heap.pop() else {
                break;
            };
            if !inner.pending.contains(&entry.id) {
                continue;
            }
            match entry.reschedule() {
                Some(next) => to_reschedule.push(next),
                None => {
                    inner.pending.remove(&entry.id);
                }
            }
            inner.total_fired += 1;
            expired.push(entry);
        }

        for entry in to_reschedule {
            inner.heap.push(HeapEntry(entry));
        }

        expired
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock().heap.peek().map(|e| e.0.deadline)
    }

    fn len(&self) -> usize {
        self.lock().pending.len()
    }

    fn name(&self) -> &'static str {
        "binary_heap"
    }

    fn stats(&self) -> BackendStats {
        let inner = self.lock();
        BackendStats {
            active: inner.pending.len(),
            total_inserted: inner.total_inserted,
            total_fired: inner.total_fired,
            total_cancelled: inner.total_cancelled,
        }
    }
}
