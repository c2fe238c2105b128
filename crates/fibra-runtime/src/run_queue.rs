//! Per-group run queues
//!
//! Go-like layout:
//! - one bounded local queue per worker
//! - one unbounded shared queue per group
//! - stealing half of a sibling's local queue, starting at a random victim
//!
//! Every ready entity sits in exactly one queue. Stealing moves entries,
//! never copies them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use fibra_core::SpinLock;

use crate::entity::EntityPtr;

/// Check the shared queue first every N pops so it cannot starve
const SHARED_CHECK_INTERVAL: usize = 61;

struct LocalQueue {
    queue: SpinLock<VecDeque<EntityPtr>>,
    len: AtomicUsize,
    /// Pop counter for the shared-queue fairness check
    ticks: AtomicUsize,
    /// LCG state for victim selection
    rng: AtomicUsize,
}

impl LocalQueue {
    fn new(seed: usize, capacity: usize) -> Self {
        Self {
            queue: SpinLock::new(VecDeque::with_capacity(capacity)),
            len: AtomicUsize::new(0),
            ticks: AtomicUsize::new(0),
            rng: AtomicUsize::new(seed.wrapping_mul(2654435761).wrapping_add(1)),
        }
    }

    /// Push to back. Hands the entry back if the queue is full.
    fn push(&self, e: EntityPtr, capacity: usize) -> Result<(), EntityPtr> {
        let mut q = self.queue.lock();
        if q.len() >= capacity {
            return Err(e);
        }
        q.push_back(e);
        self.len.store(q.len(), Ordering::Release);
        Ok(())
    }

    fn pop(&self) -> Option<EntityPtr> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut q = self.queue.lock();
        let item = q.pop_front();
        self.len.store(q.len(), Ordering::Release);
        item
    }

    /// Take the front half, rounded up.
    fn steal_half(&self) -> Vec<EntityPtr> {
        if self.len.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }
        let mut q = self.queue.lock();
        let n = q.len().div_ceil(2);
        let stolen: Vec<_> = q.drain(..n).collect();
        self.len.store(q.len(), Ordering::Release);
        stolen
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn next_random(&self) -> usize {
        let old = self.rng.load(Ordering::Relaxed);
        let new = old.wrapping_mul(1103515245).wrapping_add(12345);
        self.rng.store(new, Ordering::Relaxed);
        new >> 16
    }
}

pub(crate) struct RunQueue {
    locals: Box<[LocalQueue]>,
    shared: SpinLock<VecDeque<EntityPtr>>,
    shared_len: AtomicUsize,
    local_capacity: usize,
}

impl RunQueue {
    pub(crate) fn new(workers: usize, local_capacity: usize) -> Self {
        Self {
            locals: (0..workers).map(|i| LocalQueue::new(i, local_capacity)).collect(),
            shared: SpinLock::new(VecDeque::new()),
            shared_len: AtomicUsize::new(0),
            local_capacity,
        }
    }

    /// Queue on `worker`'s local queue, spilling to the shared queue when
    /// it is full.
    pub(crate) fn push_local(&self, worker: usize, e: EntityPtr) {
        if let Err(e) = self.locals[worker].push(e, self.local_capacity) {
            self.push_shared(e);
        }
    }

    pub(crate) fn push_shared(&self, e: EntityPtr) {
        let mut q = self.shared.lock();
        q.push_back(e);
        self.shared_len.store(q.len(), Ordering::Release);
    }

    /// Next entity for `worker`: local, then shared (refilling the local
    /// queue with a batch), then half of a random sibling's local queue.
    pub(crate) fn pop(&self, worker: usize) -> Option<EntityPtr> {
        let local = &self.locals[worker];

        let tick = local.ticks.fetch_add(1, Ordering::Relaxed);
        if tick % SHARED_CHECK_INTERVAL == 0 {
            if let Some(e) = self.pop_shared() {
                return Some(e);
            }
        }

        if let Some(e) = local.pop() {
            return Some(e);
        }

        if let Some(e) = self.pop_shared_batch(worker) {
            return Some(e);
        }

        self.steal(worker)
    }

    fn pop_shared(&self) -> Option<EntityPtr> {
        if self.shared_len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut q = self.shared.lock();
        let item = q.pop_front();
        self.shared_len.store(q.len(), Ordering::Release);
        item
    }

    fn pop_shared_batch(&self, worker: usize) -> Option<EntityPtr> {
        if self.shared_len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let (first, batch) = {
            let mut q = self.shared.lock();
            let first = q.pop_front()?;
            let workers = self.locals.len();
            let n = (q.len() / workers).min(self.local_capacity / 2);
            let batch: Vec<_> = q.drain(..n).collect();
            self.shared_len.store(q.len(), Ordering::Release);
            (first, batch)
        };
        for e in batch {
            self.push_local(worker, e);
        }
        Some(first)
    }

    fn steal(&self, worker: usize) -> Option<EntityPtr> {
        let workers = self.locals.len();
        if workers <= 1 {
            return None;
        }
        let start = self.locals[worker].next_random() % workers;
        for i in 0..workers {
            let victim = (start + i) % workers;
            if victim == worker {
                continue;
            }
            let mut stolen = self.locals[victim].steal_half().into_iter();
            if let Some(first) = stolen.next() {
                for e in stolen {
                    self.push_local(worker, e);
                }
                return Some(first);
            }
        }
        None
    }

    /// Remove up to `max` entities that may leave the group from the
    /// shared queue. Group-local fibers stay where they are.
    pub(crate) fn steal_foreign(&self, max: usize) -> Vec<EntityPtr> {
        if self.shared_len.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }
        let mut q = self.shared.lock();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(q.len());
        while let Some(e) = q.pop_front() {
            // Safety: queued entities are live
            if taken.len() < max && !unsafe { e.as_ref() }.is_local() {
                taken.push(e);
            } else {
                kept.push_back(e);
            }
        }
        *q = kept;
        self.shared_len.store(q.len(), Ordering::Release);
        taken
    }

    /// Approximate number of queued entities
    pub(crate) fn len(&self) -> usize {
        self.shared_len.load(Ordering::Acquire)
            + self.locals.iter().map(LocalQueue::len).sum::<usize>()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty every queue. Only valid once the workers have stopped.
    pub(crate) fn drain(&self) -> Vec<EntityPtr> {
        let mut all: Vec<_> = {
            let mut q = self.shared.lock();
            self.shared_len.store(0, Ordering::Release);
            q.drain(..).collect()
        };
        for local in self.locals.iter() {
            let mut q = local.queue.lock();
            all.extend(q.drain(..));
            local.len.store(0, Ordering::Release);
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::FiberEntity;

    fn entities(n: usize) -> Vec<EntityPtr> {
        (0..n)
            .map(|_| EntityPtr::from_box(FiberEntity::new(16 * 1024).unwrap()))
            .collect()
    }

    fn free(ptrs: Vec<EntityPtr>) {
        for p in ptrs {
            drop(unsafe { p.into_box() });
        }
    }

    #[test]
    fn test_local_fifo() {
        let rq = RunQueue::new(1, 8);
        let es = entities(3);
        for &e in &es {
            rq.push_local(0, e);
        }
        assert_eq!(rq.len(), 3);
        // First pop checks shared (empty) then local
        assert_eq!(rq.pop(0), Some(es[0]));
        assert_eq!(rq.pop(0), Some(es[1]));
        assert_eq!(rq.pop(0), Some(es[2]));
        assert_eq!(rq.pop(0), None);
        free(es);
    }

    #[test]
    fn test_local_overflow_spills_to_shared() {
        let rq = RunQueue::new(2, 2);
        let es = entities(4);
        for &e in &es {
            rq.push_local(0, e);
        }
        assert_eq!(rq.len(), 4);
        // Worker 1 finds the spilled entries in the shared queue
        let mut seen = 0;
        while rq.pop(1).is_some() {
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert!(rq.is_empty());
        free(es);
    }

    #[test]
    fn test_work_stealing_moves_entries() {
        let rq = RunQueue::new(2, 64);
        let es = entities(10);
        for &e in &es {
            rq.push_local(0, e);
        }
        let first = rq.pop(1).unwrap();
        assert!(es.contains(&first));
        // Nothing duplicated or dropped
        let mut count = 1;
        while rq.pop(0).is_some() || rq.pop(1).is_some() {
            count += 1;
        }
        assert_eq!(count, 10);
        free(es);
    }

    #[test]
    fn test_steal_foreign_skips_local() {
        use crate::entity::FiberSpec;
        use crate::group::tests::test_group;

        let group = test_group(1);
        let rq = RunQueue::new(1, 8);
        let mut es = Vec::new();
        for local in [true, false, true, false] {
            let mut e = FiberEntity::new(16 * 1024).unwrap();
            e.prepare(
                group.clone(),
                FiberSpec { body: Box::new(|| {}), exit_barrier: None, local, exec_ctx: None },
            );
            let p = EntityPtr::from_box(e);
            es.push(p);
            rq.push_shared(p);
        }
        let taken = rq.steal_foreign(8);
        assert_eq!(taken, vec![es[1], es[3]]);
        assert_eq!(rq.len(), 2);
        rq.drain();
        for p in es {
            let mut e = unsafe { p.into_box() };
            e.reset();
        }
    }
}
