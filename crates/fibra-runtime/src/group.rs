//! Scheduling groups
//!
//! A group owns a set of workers, their run queues, an entity pool, a
//! timer queue and (on Linux) a reactor. Fibers are placed on a group and
//! only leave it through the cross-group steal path, which never touches
//! group-local fibers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use fibra_core::{kdebug, FiberId, SchedError, SchedResult, SpinLock};

use crate::config::RuntimeConfig;
use crate::entity::{EntityPtr, FiberEntity, FiberSpec};
use crate::parking::{Parking, PlatformParking};
use crate::run_queue::RunQueue;
use crate::timer::TimerQueue;
use crate::tls;

#[cfg(target_os = "linux")]
use crate::reactor::Reactor;

/// How a newly started fiber gets its first run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchPolicy {
    /// Queue the new fiber and keep running the caller
    #[default]
    Post,
    /// Run the new fiber right away and queue the caller. Falls back to
    /// `Post` unless the caller is a fiber of the target group.
    Dispatch,
}

/// Counters shared by every group of one runtime
pub(crate) struct RuntimeShared {
    live: AtomicUsize,
    max_fibers: usize,
    accepting: AtomicBool,
}

impl RuntimeShared {
    pub(crate) fn new(max_fibers: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            max_fibers,
            accepting: AtomicBool::new(true),
        }
    }

    /// Claim room for `n` fibers.
    fn reserve(&self, n: usize) -> SchedResult<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SchedError::NotRunning);
        }
        let prev = self.live.fetch_add(n, Ordering::AcqRel);
        if prev + n > self.max_fibers {
            self.live.fetch_sub(n, Ordering::AcqRel);
            return Err(SchedError::CapacityExhausted);
        }
        Ok(())
    }

    fn release(&self, n: usize) {
        self.live.fetch_sub(n, Ordering::AcqRel);
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }
}

pub(crate) struct SchedulingGroup {
    index: usize,
    workers: usize,
    pub(crate) run_queue: RunQueue,
    pub(crate) parking: PlatformParking,
    pool: SpinLock<Vec<Box<FiberEntity>>>,
    pool_size: usize,
    stack_size: usize,
    pub(crate) shared: Arc<RuntimeShared>,
    pub(crate) timers: TimerQueue,
    #[cfg(target_os = "linux")]
    reactor: SpinLock<Option<Arc<Reactor>>>,
    stopping: AtomicBool,
}

impl SchedulingGroup {
    pub(crate) fn new(index: usize, config: &RuntimeConfig, shared: Arc<RuntimeShared>) -> Self {
        Self {
            index,
            workers: config.workers_per_group,
            run_queue: RunQueue::new(config.workers_per_group, config.local_queue_capacity),
            parking: PlatformParking::new(),
            pool: SpinLock::new(Vec::with_capacity(config.entity_pool_size.min(1024))),
            pool_size: config.entity_pool_size,
            stack_size: config.stack_size,
            shared,
            timers: TimerQueue::new(index),
            #[cfg(target_os = "linux")]
            reactor: SpinLock::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub(crate) fn worker_count(&self) -> usize {
        self.workers
    }

    fn acquire_entity(&self) -> SchedResult<Box<FiberEntity>> {
        if let Some(e) = self.pool.lock().pop() {
            return Ok(e);
        }
        Ok(FiberEntity::new(self.stack_size)?)
    }

    fn release_entity(&self, entity: Box<FiberEntity>) {
        let mut pool = self.pool.lock();
        if pool.len() < self.pool_size {
            pool.push(entity);
        }
        // else: dropped here, unmapping its stack
    }

    /// Start one fiber on this group.
    pub(crate) fn start(
        self: &Arc<Self>,
        spec: FiberSpec,
        policy: LaunchPolicy,
    ) -> SchedResult<FiberId> {
        self.shared.reserve(1)?;
        let mut entity = match self.acquire_entity() {
            Ok(e) => e,
            Err(e) => {
                self.shared.release(1);
                return Err(e);
            }
        };
        let id = entity.prepare(Arc::clone(self), spec);
        let ptr = EntityPtr::from_box(entity);
        match policy {
            LaunchPolicy::Dispatch if self.is_current_fiber_group() => {
                crate::scheduler::dispatch(ptr);
            }
            _ => self.enqueue(ptr),
        }
        Ok(id)
    }

    /// Start every spec or none of them.
    pub(crate) fn start_batch(self: &Arc<Self>, specs: Vec<FiberSpec>) -> SchedResult<()> {
        let n = specs.len();
        self.shared.reserve(n)?;
        let mut entities = Vec::with_capacity(n);
        for _ in 0..n {
            match self.acquire_entity() {
                Ok(e) => entities.push(e),
                Err(err) => {
                    for e in entities {
                        self.release_entity(e);
                    }
                    self.shared.release(n);
                    return Err(err);
                }
            }
        }
        for (mut entity, spec) in entities.into_iter().zip(specs) {
            entity.prepare(Arc::clone(self), spec);
            self.enqueue(EntityPtr::from_box(entity));
        }
        Ok(())
    }

    /// Make a ready entity runnable: the caller's local queue when it is a
    /// worker of this group, the shared queue otherwise.
    pub(crate) fn enqueue(&self, e: EntityPtr) {
        match self.current_worker_index() {
            Some(w) => self.run_queue.push_local(w, e),
            None => self.run_queue.push_shared(e),
        }
        self.parking.unpark_one();
    }

    /// Return a finished fiber's entity to the pool.
    ///
    /// # Safety
    ///
    /// The fiber has switched away for the last time.
    pub(crate) unsafe fn recycle(&self, e: EntityPtr) {
        let mut entity = e.into_box();
        let group = entity.reset();
        self.release_entity(entity);
        self.shared.release(1);
        drop(group);
    }

    fn current_worker_index(&self) -> Option<usize> {
        let worker = tls::current_worker();
        if worker.is_null() {
            return None;
        }
        // Safety: a worker context outlives every call made on its thread
        let worker = unsafe { &*worker };
        (worker.group().index() == self.index).then(|| worker.index())
    }

    fn is_current_fiber_group(&self) -> bool {
        tls::is_in_fiber() && self.current_worker_index().is_some()
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.parking.unpark_all();
    }

    #[inline]
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Release pooled entities and anything left in the queues. Fibers
    /// still queued at this point never ran to completion; their
    /// entities are leaked rather than freed under a live stack frame.
    pub(crate) fn clear(&self) {
        let stranded = self.run_queue.drain();
        if !stranded.is_empty() {
            kdebug!("group {}: {} fibers never finished", self.index, stranded.len());
        }
        self.pool.lock().clear();
    }

    pub(crate) fn pooled(&self) -> usize {
        self.pool.lock().len()
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn set_reactor(&self, reactor: Arc<Reactor>) {
        *self.reactor.lock() = Some(reactor);
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn reactor(&self) -> Option<Arc<Reactor>> {
        self.reactor.lock().clone()
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn take_reactor(&self) -> Option<Arc<Reactor>> {
        self.reactor.lock().take()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_group(workers: usize) -> Arc<SchedulingGroup> {
        let config = RuntimeConfig::new()
            .workers_per_group(workers)
            .entity_pool_size(4)
            .stack_size(32 * 1024);
        Arc::new(SchedulingGroup::new(0, &config, Arc::new(RuntimeShared::new(8))))
    }

    #[test]
    fn test_capacity_reservation() {
        let shared = RuntimeShared::new(3);
        assert!(shared.reserve(2).is_ok());
        assert_eq!(shared.reserve(2), Err(SchedError::CapacityExhausted));
        assert_eq!(shared.live(), 2);
        shared.release(2);
        shared.stop_accepting();
        assert_eq!(shared.reserve(1), Err(SchedError::NotRunning));
    }

    #[test]
    fn test_start_queues_and_recycle_pools() {
        let group = test_group(1);
        let spec = FiberSpec { body: Box::new(|| {}), exit_barrier: None, local: false, exec_ctx: None };
        let id = group.start(spec, LaunchPolicy::Post).unwrap();
        assert!(!id.is_none());
        assert_eq!(group.shared.live(), 1);
        assert_eq!(group.run_queue.len(), 1);

        // Never ran, but recycling is the same path an exit takes
        let e = group.run_queue.pop(0).unwrap();
        unsafe { group.recycle(e) };
        assert_eq!(group.shared.live(), 0);
        assert_eq!(group.pooled(), 1);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let group = test_group(1);
        let specs = |n: usize| {
            (0..n)
                .map(|_| FiberSpec { body: Box::new(|| {}), exit_barrier: None, local: false, exec_ctx: None })
                .collect::<Vec<_>>()
        };
        assert_eq!(group.start_batch(specs(9)), Err(SchedError::CapacityExhausted));
        assert!(group.run_queue.is_empty());
        assert_eq!(group.shared.live(), 0);

        group.start_batch(specs(3)).unwrap();
        assert_eq!(group.run_queue.len(), 3);
        while let Some(e) = group.run_queue.pop(0) {
            unsafe { group.recycle(e) };
        }
        assert_eq!(group.shared.live(), 0);
    }
}
