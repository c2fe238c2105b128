//! Worker threads
//!
//! Each worker is an OS thread bound to one scheduling group. It pops
//! entities from the group's run queue, switches into them, and finishes
//! whatever the fiber asked for once control comes back (requeue, release
//! the scheduler lock of a blocked fiber, recycle an exited one).

use std::cell::{Cell, UnsafeCell};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fibra_core::{kdebug, kerror, kprint, FiberState, WorkerError};

use crate::arch::{self, SavedContext};
use crate::config::RuntimeConfig;
use crate::entity::EntityPtr;
use crate::group::SchedulingGroup;
use crate::parking::Parking;
use crate::tls;

/// Entities taken per cross-group steal
const FOREIGN_STEAL_BATCH: usize = 8;

/// What the worker does after a fiber switches back to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostSwitch {
    None,
    /// Fiber yielded; put it back on the run queue
    Requeue,
    /// Fiber blocked holding its scheduler lock; release it
    Halt,
    /// Fiber finished; recycle the entity
    Exit,
    /// Requeue the fiber, then run this one immediately
    Dispatch(EntityPtr),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct IdleTuning {
    pub spins: u32,
    pub park_timeout: Duration,
    pub foreign_steal_every: u32,
}

impl IdleTuning {
    pub(crate) fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            spins: config.idle_spins,
            park_timeout: config.park_timeout,
            foreign_steal_every: config.cross_group_steal_every,
        }
    }
}

/// Per-thread worker state. Lives on the worker's own stack frame for the
/// whole life of the thread and is published through TLS.
pub(crate) struct WorkerContext {
    group: Arc<SchedulingGroup>,
    index: usize,
    /// Registers of the scheduling loop while a fiber runs
    sched_ctx: UnsafeCell<SavedContext>,
    post: Cell<PostSwitch>,
    all_groups: Arc<[Arc<SchedulingGroup>]>,
    tuning: IdleTuning,
}

impl WorkerContext {
    pub(crate) fn new(
        group: Arc<SchedulingGroup>,
        index: usize,
        all_groups: Arc<[Arc<SchedulingGroup>]>,
        tuning: IdleTuning,
    ) -> Self {
        Self {
            group,
            index,
            sched_ctx: UnsafeCell::new(SavedContext::default()),
            post: Cell::new(PostSwitch::None),
            all_groups,
            tuning,
        }
    }

    #[inline]
    pub(crate) fn group(&self) -> &Arc<SchedulingGroup> {
        &self.group
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub(crate) fn sched_ctx(&self) -> *mut SavedContext {
        self.sched_ctx.get()
    }

    #[inline]
    pub(crate) fn set_post(&self, post: PostSwitch) {
        self.post.set(post);
    }

    fn run_loop(&self) {
        let mut idle_rounds: u32 = 0;
        let mut spins: u32 = 0;

        loop {
            if let Some(e) = self.group.run_queue.pop(self.index) {
                idle_rounds = 0;
                spins = 0;
                self.run_fiber(e);
                continue;
            }

            if self.group.is_stopping() {
                break;
            }

            idle_rounds = idle_rounds.wrapping_add(1);
            let every = self.tuning.foreign_steal_every;
            if every > 0 && idle_rounds % every == 0 {
                if let Some(e) = self.steal_foreign() {
                    idle_rounds = 0;
                    spins = 0;
                    self.run_fiber(e);
                    continue;
                }
            }

            if spins < self.tuning.spins {
                spins += 1;
                for _ in 0..32 {
                    std::hint::spin_loop();
                }
                thread::yield_now();
            } else {
                self.group.parking.park(Some(self.tuning.park_timeout));
                spins = 0;
            }
        }
    }

    /// Take shareable fibers queued on another group. The first is returned
    /// to run here; the rest go on this worker's local queue.
    fn steal_foreign(&self) -> Option<EntityPtr> {
        if self.all_groups.len() <= 1 {
            return None;
        }
        let me = self.group.index();
        let n = self.all_groups.len();
        for step in 1..n {
            let victim = &self.all_groups[(me + step) % n];
            let mut stolen = victim.run_queue.steal_foreign(FOREIGN_STEAL_BATCH).into_iter();
            if let Some(first) = stolen.next() {
                kdebug!("stole fibers from group {}", victim.index());
                for e in stolen {
                    self.group.run_queue.push_local(self.index, e);
                }
                return Some(first);
            }
        }
        None
    }

    fn run_fiber(&self, first: EntityPtr) {
        let mut next = Some(first);
        while let Some(e) = next.take() {
            // Safety: we popped it, so we own it until it is queued again
            let entity = unsafe { e.as_ref() };

            entity.scheduler_lock.lock();
            unsafe { entity.set_group(&self.group) };
            entity.set_state(FiberState::Running);
            unsafe { entity.scheduler_lock.unlock() };

            tls::set_current_entity(e.as_ptr());
            self.post.set(PostSwitch::None);
            unsafe { arch::switch_context(self.sched_ctx(), entity.context_ptr()) };
            tls::set_current_entity(std::ptr::null_mut());

            match self.post.replace(PostSwitch::None) {
                PostSwitch::Requeue => self.requeue(e),
                PostSwitch::Halt => unsafe { entity.scheduler_lock.unlock() },
                PostSwitch::Exit => unsafe { self.group.recycle(e) },
                PostSwitch::Dispatch(new) => {
                    self.requeue(e);
                    next = Some(new);
                }
                PostSwitch::None => {
                    kerror!("fiber {} switched out without a reason", entity.id());
                    panic!("fiber switched back to the scheduler without a post action");
                }
            }
        }
    }

    fn requeue(&self, e: EntityPtr) {
        // Safety: the fiber is switched out and still ours
        let entity = unsafe { e.as_ref() };
        entity.scheduler_lock.lock();
        entity.set_state(FiberState::Ready);
        unsafe { entity.scheduler_lock.unlock() };
        self.group.run_queue.push_local(self.index, e);
    }
}

/// Start the workers of one group.
pub(crate) fn spawn_workers(
    group: &Arc<SchedulingGroup>,
    all_groups: &Arc<[Arc<SchedulingGroup>]>,
    tuning: IdleTuning,
) -> Result<Vec<JoinHandle<()>>, WorkerError> {
    let mut handles = Vec::with_capacity(group.worker_count());
    for index in 0..group.worker_count() {
        let name = format!("fibra-g{}-w{}", group.index(), index);
        let group = Arc::clone(group);
        let all_groups = Arc::clone(all_groups);
        let tag = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                kprint::set_thread_tag(tag);
                let worker = WorkerContext::new(group, index, all_groups, tuning);
                tls::set_current_worker(&worker);
                kdebug!("started");
                worker.run_loop();
                tls::set_current_worker(std::ptr::null());
                kdebug!("exiting");
                kprint::clear_thread_tag();
            })
            .map_err(|_| WorkerError::SpawnFailed(name))?;
        handles.push(handle);
    }
    Ok(handles)
}

/// Join a set of runtime threads, reporting the first panic.
pub(crate) fn join_all(handles: Vec<JoinHandle<()>>) -> Result<(), WorkerError> {
    let mut result = Ok(());
    for h in handles {
        let name = h.thread().name().unwrap_or("fibra").to_string();
        if h.join().is_err() && result.is_ok() {
            result = Err(WorkerError::Panicked(name));
        }
    }
    result
}
