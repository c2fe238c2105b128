//! Thread-local runtime state
//!
//! A fiber can resume on a different worker than the one it suspended on,
//! so no fiber may hold on to a TLS address across a switch. Every accessor
//! here is `#[inline(never)]`, which forces a fresh lookup on each call.

use std::cell::Cell;
use std::ptr;

use crate::entity::FiberEntity;
use crate::worker::WorkerContext;

const NO_GROUP: usize = usize::MAX;

thread_local! {
    /// Worker context of this OS thread, null off-worker
    static CURRENT_WORKER: Cell<*const WorkerContext> = const { Cell::new(ptr::null()) };

    /// Fiber currently running on this worker
    static CURRENT_ENTITY: Cell<*mut FiberEntity> = const { Cell::new(ptr::null_mut()) };

    /// Group a runtime-owned helper thread (timer, reactor) belongs to
    static HOME_GROUP: Cell<usize> = const { Cell::new(NO_GROUP) };
}

#[inline(never)]
pub(crate) fn current_worker() -> *const WorkerContext {
    CURRENT_WORKER.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_current_worker(worker: *const WorkerContext) {
    CURRENT_WORKER.with(|c| c.set(worker));
}

#[inline(never)]
pub(crate) fn current_entity() -> *mut FiberEntity {
    CURRENT_ENTITY.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_current_entity(entity: *mut FiberEntity) {
    CURRENT_ENTITY.with(|c| c.set(entity));
}

/// Whether the caller runs inside a fiber.
#[inline(never)]
pub fn is_in_fiber() -> bool {
    !current_entity().is_null()
}

pub(crate) fn set_home_group(index: usize) {
    HOME_GROUP.with(|c| c.set(index));
}

pub(crate) fn home_group() -> Option<usize> {
    let idx = HOME_GROUP.with(|c| c.get());
    (idx != NO_GROUP).then_some(idx)
}
