//! Fiber-side scheduling primitives
//!
//! Everything here runs on a fiber's own stack (or on a plain thread, for
//! the operations that accept both). The worker half of each switch lives
//! in `worker.rs`.
//!
//! A fiber that blocks takes its scheduler lock, marks itself Blocked and
//! switches out still holding the lock; the worker releases it. A waker
//! has to acquire the same lock before moving the fiber to Ready, so it
//! cannot queue a fiber whose registers are still being saved.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fibra_core::{kerror, FiberId, FiberState};

use crate::arch;
use crate::entity::{EntityPtr, EntityRef, FiberEntity};
use crate::tls;
use crate::waiter::Waiter;
use crate::worker::PostSwitch;

/// Switch from the running fiber back to its worker.
///
/// # Safety
///
/// `entity` is the fiber running on this thread.
unsafe fn switch_out(entity: &FiberEntity, post: PostSwitch) {
    let worker = &*tls::current_worker();
    worker.set_post(post);
    arch::switch_context(entity.context_ptr(), worker.sched_ctx());
}

#[inline]
pub(crate) fn current_entity<'a>() -> Option<&'a FiberEntity> {
    let e = tls::current_entity();
    // Safety: the running fiber's entity outlives its own code
    (!e.is_null()).then(|| unsafe { &*e })
}

/// First frame of every fiber.
pub(crate) unsafe extern "C" fn fiber_entry(arg: usize) -> ! {
    let entity = &*(arg as *const FiberEntity);
    run_body(entity);

    entity.scheduler_lock.lock();
    entity.set_state(FiberState::Exiting);
    entity.scheduler_lock.unlock();
    switch_out(entity, PostSwitch::Exit);

    // An exited fiber is never resumed
    std::process::abort()
}

/// Kept out of `fiber_entry` so nothing droppable is alive at the final
/// switch.
fn run_body(entity: &FiberEntity) {
    let (body, ctx) = unsafe { entity.take_launch() };
    if let Some(body) = body {
        let result = panic::catch_unwind(AssertUnwindSafe(move || match ctx {
            Some(ctx) => ctx.execute(body),
            None => body(),
        }));
        if result.is_err() {
            kerror!("fiber {} panicked, aborting", entity.id());
            std::process::abort();
        }
    }
    entity.fls.clear();
    if let Some(barrier) = unsafe { entity.take_exit_barrier() } {
        barrier.set();
    }
}

/// Block the running fiber. The caller holds `entity.scheduler_lock`; it
/// is released by the worker once the switch is complete. Returns after a
/// waker has moved the fiber back to Ready and a worker picked it up.
///
/// # Safety
///
/// `entity` is the running fiber and its scheduler lock is held.
pub(crate) unsafe fn halt_locked(entity: &FiberEntity) {
    debug_assert!(entity.scheduler_lock.is_locked());
    entity.set_state(FiberState::Blocked);
    switch_out(entity, PostSwitch::Halt);
}

/// Make a blocked fiber runnable again.
///
/// # Safety
///
/// Only the single waker that won the wake-up race may call this, and only
/// once per halt.
pub(crate) unsafe fn ready_fiber(target: EntityRef) {
    let entity = target.entity();
    entity.scheduler_lock.lock();
    debug_assert_eq!(entity.generation(), target.generation(), "wake of a recycled fiber");
    debug_assert_eq!(entity.state(), FiberState::Blocked, "wake of a fiber that is not blocked");
    entity.set_state(FiberState::Ready);
    let group = Arc::clone(entity.group());
    entity.scheduler_lock.unlock();
    // Once queued the entity may already be running elsewhere
    group.enqueue(target.into_entity_ptr());
}

/// Run `next` right away on this worker and requeue the caller.
pub(crate) fn dispatch(next: EntityPtr) {
    match current_entity() {
        Some(entity) => unsafe { switch_out(entity, PostSwitch::Dispatch(next)) },
        None => unreachable!("dispatch outside a fiber"),
    }
}

/// Give other ready fibers of this group a chance to run.
///
/// On a plain thread this yields the OS thread. In a fiber it returns at
/// once when nothing else is queued.
pub fn yield_now() {
    let Some(entity) = current_entity() else {
        thread::yield_now();
        return;
    };
    // Safety: the running fiber's group is stable while it runs
    let group = unsafe { entity.group() };
    if group.run_queue.is_empty() {
        return;
    }
    unsafe { switch_out(entity, PostSwitch::Requeue) };
}

/// Suspend the caller until `deadline`. Blocks only the fiber when called
/// from one.
pub fn sleep_until(deadline: Instant) {
    if tls::is_in_fiber() {
        let waiter = Waiter::new_current();
        waiter.wait((), Some(deadline));
    } else {
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
    }
}

pub fn sleep_for(d: Duration) {
    sleep_until(Instant::now() + d);
}

/// Id of the running fiber, `FiberId::NONE` off-fiber.
pub fn current_fiber_id() -> FiberId {
    current_entity().map_or(FiberId::NONE, FiberEntity::id)
}

const THREAD_TOKEN_BIT: u64 = 1 << 63;

thread_local! {
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(0) };
}

/// Identity of whoever is running: the fiber id, or a per-thread token
/// with the high bit set. Never zero.
pub(crate) fn owner_token() -> u64 {
    let id = current_fiber_id();
    if !id.is_none() {
        return id.as_u64();
    }
    static NEXT: AtomicU64 = AtomicU64::new(1);
    THREAD_TOKEN.with(|t| {
        if t.get() == 0 {
            t.set(NEXT.fetch_add(1, Ordering::Relaxed) | THREAD_TOKEN_BIT);
        }
        t.get()
    })
}
