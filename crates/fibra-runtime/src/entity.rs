//! Fiber entities
//!
//! A `FiberEntity` is the schedulable unit: a stack, the registers saved at
//! its last switch, and the bookkeeping the scheduler and storage layers
//! hang off it. Entities are boxed once and recycled through a per-group
//! pool, so their address is stable for the whole time they are live.
//!
//! # Locking
//!
//! `state` only changes while `scheduler_lock` is held. A fiber that blocks
//! takes the lock on its own stack and the worker releases it after the
//! switch away has completed, so a concurrent waker can never resume a
//! fiber whose registers are still being saved.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use fibra_core::{FiberId, FiberState, MemoryError, RawSpinLock};

use crate::arch::{self, SavedContext};
use crate::execution_context::ExecutionContext;
use crate::group::SchedulingGroup;
use crate::local::FlsStorage;
use crate::stack::Stack;
use crate::sync::Event;

/// Boxed fiber body
pub(crate) type StartProc = Box<dyn FnOnce() + Send + 'static>;

/// Everything a fiber needs to begin running
pub(crate) struct FiberSpec {
    pub body: StartProc,
    /// Opened when the body returns; `None` for detached starts
    pub exit_barrier: Option<Arc<Event>>,
    /// Never leaves its scheduling group
    pub local: bool,
    /// Context the body runs inside
    pub exec_ctx: Option<ExecutionContext>,
}

#[derive(Default)]
struct Launch {
    start_proc: Option<StartProc>,
    exit_barrier: Option<Arc<Event>>,
    exec_ctx: Option<ExecutionContext>,
}

pub(crate) struct FiberEntity {
    context: UnsafeCell<SavedContext>,
    stack: Stack,
    pub(crate) scheduler_lock: RawSpinLock,
    state: AtomicU8,
    /// Bumped every time the entity is recycled
    generation: AtomicU32,
    id: AtomicU64,
    local: AtomicBool,
    /// Group whose queues own this fiber. Written by the launcher before
    /// the entity is published and by the worker that migrates it.
    group: UnsafeCell<Option<Arc<SchedulingGroup>>>,
    /// Consumed by the fiber on its first run
    launch: UnsafeCell<Launch>,
    /// Execution context active on this fiber
    current_ctx: UnsafeCell<Option<ExecutionContext>>,
    pub(crate) fls: FlsStorage,
}

// Safety: cross-thread access is serialized by scheduler_lock and by the
// run-queue handoff protocol described above
unsafe impl Send for FiberEntity {}
unsafe impl Sync for FiberEntity {}

impl FiberEntity {
    pub(crate) fn new(stack_size: usize) -> Result<Box<Self>, MemoryError> {
        Ok(Box::new(Self {
            context: UnsafeCell::new(SavedContext::default()),
            stack: Stack::new(stack_size)?,
            scheduler_lock: RawSpinLock::new(),
            state: AtomicU8::new(FiberState::Exiting as u8),
            generation: AtomicU32::new(1),
            id: AtomicU64::new(FiberId::NONE.as_u64()),
            local: AtomicBool::new(false),
            group: UnsafeCell::new(None),
            launch: UnsafeCell::new(Launch::default()),
            current_ctx: UnsafeCell::new(None),
            fls: FlsStorage::new(),
        }))
    }

    /// Bind a pooled or fresh entity to a new fiber.
    pub(crate) fn prepare(&mut self, group: Arc<SchedulingGroup>, spec: FiberSpec) -> FiberId {
        let id = FiberId::next();
        self.id.store(id.as_u64(), Ordering::Relaxed);
        self.local.store(spec.local, Ordering::Relaxed);
        *self.state.get_mut() = FiberState::Ready as u8;
        *self.group.get_mut() = Some(group);
        *self.launch.get_mut() = Launch {
            start_proc: Some(spec.body),
            exit_barrier: spec.exit_barrier,
            exec_ctx: spec.exec_ctx,
        };

        let arg = self as *mut Self as usize;
        unsafe {
            arch::init_context(self.context.get(), self.stack.top(), crate::scheduler::fiber_entry, arg);
        }
        id
    }

    /// Strip a finished fiber's bindings before pooling. Returns the group
    /// reference so the caller controls where it is dropped.
    pub(crate) fn reset(&mut self) -> Option<Arc<SchedulingGroup>> {
        let generation = self.generation.get_mut();
        *generation = generation.wrapping_add(1).max(1);
        self.id.store(FiberId::NONE.as_u64(), Ordering::Relaxed);
        *self.launch.get_mut() = Launch::default();
        *self.current_ctx.get_mut() = None;
        self.fls.clear();
        self.group.get_mut().take()
    }

    #[inline]
    pub(crate) fn id(&self) -> FiberId {
        FiberId::from_raw(self.id.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    /// Caller must hold `scheduler_lock`.
    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        debug_assert!(self.scheduler_lock.is_locked());
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_local(&self) -> bool {
        self.local.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn context_ptr(&self) -> *mut SavedContext {
        self.context.get()
    }

    /// # Safety
    ///
    /// The fiber must not be running and must not be reachable by a
    /// concurrent migrating worker (blocked under `scheduler_lock`, or
    /// owned by the caller).
    #[inline]
    pub(crate) unsafe fn group(&self) -> &Arc<SchedulingGroup> {
        match &*self.group.get() {
            Some(g) => g,
            None => unreachable!("fiber entity has no scheduling group"),
        }
    }

    /// # Safety
    ///
    /// Caller has exclusive access to the entity (popped from a run queue).
    pub(crate) unsafe fn set_group(&self, group: &Arc<SchedulingGroup>) {
        let slot = &mut *self.group.get();
        let same = slot.as_ref().is_some_and(|g| Arc::ptr_eq(g, group));
        if !same {
            *slot = Some(Arc::clone(group));
        }
    }

    /// # Safety
    ///
    /// Only the fiber itself may call this, once, at start.
    pub(crate) unsafe fn take_launch(&self) -> (Option<StartProc>, Option<ExecutionContext>) {
        let launch = &mut *self.launch.get();
        (launch.start_proc.take(), launch.exec_ctx.take())
    }

    /// # Safety
    ///
    /// Only the fiber itself may call this, once, at exit.
    pub(crate) unsafe fn take_exit_barrier(&self) -> Option<Arc<Event>> {
        (*self.launch.get()).exit_barrier.take()
    }

    /// # Safety
    ///
    /// Only the fiber itself may touch its execution-context slot.
    #[inline]
    pub(crate) unsafe fn current_ctx_slot(&self) -> &mut Option<ExecutionContext> {
        &mut *self.current_ctx.get()
    }
}

/// Owning pointer as it travels through run queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntityPtr(NonNull<FiberEntity>);

// Safety: whoever holds an EntityPtr from a run queue owns the entity
unsafe impl Send for EntityPtr {}

impl EntityPtr {
    #[inline]
    pub(crate) fn from_box(entity: Box<FiberEntity>) -> Self {
        EntityPtr(NonNull::from(Box::leak(entity)))
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> *mut FiberEntity {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The entity must still be live.
    #[inline]
    pub(crate) unsafe fn as_ref<'a>(self) -> &'a FiberEntity {
        &*self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The fiber has exited and nothing else refers to the entity.
    #[inline]
    pub(crate) unsafe fn into_box(self) -> Box<FiberEntity> {
        Box::from_raw(self.0.as_ptr())
    }
}

/// Generation-tagged handle a waiter keeps to resume a blocked fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntityRef {
    ptr: NonNull<FiberEntity>,
    generation: u32,
}

// Safety: an EntityRef is only dereferenced under the wait protocol, which
// keeps the entity alive until the single winning waker has resumed it
unsafe impl Send for EntityRef {}
unsafe impl Sync for EntityRef {}

impl EntityRef {
    pub(crate) fn new(entity: &FiberEntity) -> Self {
        Self {
            ptr: NonNull::from(entity),
            generation: entity.generation(),
        }
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// # Safety
    ///
    /// The referenced fiber must be blocked on the wait this reference was
    /// created for.
    #[inline]
    pub(crate) unsafe fn entity<'a>(&self) -> &'a FiberEntity {
        &*self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut FiberEntity {
        self.ptr.as_ptr()
    }

    /// Hand the blocked fiber back to a run queue.
    ///
    /// # Safety
    ///
    /// Caller is the single waker that moved the fiber from Blocked to
    /// Ready.
    #[inline]
    pub(crate) unsafe fn into_entity_ptr(self) -> EntityPtr {
        EntityPtr(self.ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entity_is_idle() {
        let entity = FiberEntity::new(32 * 1024).unwrap();
        assert_eq!(entity.state(), FiberState::Exiting);
        assert!(entity.id().is_none());
        assert_eq!(entity.generation(), 1);
    }

    #[test]
    fn test_reset_bumps_generation() {
        let mut entity = FiberEntity::new(32 * 1024).unwrap();
        let before = EntityRef::new(&entity);
        assert!(entity.reset().is_none());
        let after = EntityRef::new(&entity);
        assert_eq!(after.generation(), before.generation() + 1);
        assert_eq!(before.as_ptr(), after.as_ptr());
    }

    #[test]
    fn test_entity_ptr_round_trip() {
        let entity = FiberEntity::new(32 * 1024).unwrap();
        let raw = &*entity as *const FiberEntity;
        let ptr = EntityPtr::from_box(entity);
        assert_eq!(ptr.as_ptr() as *const _, raw);
        let back = unsafe { ptr.into_box() };
        assert_eq!(&*back as *const _, raw);
    }
}
