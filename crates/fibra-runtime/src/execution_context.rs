//! Execution contexts
//!
//! An `ExecutionContext` is a bag of lazily initialized values that flows
//! with a logical request: fibers started inside [`ExecutionContext::execute`]
//! inherit it, and timers capture it when they are registered. Values are
//! reached through [`ExecutionLocal`] keys.
//!
//! The first `INLINE_SLOTS` keys are served from a fixed array of
//! `OnceLock`s. Keys beyond that go through an overflow map; its lock is
//! only taken to find or create a key's cell.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use fibra_core::SpinLock;

use crate::scheduler;

const INLINE_SLOTS: usize = 8;

type Value = Box<dyn Any + Send + Sync>;

struct Inner {
    inline: [OnceLock<Value>; INLINE_SLOTS],
    overflow: SpinLock<HashMap<usize, Arc<OnceLock<Value>>>>,
}

#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                inline: std::array::from_fn(|_| OnceLock::new()),
                overflow: SpinLock::new(HashMap::new()),
            }),
        }
    }

    /// Run `f` with this context installed. The previous context is put
    /// back when `f` returns or unwinds.
    pub fn execute<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = swap_current(Some(self.clone()));
        let _restore = Restore(Some(previous));
        f()
    }

    /// Context installed on the caller, if any.
    pub fn current() -> Option<ExecutionContext> {
        with_current(|c| c.clone())
    }

    /// Same as [`current`](Self::current). Used where a context is carried
    /// to work that runs later.
    pub fn capture() -> Option<ExecutionContext> {
        Self::current()
    }

    /// Drop every value held by the context.
    ///
    /// # Panics
    ///
    /// If any other reference to the context exists.
    pub fn clear(&mut self) {
        let inner = match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner,
            None => panic!("ExecutionContext::clear with {} references", Arc::strong_count(&self.inner)),
        };
        for slot in inner.inline.iter_mut() {
            slot.take();
        }
        inner.overflow.get_mut().clear();
    }

    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    fn get_or_init<T: Send + Sync + 'static>(&self, index: usize, init: fn() -> T) -> &T {
        let value = if index < INLINE_SLOTS {
            self.inner.inline[index].get_or_init(|| Box::new(init()))
        } else {
            let cell = {
                let mut map = self.inner.overflow.lock();
                Arc::clone(map.entry(index).or_default())
            };
            let value: &Value = cell.get_or_init(|| Box::new(init()));
            // Safety: the cell is kept alive by the map, which only shrinks
            // in clear(), and that requires &mut self
            unsafe { &*(value as *const Value) }
        };
        match value.downcast_ref::<T>() {
            Some(v) => v,
            None => unreachable!("execution-local slot holds a foreign type"),
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("use_count", &self.use_count())
            .finish_non_exhaustive()
    }
}

struct Restore(Option<Option<ExecutionContext>>);

impl Drop for Restore {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            swap_current(previous);
        }
    }
}

std::thread_local! {
    static THREAD_CONTEXT: std::cell::RefCell<Option<ExecutionContext>> =
        const { std::cell::RefCell::new(None) };
}

fn swap_current(ctx: Option<ExecutionContext>) -> Option<ExecutionContext> {
    match scheduler::current_entity() {
        // Safety: only the running fiber touches its own slot
        Some(entity) => std::mem::replace(unsafe { entity.current_ctx_slot() }, ctx),
        None => THREAD_CONTEXT.with(|c| c.replace(ctx)),
    }
}

fn with_current<R>(f: impl FnOnce(&Option<ExecutionContext>) -> R) -> R {
    match scheduler::current_entity() {
        Some(entity) => f(unsafe { entity.current_ctx_slot() }),
        None => THREAD_CONTEXT.with(|c| f(&c.borrow())),
    }
}

static NEXT_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Key for a value stored in the current execution context.
pub struct ExecutionLocal<T> {
    /// Slot index plus one, 0 until first use
    index: AtomicUsize,
    init: fn() -> T,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ExecutionLocal<T> {
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            index: AtomicUsize::new(0),
            init,
            _marker: PhantomData,
        }
    }

    fn index(&self) -> usize {
        let cur = self.index.load(Ordering::Acquire);
        if cur != 0 {
            return cur - 1;
        }
        let fresh = NEXT_INDEX.fetch_add(1, Ordering::Relaxed) + 1;
        match self.index.compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => fresh - 1,
            // The losing index is simply never used
            Err(winner) => winner - 1,
        }
    }

    /// Run `f` with this key's value in the current context, initializing
    /// it on first access.
    ///
    /// # Panics
    ///
    /// If called outside [`ExecutionContext::execute`].
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let ctx = match ExecutionContext::current() {
            Some(ctx) => ctx,
            None => panic!("ExecutionLocal accessed outside an execution context"),
        };
        f(ctx.get_or_init(self.index(), self.init))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::testing::run_as_fiber;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_execute_restores_previous() {
        assert!(ExecutionContext::current().is_none());
        let outer = ExecutionContext::new();
        let inner = ExecutionContext::new();
        outer.execute(|| {
            assert_eq!(ExecutionContext::current().unwrap().use_count(), 3);
            inner.execute(|| {
                let cur = ExecutionContext::current().unwrap();
                assert!(Arc::ptr_eq(&cur.inner, &inner.inner));
            });
            let cur = ExecutionContext::current().unwrap();
            assert!(Arc::ptr_eq(&cur.inner, &outer.inner));
        });
        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn test_restored_on_unwind() {
        let ctx = ExecutionContext::new();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ctx.execute(|| panic!("boom"));
        }));
        assert!(r.is_err());
        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn test_local_initializes_once_per_context() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        static VALUE: ExecutionLocal<u32> = ExecutionLocal::new(|| CALLS.fetch_add(1, Ordering::SeqCst) + 100);

        let a = ExecutionContext::new();
        let b = ExecutionContext::new();
        let before = CALLS.load(Ordering::SeqCst);
        a.execute(|| {
            let x = VALUE.with(|v| *v);
            assert_eq!(VALUE.with(|v| *v), x);
        });
        b.execute(|| VALUE.with(|_| ()));
        a.execute(|| VALUE.with(|_| ()));
        assert_eq!(CALLS.load(Ordering::SeqCst) - before, 2);
    }

    /// Key pinned to `index` so a fresh context exercises a known slot.
    fn key_at<T: Send + Sync + 'static>(index: usize, init: fn() -> T) -> &'static ExecutionLocal<T> {
        Box::leak(Box::new(ExecutionLocal {
            index: AtomicUsize::new(index + 1),
            init,
            _marker: PhantomData,
        }))
    }

    /// Fibers in one context hit `key` at once after a shared gate opens.
    fn race_first_access(key: &'static ExecutionLocal<u32>) -> Vec<u32> {
        use crate::sync::Event;
        const FIBERS: usize = 16;
        run_as_fiber(move || {
            let ctx = ExecutionContext::new();
            ctx.execute(|| {
                let gate = Arc::new(Event::new());
                let seen = Arc::new(SpinLock::new(Vec::new()));
                let mut fibers: Vec<Fiber> = (0..FIBERS)
                    .map(|_| {
                        let gate = Arc::clone(&gate);
                        let seen = Arc::clone(&seen);
                        Fiber::spawn(move || {
                            gate.wait();
                            let v = key.with(|v| *v);
                            seen.lock().push(v);
                        })
                    })
                    .collect();
                gate.set();
                for f in &mut fibers {
                    f.join();
                }
                let values = std::mem::take(&mut *seen.lock());
                values
            })
        })
    }

    #[test]
    fn test_concurrent_first_access_inline_slot() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn init() -> u32 {
            // Blocks the worker, not the fiber, so racing fibers on other
            // workers pile up on the cell
            std::thread::sleep(std::time::Duration::from_millis(2));
            CALLS.fetch_add(1, Ordering::SeqCst) + 100
        }
        let key = key_at(1, init);
        let values = race_first_access(key);
        assert_eq!(values.len(), 16);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|&v| v == 100));
    }

    #[test]
    fn test_concurrent_first_access_overflow_slot() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn init() -> u32 {
            std::thread::sleep(std::time::Duration::from_millis(2));
            CALLS.fetch_add(1, Ordering::SeqCst) + 200
        }
        let key = key_at(INLINE_SLOTS + 3, init);
        let values = race_first_access(key);
        assert_eq!(values.len(), 16);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|&v| v == 200));
    }

    #[test]
    fn test_overflow_slots() {
        let locals: Vec<&'static ExecutionLocal<String>> = (0..INLINE_SLOTS + 4)
            .map(|_| &*Box::leak(Box::new(ExecutionLocal::new(|| String::from("x")))))
            .collect();
        let ctx = ExecutionContext::new();
        ctx.execute(|| {
            for l in &locals {
                l.with(|s| assert_eq!(s, "x"));
            }
        });
    }

    #[test]
    #[should_panic(expected = "outside an execution context")]
    fn test_access_outside_execute_panics() {
        static VALUE: ExecutionLocal<u8> = ExecutionLocal::new(|| 0);
        VALUE.with(|_| ());
    }

    #[test]
    fn test_clear_requires_unique() {
        let mut ctx = ExecutionContext::new();
        static VALUE: ExecutionLocal<u8> = ExecutionLocal::new(|| 1);
        ctx.execute(|| VALUE.with(|_| ()));
        ctx.clear();
        let other = ctx.clone();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ctx.clear()));
        assert!(r.is_err());
        drop(other);
    }

    #[test]
    fn test_fibers_inherit_context() {
        static TAG: ExecutionLocal<AtomicU32> = ExecutionLocal::new(|| AtomicU32::new(0));
        run_as_fiber(|| {
            let ctx = ExecutionContext::new();
            ctx.execute(|| {
                TAG.with(|t| t.store(7, Ordering::SeqCst));
                let seen = Arc::new(AtomicU32::new(0));
                let s = Arc::clone(&seen);
                let mut child = Fiber::spawn(move || {
                    s.store(TAG.with(|t| t.load(Ordering::SeqCst)), Ordering::SeqCst);
                });
                child.join();
                assert_eq!(seen.load(Ordering::SeqCst), 7);
            });
            assert!(ExecutionContext::current().is_none());
        });
    }
}
