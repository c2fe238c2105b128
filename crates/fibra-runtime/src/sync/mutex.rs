//! Fiber-aware mutex
//!
//! Three-state lock word (unlocked, locked, locked with waiters) in the
//! style of a futex mutex. Contended callers queue a `Waiter`, so a fiber
//! gives up its worker instead of spinning and a plain thread parks.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use fibra_core::SpinLock;

use crate::scheduler::owner_token;
use crate::waiter::{WaitList, Waiter};

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
const CONTENDED: u8 = 2;

/// Spins on the lock word before queueing
const SPIN_LIMIT: u32 = 40;

pub struct Mutex<T: ?Sized> {
    state: AtomicU8,
    /// Token of the holder, 0 when unlocked
    owner: AtomicU64,
    waiters: SpinLock<WaitList>,
    data: UnsafeCell<T>,
}

// Safety: the lock serializes all access to `data`
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
            owner: AtomicU64::new(0),
            waiters: SpinLock::new(WaitList::new()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the lock, suspending the caller while it is held elsewhere.
    ///
    /// # Panics
    ///
    /// In debug builds, if the caller already holds this mutex.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let me = owner_token();
        debug_assert_ne!(
            self.owner.load(Ordering::Relaxed),
            me,
            "recursive lock of a fibra Mutex"
        );

        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        self.owner.store(me, Ordering::Relaxed);
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        self.owner.store(owner_token(), Ordering::Relaxed);
        Some(MutexGuard { mutex: self })
    }

    fn lock_contended(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.state.load(Ordering::Relaxed) == UNLOCKED
                && self
                    .state
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }

        loop {
            let mut list = self.waiters.lock();
            // Whoever unlocks after this sees CONTENDED and checks the list
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            let waiter = Waiter::new_current();
            list.push(waiter.clone());
            waiter.wait(list, None);
        }
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Relaxed);
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            let next = self.waiters.lock().claim_one();
            if let Some(w) = next {
                w.wake();
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish_non_exhaustive()
    }
}

/// Unlocks the mutex when dropped
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// Mutex this guard belongs to. Used by condition variables to
    /// reacquire after a wait.
    pub(crate) fn mutex(this: &Self) -> &'a Mutex<T> {
        this.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves we hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves we hold the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::sync::Latch;
    use crate::testing::run_as_fiber;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_lock() {
        let m = Mutex::new(5);
        let g = m.try_lock().unwrap();
        assert!(m.try_lock().is_none());
        assert!(m.is_locked());
        drop(g);
        assert_eq!(*m.lock(), 5);
        assert!(!m.is_locked());
    }

    #[test]
    fn test_threads_counter() {
        let m = Arc::new(Mutex::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 40_000);
    }

    #[test]
    fn test_fibers_counter() {
        const FIBERS: usize = 32;
        const ITERS: u64 = 1_000;
        run_as_fiber(|| {
            let m = Arc::new(Mutex::new(0u64));
            let fibers: Vec<_> = (0..FIBERS)
                .map(|_| {
                    let m = Arc::clone(&m);
                    Fiber::spawn(move || {
                        for i in 0..ITERS {
                            let mut g = m.lock();
                            *g += 1;
                            if i % 64 == 0 {
                                crate::yield_now();
                            }
                        }
                    })
                })
                .collect();
            for mut f in fibers {
                f.join();
            }
            assert_eq!(*m.lock(), FIBERS as u64 * ITERS);
        });
    }

    #[test]
    fn test_thread_waits_for_fiber_holder() {
        run_as_fiber(|| {
            let m = Arc::new(Mutex::new(Vec::new()));
            let held = Arc::new(Latch::new(1));
            let mut guard_holder = {
                let m = Arc::clone(&m);
                let held = Arc::clone(&held);
                Fiber::spawn(move || {
                    let mut g = m.lock();
                    held.count_down(1);
                    crate::sleep_for(std::time::Duration::from_millis(20));
                    g.push("fiber");
                })
            };
            held.wait();
            let m2 = Arc::clone(&m);
            thread::spawn(move || m2.lock().push("thread")).join().unwrap();
            guard_holder.join();
            assert_eq!(*m.lock(), vec!["fiber", "thread"]);
        });
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "recursive lock")]
    fn test_recursive_lock_asserts() {
        let m = Mutex::new(());
        let _g = m.lock();
        let _g2 = m.lock();
    }
}
