//! Spinlocks for scheduler-internal critical sections
//!
//! Two flavours:
//! - [`RawSpinLock`]: a bare lock word with explicit `lock`/`unlock`. The
//!   runtime uses it for a fiber's scheduler lock, which is acquired on the
//!   fiber's stack and released by the worker after the context switch, so
//!   it cannot be tied to a guard lifetime.
//! - [`SpinLock<T>`]: data-carrying lock with an RAII guard, used for wait
//!   lists and run queues.
//!
//! Neither is meant for application code: a contended spinlock burns the
//! worker. Application code uses the fiber-aware `Mutex`.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Bare test-and-test-and-set lock.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    #[inline]
    pub const fn new() -> Self {
        RawSpinLock {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire, spinning with bounded exponential backoff.
    #[inline]
    pub fn lock(&self) {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            let mut spins = 0u32;
            while self.locked.load(Ordering::Relaxed) {
                spins = spins.wrapping_add(1);
                for _ in 0..spins.min(64) {
                    core::hint::spin_loop();
                }
            }
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held. It does not have to be released by the
    /// thread that acquired it.
    #[inline]
    pub unsafe fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlocking a free spinlock");
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A spinlock protecting a value of type `T`.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// Safety: SpinLock hands out access to T only while the lock is held
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Mutable access through an exclusive borrow, no locking needed.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Releases the spinlock when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: we hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: the guard exists only while the lock is held
        unsafe { self.lock.raw.unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spinlock_guard_roundtrip() {
        let lock = SpinLock::new(Vec::new());
        lock.lock().push(7u32);
        lock.lock().push(9);
        assert_eq!(*lock.lock(), vec![7, 9]);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_spinlock_try_lock() {
        let lock = SpinLock::new(0u32);
        let held = lock.try_lock();
        assert!(held.is_some());
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_raw_unlock_from_other_thread() {
        let raw = Arc::new(RawSpinLock::new());
        raw.lock();
        let r2 = Arc::clone(&raw);
        thread::spawn(move || unsafe { r2.unlock() })
            .join()
            .unwrap();
        assert!(raw.try_lock());
        unsafe { raw.unlock() };
    }

    #[test]
    fn test_spinlock_concurrent_increments() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..2500 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 10_000);
    }
}
