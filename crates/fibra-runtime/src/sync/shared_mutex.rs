//! Reader-writer lock with writer preference
//!
//! Readers take a slot from an atomic quota. A writer first serializes
//! against other writers, then subtracts `MAX_READERS` from the quota so
//! every later reader queues behind it, and waits for the readers already
//! inside to leave. Its unlock hands exactly as many permits to the
//! reader semaphore as readers it turned away.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicIsize, Ordering};

use fibra_core::SpinLock;

use crate::sync::mutex::{Mutex, MutexGuard};
use crate::waiter::{WaitList, Waiter};

const MAX_READERS: isize = 1 << 30;

/// Counting semaphore that hands permits straight to queued waiters
struct Semaphore {
    inner: SpinLock<(usize, WaitList)>,
}

impl Semaphore {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new((0, WaitList::new())),
        }
    }

    fn acquire(&self) {
        let mut inner = self.inner.lock();
        if inner.0 > 0 {
            inner.0 -= 1;
            return;
        }
        let waiter = Waiter::new_current();
        inner.1.push(waiter.clone());
        waiter.wait(inner, None);
    }

    fn release(&self, n: usize) {
        let woken = {
            let mut inner = self.inner.lock();
            let mut woken = Vec::new();
            for _ in 0..n {
                match inner.1.claim_one() {
                    Some(w) => woken.push(w),
                    None => inner.0 += 1,
                }
            }
            woken
        };
        for w in woken {
            w.wake();
        }
    }
}

pub struct SharedMutex<T: ?Sized> {
    writer: Mutex<()>,
    /// Readers inside, minus MAX_READERS while a writer is pending
    reader_count: AtomicIsize,
    /// Readers the pending writer still waits for
    reader_wait: AtomicIsize,
    writer_sem: Semaphore,
    reader_sem: Semaphore,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SharedMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            writer: Mutex::new(()),
            reader_count: AtomicIsize::new(0),
            reader_wait: AtomicIsize::new(0),
            writer_sem: Semaphore::new(),
            reader_sem: Semaphore::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SharedMutex<T> {
    pub fn read(&self) -> SharedMutexReadGuard<'_, T> {
        if self.reader_count.fetch_add(1, Ordering::AcqRel) + 1 < 0 {
            // A writer is pending
            self.reader_sem.acquire();
        }
        SharedMutexReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<SharedMutexReadGuard<'_, T>> {
        let mut c = self.reader_count.load(Ordering::Acquire);
        loop {
            if c < 0 {
                return None;
            }
            match self
                .reader_count
                .compare_exchange_weak(c, c + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(SharedMutexReadGuard { lock: self }),
                Err(cur) => c = cur,
            }
        }
    }

    fn read_unlock(&self) {
        let r = self.reader_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if r < 0 {
            debug_assert!(r + 1 != 0 && r + 1 != -MAX_READERS, "read unlock of unlocked SharedMutex");
            // The last reader a pending writer waits on lets it in
            if self.reader_wait.fetch_sub(1, Ordering::AcqRel) - 1 == 0 {
                self.writer_sem.release(1);
            }
        }
    }

    pub fn write(&self) -> SharedMutexWriteGuard<'_, T> {
        let writer = self.writer.lock();
        let inside = self.reader_count.fetch_sub(MAX_READERS, Ordering::AcqRel);
        if inside != 0 && self.reader_wait.fetch_add(inside, Ordering::AcqRel) + inside != 0 {
            self.writer_sem.acquire();
        }
        SharedMutexWriteGuard { lock: self, _writer: writer }
    }

    pub fn try_write(&self) -> Option<SharedMutexWriteGuard<'_, T>> {
        let writer = self.writer.try_lock()?;
        self.reader_count
            .compare_exchange(0, -MAX_READERS, Ordering::AcqRel, Ordering::Relaxed)
            .ok()?;
        Some(SharedMutexWriteGuard { lock: self, _writer: writer })
    }

    fn write_unlock(&self) {
        let queued = self.reader_count.fetch_add(MAX_READERS, Ordering::AcqRel) + MAX_READERS;
        debug_assert!(queued < MAX_READERS, "write unlock of unlocked SharedMutex");
        if queued > 0 {
            self.reader_sem.release(queued as usize);
        }
    }
}

impl<T: Default> Default for SharedMutex<T> {
    fn default() -> Self {
        SharedMutex::new(T::default())
    }
}

pub struct SharedMutexReadGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

pub struct SharedMutexWriteGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
    // Dropped after write_unlock runs, so readers go first
    _writer: MutexGuard<'a, ()>,
}

impl<T: ?Sized> Deref for SharedMutexWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SharedMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::sync::Latch;
    use crate::testing::run_as_fiber;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_try_variants() {
        let m = SharedMutex::new(1);
        let r1 = m.try_read().unwrap();
        let r2 = m.try_read().unwrap();
        assert_eq!(*r1 + *r2, 2);
        assert!(m.try_write().is_none());
        drop((r1, r2));
        let mut w = m.try_write().unwrap();
        *w = 7;
        assert!(m.try_read().is_none());
        drop(w);
        assert_eq!(*m.read(), 7);
    }

    #[test]
    fn test_writer_preference() {
        let m = Arc::new(SharedMutex::new(0u32));
        let reader = m.read();

        let writer = {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                *m.write() += 1;
            })
        };
        // Wait until the writer has announced itself
        while m.reader_count.load(Ordering::Acquire) >= 0 {
            thread::yield_now();
        }
        assert!(m.try_read().is_none());

        let late_reader = {
            let m = Arc::clone(&m);
            thread::spawn(move || *m.read())
        };
        thread::sleep(Duration::from_millis(10));
        drop(reader);
        writer.join().unwrap();
        // The late reader queued behind the writer, so it sees its update
        assert_eq!(late_reader.join().unwrap(), 1);
    }

    #[test]
    fn test_fibers_mixed() {
        run_as_fiber(|| {
            let m = Arc::new(SharedMutex::new(0usize));
            let reads = Arc::new(AtomicUsize::new(0));
            let done = Arc::new(Latch::new(40));
            for i in 0..40 {
                let m = Arc::clone(&m);
                let reads = Arc::clone(&reads);
                let done = Arc::clone(&done);
                Fiber::spawn(move || {
                    for _ in 0..50 {
                        if i % 4 == 0 {
                            *m.write() += 1;
                        } else {
                            let _g = m.read();
                            reads.fetch_add(1, Ordering::Relaxed);
                            crate::yield_now();
                        }
                    }
                    done.count_down(1);
                })
                .detach();
            }
            done.wait();
            assert_eq!(*m.read(), 10 * 50);
            assert_eq!(reads.load(Ordering::Relaxed), 30 * 50);
        });
    }
}
