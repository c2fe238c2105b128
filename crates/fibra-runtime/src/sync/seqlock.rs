//! Sequence lock for small `Copy` values
//!
//! Writers bump the sequence to odd, write, and bump it back to even.
//! Readers copy the value optimistically and retry if the sequence moved.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::sync::mutex::{Mutex, MutexGuard};

pub struct SeqLock<T: Copy> {
    seq: AtomicUsize,
    writer: Mutex<()>,
    data: UnsafeCell<T>,
}

// Safety: readers only ever keep copies validated against the sequence
unsafe impl<T: Copy + Send> Send for SeqLock<T> {}
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            seq: AtomicUsize::new(0),
            writer: Mutex::new(()),
            data: UnsafeCell::new(value),
        }
    }

    /// Start a read section. Waits out an in-progress write.
    pub fn begin(&self) -> usize {
        let mut spins = 0u32;
        loop {
            let s = self.seq.load(Ordering::Acquire);
            if s & 1 == 0 {
                return s;
            }
            spins += 1;
            if spins % 64 == 0 {
                crate::scheduler::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Whether data read since `begin` returned `start` may be torn.
    pub fn retry(&self, start: usize) -> bool {
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) != start
    }

    pub fn read(&self) -> T {
        loop {
            let start = self.begin();
            // Safety: a torn copy is discarded unless the sequence is
            // unchanged, and T is Copy so there is no drop glue
            let value = unsafe { ptr::read_volatile(self.data.get() as *const MaybeUninit<T>) };
            if !self.retry(start) {
                return unsafe { value.assume_init() };
            }
        }
    }

    /// Exclusive write access until the guard drops.
    pub fn lock(&self) -> SeqLockWriteGuard<'_, T> {
        let writer = self.writer.lock();
        let s = self.seq.load(Ordering::Relaxed);
        self.seq.store(s.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        SeqLockWriteGuard {
            lock: self,
            seq: s,
            _writer: writer,
        }
    }

    pub fn write(&self, value: T) {
        *self.lock() = value;
    }
}

pub struct SeqLockWriteGuard<'a, T: Copy> {
    lock: &'a SeqLock<T>,
    /// Even sequence observed before the write started
    seq: usize,
    _writer: MutexGuard<'a, ()>,
}

impl<T: Copy> Deref for SeqLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: Copy> DerefMut for SeqLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: Copy> Drop for SeqLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.seq.store(self.seq.wrapping_add(2), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_write() {
        let lock = SeqLock::new((1u64, 2u64));
        assert_eq!(lock.read(), (1, 2));
        lock.write((3, 4));
        assert_eq!(lock.read(), (3, 4));
        {
            let mut g = lock.lock();
            g.0 = 9;
        }
        assert_eq!(lock.read(), (9, 4));
        assert_eq!(lock.begin() % 2, 0);
    }

    #[test]
    fn test_readers_never_see_torn_pairs() {
        let lock = Arc::new(SeqLock::new((0u64, 0u64)));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let lock = Arc::clone(&lock);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut i = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    i += 1;
                    lock.write((i, i.wrapping_mul(3)));
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..100_000 {
                        let (a, b) = lock.read();
                        assert_eq!(b, a.wrapping_mul(3));
                    }
                })
            })
            .collect();
        for r in readers {
            r.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
