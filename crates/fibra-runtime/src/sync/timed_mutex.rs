//! Mutex with bounded acquisition, built from a [`Mutex`] and a
//! [`ConditionVariable`].

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use crate::sync::condvar::ConditionVariable;
use crate::sync::mutex::Mutex;

pub struct TimedMutex<T: ?Sized> {
    locked: Mutex<bool>,
    cv: ConditionVariable,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for TimedMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for TimedMutex<T> {}

impl<T> TimedMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: Mutex::new(false),
            cv: ConditionVariable::new(),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> TimedMutex<T> {
    pub fn lock(&self) -> TimedMutexGuard<'_, T> {
        let mut held = self.cv.wait_while(self.locked.lock(), |held| *held);
        *held = true;
        TimedMutexGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<TimedMutexGuard<'_, T>> {
        let mut held = self.locked.lock();
        if *held {
            return None;
        }
        *held = true;
        Some(TimedMutexGuard { lock: self })
    }

    pub fn try_lock_until(&self, deadline: Instant) -> Option<TimedMutexGuard<'_, T>> {
        let (mut held, res) = self.cv.wait_until_while(self.locked.lock(), deadline, |held| *held);
        if res.timed_out() {
            return None;
        }
        *held = true;
        Some(TimedMutexGuard { lock: self })
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<TimedMutexGuard<'_, T>> {
        self.try_lock_until(Instant::now() + timeout)
    }

    fn unlock(&self) {
        *self.locked.lock() = false;
        self.cv.notify_one();
    }
}

pub struct TimedMutexGuard<'a, T: ?Sized> {
    lock: &'a TimedMutex<T>,
}

impl<T: ?Sized> Deref for TimedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for TimedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for TimedMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_lock_for_times_out_then_succeeds() {
        let m = Arc::new(TimedMutex::new(0));
        let g = m.lock();
        let m2 = Arc::clone(&m);
        let t = thread::spawn(move || m2.try_lock_for(Duration::from_millis(10)).is_none());
        assert!(t.join().unwrap());

        let m3 = Arc::clone(&m);
        let t = thread::spawn(move || {
            let mut g = m3.try_lock_for(Duration::from_secs(5)).expect("lock handed over");
            *g += 1;
        });
        thread::sleep(Duration::from_millis(10));
        drop(g);
        t.join().unwrap();
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn test_try_lock() {
        let m = TimedMutex::new(());
        let g = m.try_lock();
        assert!(g.is_some());
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }
}
