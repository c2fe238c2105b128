//! Condition variable paired with [`Mutex`]

use std::time::{Duration, Instant};

use fibra_core::SpinLock;

use crate::sync::mutex::{Mutex, MutexGuard};
use crate::waiter::{WaitList, Waiter};

/// Whether a timed wait returned because its deadline passed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

#[derive(Default)]
pub struct ConditionVariable {
    waiters: SpinLock<WaitList>,
}

impl ConditionVariable {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(WaitList::new()),
        }
    }

    /// Release the mutex, wait for a notification and reacquire it.
    /// Spurious returns are possible; check the condition in a loop or use
    /// [`wait_while`](Self::wait_while).
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let (mutex, _) = self.park(guard, None);
        mutex.lock()
    }

    /// Wait while `condition` holds.
    pub fn wait_while<'a, T, F>(&self, mut guard: MutexGuard<'a, T>, mut condition: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    pub fn wait_until<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        let (mutex, notified) = self.park(guard, Some(deadline));
        (mutex.lock(), WaitTimeoutResult(!notified))
    }

    pub fn wait_for<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        self.wait_until(guard, Instant::now() + timeout)
    }

    /// Wait while `condition` holds, up to `deadline`. Times out only if
    /// the condition still holds at the deadline.
    pub fn wait_until_while<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        deadline: Instant,
        mut condition: F,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult)
    where
        F: FnMut(&mut T) -> bool,
    {
        loop {
            if !condition(&mut *guard) {
                return (guard, WaitTimeoutResult(false));
            }
            if Instant::now() >= deadline {
                return (guard, WaitTimeoutResult(true));
            }
            guard = self.wait_until(guard, deadline).0;
        }
    }

    pub fn wait_for_while<'a, T, F>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
        condition: F,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult)
    where
        F: FnMut(&mut T) -> bool,
    {
        self.wait_until_while(guard, Instant::now() + timeout, condition)
    }

    pub fn notify_one(&self) {
        let w = self.waiters.lock().claim_one();
        if let Some(w) = w {
            w.wake();
        }
    }

    pub fn notify_all(&self) {
        let all = self.waiters.lock().claim_all();
        for w in all {
            w.wake();
        }
    }

    /// Queue, release the mutex and block. The mutex is released while the
    /// list lock is held, so a notify issued after the caller's unlock
    /// always finds the waiter.
    fn park<'a, T>(&self, guard: MutexGuard<'a, T>, deadline: Option<Instant>) -> (&'a Mutex<T>, bool) {
        let mutex = MutexGuard::mutex(&guard);
        let waiter = Waiter::new_current();
        let mut list = self.waiters.lock();
        list.push(waiter.clone());
        drop(guard);
        let notified = waiter.wait(list, deadline);
        if !notified {
            self.waiters.lock().remove(&waiter);
        }
        (mutex, notified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::testing::run_as_fiber;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_threads_handoff() {
        let pair = Arc::new((Mutex::new(false), ConditionVariable::new()));
        let p2 = Arc::clone(&pair);
        let t = thread::spawn(move || {
            *p2.0.lock() = true;
            p2.1.notify_one();
        });
        let g = pair.1.wait_while(pair.0.lock(), |ready| !*ready);
        assert!(*g);
        drop(g);
        t.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let m = Mutex::new(0);
        let cv = ConditionVariable::new();
        let start = Instant::now();
        let (g, res) = cv.wait_for(m.lock(), Duration::from_millis(20));
        assert!(res.timed_out());
        assert!(start.elapsed() >= Duration::from_millis(20));
        drop(g);
        // The timed-out waiter left the list
        assert!(cv.waiters.lock().is_empty());
    }

    #[test]
    fn test_wait_for_while_predicate_satisfied() {
        let pair = Arc::new((Mutex::new(0u32), ConditionVariable::new()));
        let p2 = Arc::clone(&pair);
        let t = thread::spawn(move || {
            for _ in 0..3 {
                *p2.0.lock() += 1;
                p2.1.notify_all();
            }
        });
        let (g, res) = pair.1.wait_for_while(pair.0.lock(), Duration::from_secs(5), |n| *n < 3);
        assert!(!res.timed_out());
        assert_eq!(*g, 3);
        drop(g);
        t.join().unwrap();
    }

    #[test]
    fn test_fibers_and_thread_notify() {
        run_as_fiber(|| {
            let pair = Arc::new((Mutex::new(0usize), ConditionVariable::new()));
            let waiters: Vec<_> = (0..8)
                .map(|_| {
                    let p = Arc::clone(&pair);
                    Fiber::spawn(move || {
                        let mut g = p.1.wait_while(p.0.lock(), |n| *n == 0);
                        *g += 1;
                    })
                })
                .collect();
            crate::sleep_for(Duration::from_millis(10));
            let p = Arc::clone(&pair);
            thread::spawn(move || {
                *p.0.lock() = 1;
                p.1.notify_all();
            })
            .join()
            .unwrap();
            for mut f in waiters {
                f.join();
            }
            assert_eq!(*pair.0.lock(), 9);
        });
    }
}
