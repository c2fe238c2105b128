//! Single-use countdown latch

use std::time::{Duration, Instant};

use fibra_core::SpinLock;

use crate::waiter::{WaitList, Waiter};

struct Inner {
    count: usize,
    waiters: WaitList,
}

pub struct Latch {
    inner: SpinLock<Inner>,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            inner: SpinLock::new(Inner {
                count,
                waiters: WaitList::new(),
            }),
        }
    }

    /// Decrement by `n`, releasing every waiter when the count hits zero.
    ///
    /// # Panics
    ///
    /// If `n` exceeds the remaining count.
    pub fn count_down(&self, n: usize) {
        let released = {
            let mut inner = self.inner.lock();
            assert!(n <= inner.count, "latch counted below zero");
            inner.count -= n;
            if inner.count == 0 {
                inner.waiters.claim_all()
            } else {
                Vec::new()
            }
        };
        for w in released {
            w.wake();
        }
    }

    /// Whether the count has reached zero.
    pub fn try_wait(&self) -> bool {
        self.inner.lock().count == 0
    }

    pub fn wait(&self) {
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            return;
        }
        let waiter = Waiter::new_current();
        inner.waiters.push(waiter.clone());
        waiter.wait(inner, None);
    }

    /// Returns `false` if the deadline passed with the count still
    /// positive.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            return true;
        }
        let waiter = Waiter::new_current();
        inner.waiters.push(waiter.clone());
        if waiter.wait(inner, Some(deadline)) {
            return true;
        }
        let mut inner = self.inner.lock();
        inner.waiters.remove(&waiter);
        inner.count == 0
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    pub fn arrive_and_wait(&self, n: usize) {
        self.count_down(n);
        self.wait();
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
    fn test_threads_no_lost_wakeup() {
        const N: usize = 16;
        for _ in 0..20 {
            let latch = Arc::new(Latch::new(N));
            let waiters: Vec<_> = (0..N)
                .map(|_| {
                    let l = Arc::clone(&latch);
                    thread::spawn(move || l.wait())
                })
                .collect();
            let downers: Vec<_> = (0..N)
                .map(|_| {
                    let l = Arc::clone(&latch);
                    thread::spawn(move || l.count_down(1))
                })
                .collect();
            for h in downers.into_iter().chain(waiters) {
                h.join().unwrap();
            }
            assert!(latch.try_wait());
        }
    }

    #[test]
    fn test_wait_for_timeout() {
        let latch = Latch::new(1);
        assert!(!latch.wait_for(Duration::from_millis(10)));
        latch.count_down(1);
        assert!(latch.wait_for(Duration::from_millis(10)));
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn test_count_down_past_zero_panics() {
        let latch = Latch::new(1);
        latch.count_down(2);
    }

    #[test]
    fn test_arrive_and_wait_fibers() {
        run_as_fiber(|| {
            const N: usize = 64;
            let latch = Arc::new(Latch::new(N));
            let fibers: Vec<_> = (0..N)
                .map(|_| {
                    let l = Arc::clone(&latch);
                    Fiber::spawn(move || l.arrive_and_wait(1))
                })
                .collect();
            for mut f in fibers {
                f.join();
            }
            assert!(latch.try_wait());
        });
    }
}
