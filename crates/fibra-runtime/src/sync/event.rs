//! One-shot event
//!
//! Also serves as the exit barrier behind every joinable fiber.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use fibra_core::SpinLock;

use crate::waiter::{WaitList, Waiter};

#[derive(Default)]
pub struct Event {
    set: AtomicBool,
    waiters: SpinLock<WaitList>,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            waiters: SpinLock::new(WaitList::new()),
        }
    }

    /// Open the event and release all waiters. Idempotent.
    pub fn set(&self) {
        let woken = {
            let mut list = self.waiters.lock();
            if self.set.swap(true, Ordering::AcqRel) {
                return;
            }
            list.claim_all()
        };
        for w in woken {
            w.wake();
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut list = self.waiters.lock();
        if self.is_set() {
            return;
        }
        let waiter = Waiter::new_current();
        list.push(waiter.clone());
        waiter.wait(list, None);
    }

    pub fn wait_until(&self, deadline: Instant) -> bool {
        if self.is_set() {
            return true;
        }
        let mut list = self.waiters.lock();
        if self.is_set() {
            return true;
        }
        let waiter = Waiter::new_current();
        list.push(waiter.clone());
        if waiter.wait(list, Some(deadline)) {
            return true;
        }
        self.waiters.lock().remove(&waiter);
        self.is_set()
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}
