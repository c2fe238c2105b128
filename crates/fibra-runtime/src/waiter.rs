//! Waiters and wait lists
//!
//! Every blocking primitive parks its caller through a `Waiter`. The mode
//! is resolved once per call: a fiber is descheduled, a plain thread parks
//! on its own futex (condvar off Linux). A notifier and a timeout race on a
//! single CAS, so each wait ends with exactly one wake.
//!
//! Protocol for primitives:
//! 1. Under the primitive's list lock, push the waiter.
//! 2. `wait(guard, deadline)` releases the list lock only once the caller
//!    can no longer miss a wake.
//! 3. Notifiers `claim` under the list lock and `wake` after dropping it.
//! 4. A waiter that timed out removes itself from the list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::entity::EntityRef;
use crate::parking::{Parking, PlatformParking};
use crate::scheduler;

const WAITING: u8 = 0;
const NOTIFIED: u8 = 1;
const TIMED_OUT: u8 = 2;

/// How the current caller blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionMode {
    Fiber(EntityRef),
    Thread,
}

impl ExecutionMode {
    pub(crate) fn current() -> Self {
        match scheduler::current_entity() {
            Some(entity) => ExecutionMode::Fiber(EntityRef::new(entity)),
            None => ExecutionMode::Thread,
        }
    }
}

enum WakeTarget {
    Fiber(EntityRef),
    Thread(PlatformParking),
}

pub(crate) struct Waiter {
    state: AtomicU8,
    target: WakeTarget,
}

impl Waiter {
    /// A waiter for whoever is calling.
    pub(crate) fn new_current() -> Arc<Self> {
        let target = match ExecutionMode::current() {
            ExecutionMode::Fiber(r) => WakeTarget::Fiber(r),
            ExecutionMode::Thread => WakeTarget::Thread(PlatformParking::new()),
        };
        Arc::new(Self {
            state: AtomicU8::new(WAITING),
            target,
        })
    }

    /// Win the right to wake this waiter. Call under the list lock.
    #[inline]
    pub(crate) fn claim(&self) -> bool {
        self.state
            .compare_exchange(WAITING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Resume a claimed waiter. Call after releasing the list lock.
    pub(crate) fn wake(&self) {
        match &self.target {
            // Safety: the claim made us the only waker of this halt
            WakeTarget::Fiber(r) => unsafe { scheduler::ready_fiber(*r) },
            WakeTarget::Thread(parking) => parking.unpark_one(),
        }
    }

    fn expire(&self) {
        if self
            .state
            .compare_exchange(WAITING, TIMED_OUT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.wake();
        }
    }

    #[inline]
    pub(crate) fn is_notified(&self) -> bool {
        self.state.load(Ordering::Acquire) == NOTIFIED
    }

    /// Block until claimed or `deadline` passes. `guard` (typically the
    /// list lock guard) is dropped once the caller is committed to
    /// blocking. Returns `true` when woken by a notifier.
    pub(crate) fn wait<G>(self: &Arc<Self>, guard: G, deadline: Option<Instant>) -> bool {
        match &self.target {
            WakeTarget::Fiber(r) => self.wait_fiber(*r, guard, deadline),
            WakeTarget::Thread(parking) => self.wait_thread(parking, guard, deadline),
        }
    }

    fn wait_fiber<G>(self: &Arc<Self>, r: EntityRef, guard: G, deadline: Option<Instant>) -> bool {
        // Safety: r refers to the running fiber
        let entity = unsafe { r.entity() };

        if deadline.is_some_and(|d| d <= Instant::now()) {
            // Nobody else can hold a claim while we hold the list lock
            if self
                .state
                .compare_exchange(WAITING, TIMED_OUT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                drop(guard);
                return false;
            }
        }

        entity.scheduler_lock.lock();
        // Safety: the fiber is running, so its group is stable
        let group = std::sync::Arc::clone(unsafe { entity.group() });
        let timer = deadline.map(|d| {
            let w = Arc::clone(self);
            group.timers.add_internal(d, Box::new(move || w.expire()))
        });
        drop(guard);
        // Safety: running fiber, scheduler lock held
        unsafe { scheduler::halt_locked(entity) };

        if let Some(id) = timer {
            group.timers.cancel(id);
        }
        self.is_notified()
    }

    fn wait_thread<G>(&self, parking: &PlatformParking, guard: G, deadline: Option<Instant>) -> bool {
        drop(guard);
        loop {
            if self.state.load(Ordering::Acquire) != WAITING {
                break;
            }
            match deadline {
                None => {
                    parking.park(None);
                }
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        if self
                            .state
                            .compare_exchange(WAITING, TIMED_OUT, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            break;
                        }
                        continue;
                    }
                    parking.park(Some(d - now));
                }
            }
        }
        self.is_notified()
    }
}

/// FIFO of waiters, kept under a primitive's lock
#[derive(Default)]
pub(crate) struct WaitList {
    waiters: VecDeque<Arc<Waiter>>,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, w: Arc<Waiter>) {
        self.waiters.push_back(w);
    }

    /// Drop a waiter that gave up. Returns false if it was not queued.
    pub(crate) fn remove(&mut self, w: &Arc<Waiter>) -> bool {
        match self.waiters.iter().position(|x| Arc::ptr_eq(x, w)) {
            Some(i) => {
                self.waiters.remove(i);
                true
            }
            None => false,
        }
    }

    /// Claim the oldest live waiter, discarding stale ones.
    pub(crate) fn claim_one(&mut self) -> Option<Arc<Waiter>> {
        while let Some(w) = self.waiters.pop_front() {
            if w.claim() {
                return Some(w);
            }
        }
        None
    }

    pub(crate) fn claim_all(&mut self) -> Vec<Arc<Waiter>> {
        self.waiters.drain(..).filter(|w| w.claim()).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fibra_core::SpinLock;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_thread_waiter_notified() {
        let list = Arc::new(SpinLock::new(WaitList::new()));
        let w = Waiter::new_current();
        let guard = {
            let mut g = list.lock();
            g.push(Arc::clone(&w));
            g
        };
        let l2 = Arc::clone(&list);
        let t = thread::spawn(move || loop {
            let claimed = l2.lock().claim_one();
            if let Some(w) = claimed {
                w.wake();
                break;
            }
            thread::yield_now();
        });
        assert!(w.wait(guard, None));
        t.join().unwrap();
    }

    #[test]
    fn test_thread_waiter_timeout_then_stale() {
        let mut list = WaitList::new();
        let w = Waiter::new_current();
        list.push(Arc::clone(&w));
        let start = Instant::now();
        assert!(!w.wait((), Some(start + Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
        // Stale entry is skipped by notifiers
        assert!(list.claim_one().is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let w = Waiter::new_current();
        assert!(w.claim());
        assert!(!w.claim());
        w.expire();
        assert!(w.is_notified());
    }

    #[test]
    fn test_remove_and_claim_all() {
        let mut list = WaitList::new();
        let a = Waiter::new_current();
        let b = Waiter::new_current();
        let c = Waiter::new_current();
        list.push(Arc::clone(&a));
        list.push(Arc::clone(&b));
        list.push(Arc::clone(&c));
        assert!(list.remove(&b));
        assert!(!list.remove(&b));
        assert_eq!(list.len(), 2);
        assert_eq!(list.claim_all().len(), 2);
        assert!(a.is_notified() && c.is_notified() && !b.is_notified());
    }
}
