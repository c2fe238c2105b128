//! Timer subsystem
//!
//! Every scheduling group owns a timer queue and a timer thread. User
//! timers run their callback in a fresh fiber on the owning group, inside
//! the execution context captured at registration.
//!
//! ```text
//!   set_timer / set_periodic_timer
//!              │
//!              ▼
//!        TimerQueue ──► dyn TimerBackend (HeapTimerBackend)
//!              │                  │
//!        TimerRegistry      timer thread ──poll_expired()──► start fiber
//! ```
//!
//! Periodic ticks stay on the `at + k * interval` grid. A tick that comes
//! due while the previous one is still running is dropped and counted.

mod entry;
pub(crate) mod impls;
mod registry;
mod worker;

pub use entry::TimerId;
pub(crate) use entry::{TimerEntry, TimerTask, UserTimer};
pub(crate) use worker::spawn_timer_thread;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, WaitTimeoutResult};
use std::time::{Duration, Instant};

use fibra_core::{SchedError, SchedResult, SpinLock};

use crate::execution_context::ExecutionContext;
use crate::runtime;
use registry::TimerRegistry;

/// Storage and ordering of pending timers
pub(crate) trait TimerBackend: Send + Sync {
    fn insert(&self, entry: TimerEntry);

    /// Returns false if the timer already fired (one-shot) or was
    /// cancelled before.
    fn cancel(&self, id: TimerId) -> bool;

    /// Remove and return every entry due at `now`. Periodic entries are
    /// re-armed for their next tick.
    fn poll_expired(&self, now: Instant) -> Vec<TimerEntry>;

    fn next_deadline(&self) -> Option<Instant>;

    /// Live timers
    fn len(&self) -> usize;

    fn name(&self) -> &'static str {
        "unknown"
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            active: self.len(),
            ..BackendStats::default()
        }
    }
}

/// Counters kept by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BackendStats {
    pub active: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

/// Per-group timer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    /// Storage backend in use
    pub backend: &'static str,
    /// Pending entries, internal ones included
    pub active: usize,
    /// User timers still owned by a caller (not detached or killed)
    pub registered: usize,
    pub fired: u64,
    pub cancelled: u64,
    pub lost_ticks: u64,
}

pub(crate) struct ClockState {
    pub sleeping_until: Option<Instant>,
    pub shutdown: bool,
}

pub(crate) struct TimerQueue {
    group: usize,
    next_seq: AtomicU64,
    pub(crate) backend: Box<dyn TimerBackend>,
    registry: TimerRegistry,
    clock: Mutex<ClockState>,
    tick: Condvar,
    pub(crate) lost_ticks: AtomicU64,
}

impl TimerQueue {
    pub(crate) fn new(group: usize) -> Self {
        Self {
            group,
            next_seq: AtomicU64::new(1),
            backend: impls::create_backend(impls::TimerBackendType::default()),
            registry: TimerRegistry::default(),
            clock: Mutex::new(ClockState {
                sleeping_until: None,
                shutdown: false,
            }),
            tick: Condvar::new(),
            lost_ticks: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> TimerId {
        TimerId::new(self.group, self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn lock_clock(&self) -> MutexGuard<'_, ClockState> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait_clock<'a>(
        &self,
        guard: MutexGuard<'a, ClockState>,
        timeout: Duration,
    ) -> (MutexGuard<'a, ClockState>, WaitTimeoutResult) {
        self.tick
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, entry: TimerEntry) {
        let deadline = entry.deadline;
        self.backend.insert(entry);
        let clock = self.lock_clock();
        if clock.sleeping_until.is_some_and(|s| deadline < s) {
            self.tick.notify_one();
        }
    }

    /// Run `f` on the timer thread at `deadline` unless cancelled first.
    pub(crate) fn add_internal(&self, deadline: Instant, f: Box<dyn FnOnce() + Send>) -> TimerId {
        let id = self.next_id();
        self.insert(TimerEntry {
            id,
            deadline,
            interval: None,
            task: TimerTask::Internal(f),
        });
        id
    }

    pub(crate) fn add_user(
        &self,
        at: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut(TimerId) + Send>,
        ctx: Option<ExecutionContext>,
    ) -> TimerId {
        let id = self.next_id();
        let timer = Arc::new(UserTimer {
            id,
            callback: SpinLock::new(callback),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            ctx,
        });
        self.registry.register(Arc::clone(&timer));
        self.insert(TimerEntry {
            id,
            deadline: at,
            interval,
            task: TimerTask::User(timer),
        });
        id
    }

    /// Drop a pending entry. Used for internal timers.
    pub(crate) fn cancel(&self, id: TimerId) -> bool {
        self.backend.cancel(id)
    }

    /// Stop a user timer. A tick already running finishes; no new one
    /// starts.
    pub(crate) fn kill(&self, id: TimerId) -> bool {
        if let Some(t) = self.registry.remove(id) {
            t.cancelled.store(true, Ordering::Release);
        }
        self.backend.cancel(id)
    }

    /// Forget a user timer without stopping it.
    pub(crate) fn detach(&self, id: TimerId) -> bool {
        self.registry.remove(id).is_some()
    }

    pub(crate) fn stats(&self) -> TimerStats {
        let backend = self.backend.stats();
        TimerStats {
            backend: self.backend.name(),
            active: backend.active,
            registered: self.registry.len(),
            fired: backend.total_fired,
            cancelled: backend.total_cancelled,
            lost_ticks: self.lost_ticks.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.lock_clock().shutdown = true;
        self.tick.notify_all();
        self.registry.clear();
    }
}

fn owning_group(id: TimerId) -> Option<Arc<crate::group::SchedulingGroup>> {
    runtime::group_by_index(id.group())
}

/// Call `callback` once at `at`, in a fiber of the nearest group.
pub fn set_timer<F>(at: Instant, callback: F) -> SchedResult<TimerId>
where
    F: FnOnce(TimerId) + Send + 'static,
{
    let mut callback = Some(callback);
    let group = runtime::nearest_group()?;
    Ok(group.timers.add_user(
        at,
        None,
        Box::new(move |id| {
            if let Some(cb) = callback.take() {
                cb(id);
            }
        }),
        ExecutionContext::capture(),
    ))
}

/// Call `callback` at `at` and then every `interval`.
pub fn set_periodic_timer<F>(at: Instant, interval: Duration, callback: F) -> SchedResult<TimerId>
where
    F: FnMut(TimerId) + Send + 'static,
{
    if interval.is_zero() {
        return Err(SchedError::InvalidConfig("periodic timer interval must be non-zero"));
    }
    let group = runtime::nearest_group()?;
    Ok(group
        .timers
        .add_user(at, Some(interval), Box::new(callback), ExecutionContext::capture()))
}

/// Cancel a timer. Returns false if it was not pending (already fired,
/// killed, or the runtime is gone).
pub fn kill_timer(id: TimerId) -> bool {
    owning_group(id).is_some_and(|g| g.timers.kill(id))
}

/// Give up the right to kill `id`. The timer keeps running.
pub fn detach_timer(id: TimerId) -> bool {
    owning_group(id).is_some_and(|g| g.timers.detach(id))
}

/// Counters of one group's timer queue
pub fn timer_stats(group: usize) -> Option<TimerStats> {
    runtime::group_by_index(group).map(|g| g.timers.stats())
}

/// Kills its timer when dropped
#[derive(Debug)]
pub struct TimerKiller {
    id: Option<TimerId>,
}

impl TimerKiller {
    pub fn new(id: TimerId) -> Self {
        Self { id: Some(id) }
    }

    /// Kill now.
    pub fn kill(&mut self) {
        if let Some(id) = self.id.take() {
            kill_timer(id);
        }
    }

    /// Release the timer without killing it.
    pub fn into_inner(mut self) -> TimerId {
        match self.id.take() {
            Some(id) => id,
            None => unreachable!("TimerKiller without a timer"),
        }
    }
}

impl Drop for TimerKiller {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Event, Latch};
    use crate::testing::run_as_fiber;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_queue_internal_cancel() {
        let q = TimerQueue::new(0);
        let id = q.add_internal(Instant::now() + Duration::from_secs(60), Box::new(|| {}));
        assert_eq!(id.group(), 0);
        assert_eq!(q.backend.len(), 1);
        assert!(q.cancel(id));
        assert!(!q.cancel(id));
        assert_eq!(q.backend.len(), 0);
    }

    #[test]
    fn test_one_shot_timer_fires_in_fiber() {
        run_as_fiber(|| {
            let ev = Arc::new(Event::new());
            let e = Arc::clone(&ev);
            let fired_after = Arc::new(SpinLock::new(None));
            let f = Arc::clone(&fired_after);
            let start = Instant::now();
            let id = set_timer(start + Duration::from_millis(20), move |_| {
                assert!(crate::tls::is_in_fiber());
                *f.lock() = Some(start.elapsed());
                e.set();
            })
            .unwrap();
            assert!(ev.wait_for(Duration::from_secs(5)));
            let elapsed = fired_after.lock().take().unwrap();
            assert!(elapsed >= Duration::from_millis(20), "fired early: {:?}", elapsed);
            // Timer thread sleeps at most 10ms in tests; the rest is slack
            assert!(elapsed < Duration::from_millis(250), "fired late: {:?}", elapsed);
            assert!(!kill_timer(id));
        });
    }

    #[test]
    fn test_periodic_tick_count_over_window() {
        run_as_fiber(|| {
            const PERIOD: Duration = Duration::from_millis(10);
            let ticks = Arc::new(AtomicUsize::new(0));
            let t = Arc::clone(&ticks);
            let start = Instant::now();
            let id = set_periodic_timer(start + PERIOD, PERIOD, move |_| {
                t.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            // Window of 20 periods plus half a period so the last tick is
            // not on the boundary
            crate::sleep_until(start + PERIOD * 20 + PERIOD / 2);
            let seen = ticks.load(Ordering::SeqCst);
            assert!(kill_timer(id));
            assert!(seen <= 20, "more ticks than periods: {}", seen);
            assert!(seen >= 12, "too few ticks: {}", seen);
        });
    }

    #[test]
    fn test_stats_track_registered_timers() {
        let q = TimerQueue::new(0);
        let far = Instant::now() + Duration::from_secs(60);
        let a = q.add_user(far, None, Box::new(|_| {}), None);
        let b = q.add_user(far, Some(Duration::from_secs(1)), Box::new(|_| {}), None);
        q.add_internal(far, Box::new(|| {}));

        let stats = q.stats();
        assert_eq!(stats.backend, "binary_heap");
        assert_eq!(stats.active, 3);
        assert_eq!(stats.registered, 2);

        // Detached timers stay pending but are no longer owned
        assert!(q.detach(a));
        let stats = q.stats();
        assert_eq!(stats.active, 3);
        assert_eq!(stats.registered, 1);

        assert!(q.kill(b));
        let stats = q.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.registered, 0);
        assert_eq!(stats.cancelled, 1);
    }

    #[test]
    fn test_periodic_timer_and_kill() {
        run_as_fiber(|| {
            let ticks = Arc::new(AtomicUsize::new(0));
            let latch = Arc::new(Latch::new(3));
            let (t, l) = (Arc::clone(&ticks), Arc::clone(&latch));
            let id = set_periodic_timer(Instant::now(), Duration::from_millis(5), move |_| {
                if t.fetch_add(1, Ordering::SeqCst) < 3 {
                    l.count_down(1);
                }
            })
            .unwrap();
            assert!(latch.wait_for(Duration::from_secs(5)));
            assert!(kill_timer(id));
            crate::sleep_for(Duration::from_millis(20));
            let after_kill = ticks.load(Ordering::SeqCst);
            crate::sleep_for(Duration::from_millis(30));
            assert_eq!(ticks.load(Ordering::SeqCst), after_kill);
        });
    }

    #[test]
    fn test_overlapping_ticks_are_lost() {
        run_as_fiber(|| {
            let group = crate::runtime::nearest_group().unwrap();
            let lost_before = group.timers.lost_ticks.load(Ordering::Relaxed);
            let runs = Arc::new(AtomicUsize::new(0));
            let r = Arc::clone(&runs);
            let id = set_periodic_timer(Instant::now(), Duration::from_millis(2), move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                crate::sleep_for(Duration::from_millis(30));
            })
            .unwrap();
            crate::sleep_for(Duration::from_millis(50));
            kill_timer(id);
            assert!(runs.load(Ordering::SeqCst) <= 3);
            assert!(group.timers.lost_ticks.load(Ordering::Relaxed) > lost_before);
        });
    }

    #[test]
    fn test_timer_killer_and_context() {
        use crate::execution_context::{ExecutionContext, ExecutionLocal};
        static NAME: ExecutionLocal<&'static str> = ExecutionLocal::new(|| "req-7");

        run_as_fiber(|| {
            let fired = Arc::new(AtomicBool::new(false));
            let f = Arc::clone(&fired);
            let killer = TimerKiller::new(
                set_timer(Instant::now() + Duration::from_millis(30), move |_| f.store(true, Ordering::SeqCst))
                    .unwrap(),
            );
            drop(killer);

            let ev = Arc::new(Event::new());
            let e = Arc::clone(&ev);
            let ctx = ExecutionContext::new();
            let id = ctx
                .execute(|| {
                    NAME.with(|_| ());
                    set_timer(Instant::now(), move |_| {
                        assert_eq!(NAME.with(|n| *n), "req-7");
                        e.set();
                    })
                })
                .unwrap();
            assert!(detach_timer(id));
            assert!(ev.wait_for(Duration::from_secs(5)));

            crate::sleep_for(Duration::from_millis(50));
            assert!(!fired.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn test_zero_interval_rejected() {
        run_as_fiber(|| {
            let r = set_periodic_timer(Instant::now(), Duration::ZERO, |_| {});
            assert!(matches!(r, Err(SchedError::InvalidConfig(_))));
        });
    }
}
