//! Timer thread
//!
//! One thread per scheduling group. It polls the group's backend, runs
//! internal expirations (wait timeouts) inline and starts a fiber on the
//! group for every user timer tick, then sleeps until the next deadline,
//! `timer_max_sleep` at most, or until an earlier timer is inserted.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fibra_core::{kdebug, kprint, ktrace, kwarn, SchedError, WorkerError};

use crate::entity::FiberSpec;
use crate::group::{LaunchPolicy, SchedulingGroup};
use crate::timer::entry::{TimerEntry, TimerTask};
use crate::tls;

pub(crate) fn spawn_timer_thread(
    group: Arc<SchedulingGroup>,
    max_sleep: Duration,
) -> Result<JoinHandle<()>, WorkerError> {
    let name = format!("fibra-timer-g{}", group.index());
    let tag = name.clone();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            kprint::set_thread_tag(tag);
            tls::set_home_group(group.index());
            kdebug!("started");
            timer_loop(&group, max_sleep);
            kdebug!("exiting");
            kprint::clear_thread_tag();
        })
        .map_err(|_| WorkerError::SpawnFailed(name))
}

fn timer_loop(group: &Arc<SchedulingGroup>, max_sleep: Duration) {
    let timers = &group.timers;
    loop {
        let now = Instant::now();
        for entry in timers.backend.poll_expired(now) {
            fire(group, entry);
        }

        let mut clock = timers.lock_clock();
        if clock.shutdown {
            break;
        }
        // Read under the clock lock so an insert cannot slip in unseen
        let wait = match timers.backend.next_deadline() {
            Some(d) => d.saturating_duration_since(Instant::now()).min(max_sleep),
            None => max_sleep,
        };
        if wait.is_zero() {
            continue;
        }
        clock.sleeping_until = Some(Instant::now() + wait);
        let (mut clock, _) = timers.wait_clock(clock, wait);
        clock.sleeping_until = None;
    }
}

fn fire(group: &Arc<SchedulingGroup>, entry: TimerEntry) {
    let timer = match entry.task {
        TimerTask::Internal(f) => {
            f();
            return;
        }
        TimerTask::User(t) => t,
    };
    if timer.is_cancelled() {
        return;
    }
    if timer.running.swap(true, Ordering::AcqRel) {
        // Previous tick still running
        group.timers.lost_ticks.fetch_add(1, Ordering::Relaxed);
        ktrace!("{} tick lost", timer.id);
        return;
    }

    let t = Arc::clone(&timer);
    let body = move || {
        if !t.is_cancelled() {
            let mut callback = t.callback.lock();
            (*callback)(t.id);
        }
        t.running.store(false, Ordering::Release);
    };
    let spec = FiberSpec {
        body: Box::new(body),
        exit_barrier: None,
        local: false,
        exec_ctx: timer.ctx.clone(),
    };
    if let Err(e) = group.start(spec, LaunchPolicy::Post) {
        timer.running.store(false, Ordering::Release);
        group.timers.lost_ticks.fetch_add(1, Ordering::Relaxed);
        if e == SchedError::NotRunning {
            kdebug!("{} tick dropped during shutdown", timer.id);
        } else {
            kwarn!("{} tick dropped: {}", timer.id, e);
        }
    }
}
