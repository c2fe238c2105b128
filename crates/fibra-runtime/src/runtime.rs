//! Process-wide runtime
//!
//! One runtime may be running at a time. `start` builds the scheduling
//! groups and their threads and publishes them; everything that needs a
//! group (fiber start, timers, reactor attach) looks it up from here or,
//! on a worker, takes the worker's own group without touching the global.
//!
//! # Shutdown order
//!
//! 1. Stop accepting new fibers
//! 2. Wait up to `shutdown_grace` for live fibers to finish
//! 3. Stop reactors
//! 4. Stop and join workers
//! 5. Stop and join timer threads
//! 6. Release pooled entities and unpublish the runtime

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fibra_core::{kdebug, kinfo, kwarn, SchedError, SchedResult};

use crate::config::RuntimeConfig;
use crate::entity::FiberSpec;
use crate::execution_context::ExecutionContext;
use crate::fiber::{Attributes, Fiber, GroupPlacement};
use crate::group::{LaunchPolicy, RuntimeShared, SchedulingGroup};
use crate::sync::Event;
use crate::timer::spawn_timer_thread;
use crate::tls;
use crate::worker::{self, IdleTuning};

struct RuntimeInner {
    config: RuntimeConfig,
    groups: Arc<[Arc<SchedulingGroup>]>,
    shared: Arc<RuntimeShared>,
    next_group: AtomicUsize,
    threads: Mutex<RuntimeThreads>,
    shutting_down: AtomicBool,
}

#[derive(Default)]
struct RuntimeThreads {
    workers: Vec<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    reactors: Vec<JoinHandle<()>>,
}

static RUNTIME: RwLock<Option<Arc<RuntimeInner>>> = RwLock::new(None);

fn current() -> Option<Arc<RuntimeInner>> {
    RUNTIME.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Start the runtime with `config`.
pub fn start(config: RuntimeConfig) -> SchedResult<()> {
    config.validate()?;
    let mut slot = RUNTIME.write().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(SchedError::AlreadyInitialized);
    }

    let shared = Arc::new(RuntimeShared::new(config.max_fibers));
    let groups: Arc<[Arc<SchedulingGroup>]> = (0..config.scheduling_groups)
        .map(|i| Arc::new(SchedulingGroup::new(i, &config, Arc::clone(&shared))))
        .collect();

    let inner = Arc::new(RuntimeInner {
        config,
        groups,
        shared,
        next_group: AtomicUsize::new(0),
        threads: Mutex::new(RuntimeThreads::default()),
        shutting_down: AtomicBool::new(false),
    });

    if let Err(e) = spawn_threads(&inner) {
        kwarn!("runtime start failed: {}", e);
        let _ = teardown(&inner);
        return Err(e);
    }

    kinfo!(
        "runtime started: {} groups x {} workers",
        inner.config.scheduling_groups,
        inner.config.workers_per_group
    );
    *slot = Some(inner);
    Ok(())
}

fn spawn_threads(inner: &Arc<RuntimeInner>) -> SchedResult<()> {
    let config = &inner.config;
    let tuning = IdleTuning::from_config(config);
    let mut threads = inner.threads.lock().unwrap_or_else(PoisonError::into_inner);

    for group in inner.groups.iter() {
        #[cfg(target_os = "linux")]
        if config.enable_reactor {
            let (reactor, handle) = crate::reactor::Reactor::start(group, config.reactor_events)?;
            group.set_reactor(reactor);
            threads.reactors.push(handle);
        }
        threads.timers.push(spawn_timer_thread(Arc::clone(group), config.timer_max_sleep)?);
        threads
            .workers
            .extend(worker::spawn_workers(group, &inner.groups, tuning)?);
    }
    Ok(())
}

/// Stop the running runtime.
///
/// Fibers still blocked after the grace period are abandoned; their
/// stacks are leaked.
///
/// # Panics
///
/// Panics when called from a fiber or a runtime-owned thread.
pub fn shutdown() -> SchedResult<()> {
    if !tls::current_worker().is_null() || tls::home_group().is_some() {
        panic!("runtime shutdown called from a runtime thread");
    }
    let inner = current().ok_or(SchedError::NotRunning)?;
    if inner.shutting_down.swap(true, Ordering::AcqRel) {
        return Err(SchedError::NotRunning);
    }

    inner.shared.stop_accepting();
    let deadline = Instant::now() + inner.config.shutdown_grace;
    while inner.shared.live() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    let left = inner.shared.live();
    if left > 0 {
        kwarn!("shutdown grace expired with {} fibers still live", left);
    }

    let result = teardown(&inner);
    *RUNTIME.write().unwrap_or_else(PoisonError::into_inner) = None;
    kinfo!("runtime stopped");
    result
}

fn teardown(inner: &RuntimeInner) -> SchedResult<()> {
    let threads = std::mem::take(&mut *inner.threads.lock().unwrap_or_else(PoisonError::into_inner));

    #[cfg(target_os = "linux")]
    for group in inner.groups.iter() {
        if let Some(reactor) = group.take_reactor() {
            reactor.stop();
        }
    }
    let reactors = worker::join_all(threads.reactors);

    for group in inner.groups.iter() {
        group.stop();
    }
    let workers = worker::join_all(threads.workers);

    for group in inner.groups.iter() {
        group.timers.shutdown();
    }
    let timers = worker::join_all(threads.timers);

    for group in inner.groups.iter() {
        group.clear();
    }
    kdebug!("runtime threads joined");
    reactors?;
    workers?;
    timers?;
    Ok(())
}

pub fn is_running() -> bool {
    current().is_some_and(|rt| !rt.shutting_down.load(Ordering::Acquire))
}

/// Group a new fiber or timer lands on when the caller expresses no
/// preference.
pub(crate) fn nearest_group() -> SchedResult<Arc<SchedulingGroup>> {
    let worker = tls::current_worker();
    if !worker.is_null() {
        // Safety: the worker context outlives every call on its thread
        return Ok(Arc::clone(unsafe { &*worker }.group()));
    }
    let rt = current().ok_or(SchedError::NotRunning)?;
    if let Some(home) = tls::home_group().and_then(|i| rt.groups.get(i)) {
        return Ok(Arc::clone(home));
    }
    let i = rt.next_group.fetch_add(1, Ordering::Relaxed) % rt.groups.len();
    Ok(Arc::clone(&rt.groups[i]))
}

pub(crate) fn group_by_index(index: usize) -> Option<Arc<SchedulingGroup>> {
    current().and_then(|rt| rt.groups.get(index).cloned())
}

fn resolve_group(placement: GroupPlacement) -> SchedResult<Arc<SchedulingGroup>> {
    match placement {
        GroupPlacement::Nearest => nearest_group(),
        GroupPlacement::Specific(i) => {
            let rt = current().ok_or(SchedError::NotRunning)?;
            rt.groups.get(i).cloned().ok_or(SchedError::NoSuchGroup(i))
        }
    }
}

fn detached_spec(body: Box<dyn FnOnce() + Send>, local: bool) -> FiberSpec {
    FiberSpec {
        body,
        exit_barrier: None,
        local,
        exec_ctx: ExecutionContext::capture(),
    }
}

/// Start a joinable fiber.
pub fn start_fiber<F>(attrs: Attributes, f: F) -> SchedResult<Fiber>
where
    F: FnOnce() + Send + 'static,
{
    let group = resolve_group(attrs.scheduling_group)?;
    let exit = Arc::new(Event::new());
    let spec = FiberSpec {
        exit_barrier: Some(Arc::clone(&exit)),
        ..detached_spec(Box::new(f), attrs.scheduling_group_local)
    };
    let id = group.start(spec, attrs.launch_policy)?;
    Ok(Fiber::new(id, exit))
}

/// Start a fiber nobody joins. Returns false if it could not be started.
pub fn start_fiber_detached<F>(f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let started = nearest_group()
        .and_then(|g| g.start(detached_spec(Box::new(f), false), LaunchPolicy::Post));
    match started {
        Ok(_) => true,
        Err(e) => {
            kdebug!("detached start failed: {}", e);
            false
        }
    }
}

/// Start every fiber of `batch` on the nearest group, or none of them.
pub fn start_fibers_detached<I, F>(batch: I) -> bool
where
    I: IntoIterator<Item = F>,
    F: FnOnce() + Send + 'static,
{
    let specs: Vec<FiberSpec> = batch
        .into_iter()
        .map(|f| detached_spec(Box::new(f), false))
        .collect();
    if specs.is_empty() {
        return true;
    }
    match nearest_group().and_then(|g| g.start_batch(specs)) {
        Ok(()) => true,
        Err(e) => {
            kdebug!("batch start failed: {}", e);
            false
        }
    }
}

/// Run `f` in a fiber and block the calling thread until it returns. A
/// panic in `f` is resumed on the caller.
pub fn run_on_fiber<F, R>(f: F) -> SchedResult<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    type Outcome<R> = Option<Result<R, Box<dyn Any + Send>>>;
    let slot: Arc<Mutex<Outcome<R>>> = Arc::new(Mutex::new(None));
    let out = Arc::clone(&slot);
    let mut fiber = start_fiber(Attributes::default(), move || {
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        *out.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
    })?;
    fiber.join();

    let outcome = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    match outcome {
        Some(Ok(value)) => Ok(value),
        Some(Err(payload)) => panic::resume_unwind(payload),
        None => unreachable!("fiber exited without storing its result"),
    }
}

/// Live fibers across all groups, 0 when stopped.
pub fn fiber_count() -> usize {
    current().map_or(0, |rt| rt.shared.live())
}

/// Runnable fibers waiting in run queues across all groups.
pub fn run_queue_depth() -> usize {
    current().map_or(0, |rt| rt.groups.iter().map(|g| g.run_queue.len()).sum())
}

pub fn scheduling_group_count() -> usize {
    current().map_or(0, |rt| rt.groups.len())
}

/// Index of the caller's scheduling group, if it runs on a worker.
pub fn current_scheduling_group() -> Option<usize> {
    let worker = tls::current_worker();
    // Safety: as in nearest_group
    (!worker.is_null()).then(|| unsafe { &*worker }.group().index())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Latch;
    use crate::testing::{ensure_runtime, run_as_fiber};
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_second_start_is_rejected() {
        ensure_runtime();
        assert!(is_running());
        assert_eq!(start(RuntimeConfig::new()), Err(SchedError::AlreadyInitialized));
    }

    #[test]
    fn test_detached_batch_with_latch() {
        ensure_runtime();
        const N: usize = 1000;
        let latch = Arc::new(Latch::new(N));
        let sum = Arc::new(AtomicU64::new(0));
        let batch = (0..N).map(|i| {
            let latch = Arc::clone(&latch);
            let sum = Arc::clone(&sum);
            move || {
                sum.fetch_add(i as u64, Ordering::Relaxed);
                latch.count_down(1);
            }
        });
        let base = fiber_count();
        assert!(start_fibers_detached(batch));
        latch.wait();
        assert_eq!(sum.load(Ordering::Relaxed), (N * (N - 1) / 2) as u64);

        // Retirement trails count_down; other tests may share the runtime,
        // so only require falling back to the level seen before the batch
        let deadline = Instant::now() + Duration::from_secs(5);
        while fiber_count() > base && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(fiber_count() <= base, "fiber_count {} stuck above {}", fiber_count(), base);
    }

    #[test]
    fn test_specific_group_placement() {
        ensure_runtime();
        let groups = scheduling_group_count();
        for g in 0..groups {
            let seen = Arc::new(AtomicUsize::new(usize::MAX));
            let s = Arc::clone(&seen);
            let attrs = Attributes::new().scheduling_group(g).scheduling_group_local(true);
            let mut f = start_fiber(attrs, move || {
                s.store(current_scheduling_group().unwrap_or(usize::MAX), Ordering::SeqCst);
            })
            .unwrap();
            f.join();
            assert_eq!(seen.load(Ordering::SeqCst), g);
        }
        assert_eq!(
            start_fiber(Attributes::new().scheduling_group(groups), || {}).unwrap_err(),
            SchedError::NoSuchGroup(groups)
        );
    }

    #[test]
    fn test_nearest_group_from_worker_is_own_group() {
        run_as_fiber(|| {
            let mine = current_scheduling_group().unwrap();
            assert_eq!(nearest_group().unwrap().index(), mine);
        });
    }

    #[test]
    fn test_dispatch_runs_child_on_callers_worker() {
        run_as_fiber(|| {
            let here = thread::current().id();
            let seen = Arc::new(Mutex::new(None));
            let s = Arc::clone(&seen);
            let attrs = Attributes::new().launch_policy(LaunchPolicy::Dispatch);
            let mut child = start_fiber(attrs, move || {
                *s.lock().unwrap() = Some(thread::current().id());
            })
            .unwrap();
            child.join();
            assert_eq!(*seen.lock().unwrap(), Some(here));
        });
    }

    #[test]
    fn test_run_on_fiber_returns_value() {
        ensure_runtime();
        let v = run_on_fiber(|| {
            assert!(tls::is_in_fiber());
            41 + 1
        })
        .unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_run_on_fiber_resumes_panic() {
        ensure_runtime();
        let _ = run_on_fiber(|| panic!("boom"));
    }
}
