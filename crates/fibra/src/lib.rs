//! # fibra - stackful fibers for Rust
//!
//! M:N userspace threads scheduled over a small pool of OS workers.
//!
//! ## Features
//!
//! - **Scheduling groups**: workers are partitioned into groups, each with
//!   its own run queue, timer thread and (on Linux) epoll reactor
//! - **Context-adaptive sync**: `Mutex`, `ConditionVariable`, `Latch`,
//!   `Event` and friends suspend a fiber but block an OS thread
//! - **Timers**: one-shot and periodic callbacks, run in fibers
//! - **Locals**: fiber-local and execution-context-local storage
//! - **Reactor**: edge-triggered descriptor readiness dispatched to fibers
//!
//! ## Quick Start
//!
//! ```ignore
//! use fibra::{Fiber, Latch, Runtime, RuntimeConfig};
//! use std::sync::Arc;
//!
//! fn main() {
//!     let mut runtime = Runtime::new(RuntimeConfig::default());
//!
//!     runtime.block_on(|| {
//!         let latch = Arc::new(Latch::new(10));
//!         for i in 0..10 {
//!             let latch = Arc::clone(&latch);
//!             fibra::start_fiber_detached(move || {
//!                 println!("hello from fiber {}", i);
//!                 latch.count_down(1);
//!             });
//!         }
//!         latch.wait();
//!
//!         let mut child = Fiber::spawn(|| fibra::yield_now());
//!         child.join();
//!     });
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        User Code                            │
//! │      start_fiber(), Fiber::join(), Mutex, Latch, timers     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Scheduling Group  × N                     │
//! │       run queue, entity pool, sleeping-worker parking       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Workers  │      │   Timer   │      │  Reactor  │
//!    │  (steal)  │      │  Thread   │      │  (epoll)  │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

// Re-export core types
pub use fibra_core::{FiberId, FiberState, SchedError, SchedResult};

// Re-export kprint macros for logging
pub use fibra_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use fibra_core::kprint::{
    init as init_logging, set_flush_enabled, set_log_level, set_thread_tag, LogLevel,
};

// Re-export env utilities
pub use fibra_core::{env_get, env_get_bool, env_get_millis, env_get_opt};

// Re-export runtime types and free functions
pub use fibra_runtime::{
    block_on, block_on_for, block_on_until, current_fiber_id, current_scheduling_group,
    detach_timer, fiber_count, is_in_fiber, is_running, kill_timer, run_on_fiber,
    run_queue_depth, scheduling_group_count, set_periodic_timer, set_timer, sleep_for,
    sleep_until, start_fiber, start_fiber_detached, start_fibers_detached, timer_stats,
    yield_now, Attributes, ConfigError, ExecutionContext, ExecutionLocal, Fiber, FiberLocal,
    GroupPlacement, LaunchPolicy, RuntimeConfig, TimerId, TimerKiller, TimerStats,
};
pub use fibra_runtime::sync::{
    ConditionVariable, Event, Latch, Mutex, MutexGuard, SeqLock, SeqLockWriteGuard, SharedMutex,
    SharedMutexReadGuard, SharedMutexWriteGuard, TimedMutex, TimedMutexGuard, WaitTimeoutResult,
};

#[cfg(target_os = "linux")]
pub use fibra_runtime::reactor::{
    CleanupReason, Descriptor, DescriptorHandler, EventAction, Interest, Reactor,
};

use fibra_runtime::runtime;

/// Owns the process-wide runtime for its lifetime
///
/// Only one runtime can run at a time. Dropping a started handle shuts the
/// runtime down.
pub struct Runtime {
    config: Option<RuntimeConfig>,
    started: bool,
}

impl Runtime {
    /// Create a handle. Nothing starts until `start()` or `block_on()`.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config: Some(config),
            started: false,
        }
    }

    /// Spawn workers, timer threads and reactors.
    pub fn start(&mut self) -> SchedResult<()> {
        let config = self.config.take().ok_or(SchedError::AlreadyInitialized)?;
        runtime::start(config)?;
        self.started = true;
        Ok(())
    }

    /// Run `f` in a fiber and wait for it, starting the runtime if needed.
    ///
    /// The runtime stays up afterwards; fibers spawned by `f` keep running
    /// until `shutdown()` or drop.
    pub fn block_on<F, T>(&mut self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.started {
            if let Err(e) = self.start() {
                panic!("failed to start runtime: {}", e);
            }
        }
        match runtime::run_on_fiber(f) {
            Ok(value) => value,
            Err(e) => panic!("failed to start fiber: {}", e),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Stop the runtime, waiting up to the configured grace period for
    /// live fibers.
    pub fn shutdown(&mut self) -> SchedResult<()> {
        if !std::mem::replace(&mut self.started, false) {
            return Ok(());
        }
        runtime::shutdown()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            kerror!("runtime shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_runtime_lifecycle() {
        let config = RuntimeConfig::new()
            .scheduling_groups(2)
            .workers_per_group(2)
            .stack_size(128 * 1024)
            .shutdown_grace(Duration::from_secs(5));
        let mut rt = Runtime::new(config);
        assert!(!rt.is_started());
        rt.start().unwrap();
        assert!(rt.is_started());
        assert!(is_running());
        assert_eq!(scheduling_group_count(), 2);

        // A handle only starts once
        assert!(matches!(rt.start(), Err(SchedError::AlreadyInitialized)));

        let before = fiber_count();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let total = rt.block_on(move || {
            assert!(is_in_fiber());
            let latch = Arc::new(Latch::new(1000));
            for _ in 0..1000 {
                let latch = Arc::clone(&latch);
                let counter = Arc::clone(&seen);
                assert!(start_fiber_detached(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                    latch.count_down(1);
                }));
            }
            latch.wait();
            seen.load(Ordering::Relaxed)
        });
        assert_eq!(total, 1000);
        assert_eq!(counter.load(Ordering::Relaxed), 1000);

        // Exited fibers are retired asynchronously
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fiber_count() > before && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fiber_count(), before);

        rt.shutdown().unwrap();
        assert!(!is_running());
        // Second shutdown is a no-op
        rt.shutdown().unwrap();
    }
}
