//! # fibra-runtime
//!
//! The fiber scheduler and everything built on it.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly) and guarded stacks
//! - Scheduling groups, worker threads and work stealing
//! - Synchronization primitives that work from fibers and threads alike
//! - Fiber-local and execution-context storage
//! - Per-group timers
//! - An epoll reactor for fiber-driven I/O (Linux)
//!
//! Most applications use the `fibra` facade instead of this crate.

#![cfg_attr(not(target_os = "linux"), allow(dead_code))]

pub mod arch;
pub mod config;
pub mod execution_context;
pub mod fiber;
pub mod future;
pub mod local;
pub mod parking;
pub mod runtime;
pub mod scheduler;
pub mod stack;
pub mod sync;
pub mod timer;
pub mod tls;

mod entity;
mod group;
mod run_queue;
mod waiter;
mod worker;

#[cfg(target_os = "linux")]
pub mod reactor;

#[cfg(test)]
mod testing;

// Re-exports
pub use config::{ConfigError, RuntimeConfig};
pub use execution_context::{ExecutionContext, ExecutionLocal};
pub use fiber::{Attributes, Fiber, GroupPlacement};
pub use future::{block_on, block_on_for, block_on_until};
pub use group::LaunchPolicy;
pub use local::FiberLocal;
pub use runtime::{
    current_scheduling_group, fiber_count, is_running, run_on_fiber, run_queue_depth,
    scheduling_group_count, start_fiber, start_fiber_detached, start_fibers_detached,
};
pub use scheduler::{current_fiber_id, sleep_for, sleep_until, yield_now};
pub use timer::{
    detach_timer, kill_timer, set_periodic_timer, set_timer, timer_stats, TimerId, TimerKiller,
    TimerStats,
};
pub use tls::is_in_fiber;

