//! # fibra-core
//!
//! Platform-agnostic building blocks for the fibra fiber runtime.
//! Everything that touches the OS or the CPU lives in `fibra-runtime`.
//!
//! ## Modules
//!
//! - `id` - fiber identifier
//! - `state` - fiber run state
//! - `error` - error types
//! - `spinlock` - scheduler-internal spinlocks
//! - `slot` - generation-tagged index allocator
//! - `kprint` - kernel-style logging macros
//! - `env` - environment variable helpers

pub mod id;
pub mod state;
pub mod error;
pub mod spinlock;
pub mod slot;
pub mod kprint;
pub mod env;

pub use id::FiberId;
pub use state::FiberState;
pub use error::{MemoryError, SchedError, SchedResult, WorkerError};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
pub use slot::{SlotAllocator, SlotKey};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt};

/// Layout constants
pub mod constants {
    /// Guard page below every fiber stack
    pub const GUARD_SIZE: usize = 4096;

    /// Smallest stack a fiber may be configured with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Hard cap on workers per scheduling group
    pub const MAX_WORKERS_PER_GROUP: usize = 256;

    /// Hard cap on scheduling groups
    pub const MAX_SCHEDULING_GROUPS: usize = 64;

    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
            /// Destructive interference size
            pub const CACHE_LINE_SIZE: usize = 128;
        } else {
            pub const CACHE_LINE_SIZE: usize = 64;
        }
    }
}
