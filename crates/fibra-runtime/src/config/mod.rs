//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. `FIBRA_*` environment variables (`from_env`)
//! 3. User's `FIBRA_CONFIG_RS` file (compile time)
//! 4. Library defaults
//!
//! ```rust,ignore
//! use fibra_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .scheduling_groups(2)
//!     .workers_per_group(4)
//!     .stack_size(256 * 1024);
//! ```

pub mod defaults;

use std::time::Duration;

use fibra_core::constants::{MAX_SCHEDULING_GROUPS, MAX_WORKERS_PER_GROUP, MIN_STACK_SIZE};
use fibra_core::env::{env_get, env_get_bool, env_get_millis};
use fibra_core::SchedError;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of scheduling groups
    pub scheduling_groups: usize,
    /// Worker OS threads per group
    pub workers_per_group: usize,
    /// Cap on live fibers across the runtime
    pub max_fibers: usize,
    /// Usable stack bytes per fiber (a guard page is added)
    pub stack_size: usize,
    /// Exited entities kept per group for reuse
    pub entity_pool_size: usize,
    /// Per-worker run queue capacity before spilling to the group queue
    pub local_queue_capacity: usize,
    /// Idle rounds between cross-group steal attempts, 0 disables
    pub cross_group_steal_every: u32,
    /// Spins before an idle worker parks
    pub idle_spins: u32,
    /// Upper bound on one park
    pub park_timeout: Duration,
    /// Upper bound on one timer-thread sleep
    pub timer_max_sleep: Duration,
    /// How long shutdown waits for live fibers to finish
    pub shutdown_grace: Duration,
    /// Start one reactor per scheduling group
    pub enable_reactor: bool,
    /// epoll_wait batch size
    pub reactor_events: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults overridden by the environment.
    ///
    /// Environment variables (all optional):
    /// - `FIBRA_SCHEDULING_GROUPS`
    /// - `FIBRA_WORKERS_PER_GROUP`
    /// - `FIBRA_MAX_FIBERS`
    /// - `FIBRA_STACK_SIZE` (bytes)
    /// - `FIBRA_ENTITY_POOL_SIZE`
    /// - `FIBRA_LOCAL_QUEUE_CAPACITY`
    /// - `FIBRA_CROSS_GROUP_STEAL_EVERY` (0 disables)
    /// - `FIBRA_IDLE_SPINS`
    /// - `FIBRA_PARK_TIMEOUT_MS`
    /// - `FIBRA_TIMER_MAX_SLEEP_MS`
    /// - `FIBRA_SHUTDOWN_GRACE_MS`
    /// - `FIBRA_ENABLE_REACTOR` (0/1)
    /// - `FIBRA_REACTOR_EVENTS`
    pub fn from_env() -> Self {
        Self {
            scheduling_groups: env_get("FIBRA_SCHEDULING_GROUPS", defaults::SCHEDULING_GROUPS),
            workers_per_group: env_get("FIBRA_WORKERS_PER_GROUP", defaults::WORKERS_PER_GROUP),
            max_fibers: env_get("FIBRA_MAX_FIBERS", defaults::MAX_FIBERS),
            stack_size: env_get("FIBRA_STACK_SIZE", defaults::STACK_SIZE),
            entity_pool_size: env_get("FIBRA_ENTITY_POOL_SIZE", defaults::ENTITY_POOL_SIZE),
            local_queue_capacity: env_get(
                "FIBRA_LOCAL_QUEUE_CAPACITY",
                defaults::LOCAL_QUEUE_CAPACITY,
            ),
            cross_group_steal_every: env_get(
                "FIBRA_CROSS_GROUP_STEAL_EVERY",
                defaults::CROSS_GROUP_STEAL_EVERY,
            ),
            idle_spins: env_get("FIBRA_IDLE_SPINS", defaults::IDLE_SPINS),
            park_timeout: env_get_millis("FIBRA_PARK_TIMEOUT_MS", defaults::PARK_TIMEOUT_MS),
            timer_max_sleep: env_get_millis(
                "FIBRA_TIMER_MAX_SLEEP_MS",
                defaults::TIMER_MAX_SLEEP_MS,
            ),
            shutdown_grace: env_get_millis("FIBRA_SHUTDOWN_GRACE_MS", defaults::SHUTDOWN_GRACE_MS),
            enable_reactor: env_get_bool("FIBRA_ENABLE_REACTOR", defaults::ENABLE_REACTOR),
            reactor_events: env_get("FIBRA_REACTOR_EVENTS", defaults::REACTOR_EVENTS),
        }
    }

    /// Compile-time defaults only, ignoring the environment.
    pub fn new() -> Self {
        Self {
            scheduling_groups: defaults::SCHEDULING_GROUPS,
            workers_per_group: defaults::WORKERS_PER_GROUP,
            max_fibers: defaults::MAX_FIBERS,
            stack_size: defaults::STACK_SIZE,
            entity_pool_size: defaults::ENTITY_POOL_SIZE,
            local_queue_capacity: defaults::LOCAL_QUEUE_CAPACITY,
            cross_group_steal_every: defaults::CROSS_GROUP_STEAL_EVERY,
            idle_spins: defaults::IDLE_SPINS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            timer_max_sleep: Duration::from_millis(defaults::TIMER_MAX_SLEEP_MS),
            shutdown_grace: Duration::from_millis(defaults::SHUTDOWN_GRACE_MS),
            enable_reactor: defaults::ENABLE_REACTOR,
            reactor_events: defaults::REACTOR_EVENTS,
        }
    }

    // Builder methods

    pub fn scheduling_groups(mut self, n: usize) -> Self {
        self.scheduling_groups = n;
        self
    }

    pub fn workers_per_group(mut self, n: usize) -> Self {
        self.workers_per_group = n;
        self
    }

    pub fn max_fibers(mut self, n: usize) -> Self {
        self.max_fibers = n;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn entity_pool_size(mut self, n: usize) -> Self {
        self.entity_pool_size = n;
        self
    }

    pub fn local_queue_capacity(mut self, cap: usize) -> Self {
        self.local_queue_capacity = cap;
        self
    }

    pub fn cross_group_steal_every(mut self, rounds: u32) -> Self {
        self.cross_group_steal_every = rounds;
        self
    }

    pub fn idle_spins(mut self, spins: u32) -> Self {
        self.idle_spins = spins;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn timer_max_sleep(mut self, d: Duration) -> Self {
        self.timer_max_sleep = d;
        self
    }

    pub fn shutdown_grace(mut self, d: Duration) -> Self {
        self.shutdown_grace = d;
        self
    }

    pub fn enable_reactor(mut self, enable: bool) -> Self {
        self.enable_reactor = enable;
        self
    }

    pub fn reactor_events(mut self, n: usize) -> Self {
        self.reactor_events = n;
        self
    }

    pub fn total_workers(&self) -> usize {
        self.scheduling_groups * self.workers_per_group
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduling_groups == 0 || self.scheduling_groups > MAX_SCHEDULING_GROUPS {
            return Err(ConfigError::InvalidValue("scheduling_groups must be in 1..=64"));
        }
        if self.workers_per_group == 0 || self.workers_per_group > MAX_WORKERS_PER_GROUP {
            return Err(ConfigError::InvalidValue("workers_per_group must be in 1..=256"));
        }
        if self.max_fibers == 0 {
            return Err(ConfigError::InvalidValue("max_fibers must be > 0"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.local_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("local_queue_capacity must be > 0"));
        }
        if self.enable_reactor && self.reactor_events == 0 {
            return Err(ConfigError::InvalidValue("reactor_events must be > 0"));
        }
        Ok(())
    }

    /// Dump the effective configuration to stderr.
    pub fn print(&self) {
        eprintln!("fibra configuration:");
        eprintln!("  scheduling_groups:        {}", self.scheduling_groups);
        eprintln!("  workers_per_group:        {}", self.workers_per_group);
        eprintln!("  max_fibers:               {}", self.max_fibers);
        eprintln!("  stack_size:               {}", self.stack_size);
        eprintln!("  entity_pool_size:         {}", self.entity_pool_size);
        eprintln!("  local_queue_capacity:     {}", self.local_queue_capacity);
        eprintln!("  cross_group_steal_every:  {}", self.cross_group_steal_every);
        eprintln!("  idle_spins:               {}", self.idle_spins);
        eprintln!("  park_timeout:             {:?}", self.park_timeout);
        eprintln!("  timer_max_sleep:          {:?}", self.timer_max_sleep);
        eprintln!("  shutdown_grace:           {:?}", self.shutdown_grace);
        eprintln!("  enable_reactor:           {}", self.enable_reactor);
        eprintln!("  reactor_events:           {}", self.reactor_events);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for SchedError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => SchedError::InvalidConfig(msg),
        }
    }
}
