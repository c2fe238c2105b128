//! Error types for the fibra runtime
//!
//! Only recoverable conditions are errors. Misuse (double join, dropping a
//! joinable handle, recursive locking) panics, and timeouts are plain
//! `bool`/`Option` results.

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// No runtime is running, or it is shutting down
    NotRunning,

    /// A global runtime is already installed
    AlreadyInitialized,

    /// The configured fiber cap has been reached
    CapacityExhausted,

    /// Requested scheduling group does not exist
    NoSuchGroup(usize),

    /// Stack mapping failed
    Memory(MemoryError),

    /// Worker, timer or reactor thread failure
    Worker(WorkerError),

    /// Configuration rejected by validation
    InvalidConfig(&'static str),

    /// Raw OS error number
    Os(i32),
}

impl SchedError {
    /// Whether the caller may retry later (back-off condition).
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedError::CapacityExhausted | SchedError::Memory(_))
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NotRunning => write!(f, "runtime not running"),
            SchedError::AlreadyInitialized => write!(f, "runtime already initialized"),
            SchedError::CapacityExhausted => write!(f, "fiber capacity exhausted"),
            SchedError::NoSuchGroup(g) => write!(f, "no scheduling group {}", g),
            SchedError::Memory(e) => write!(f, "memory error: {}", e),
            SchedError::Worker(e) => write!(f, "worker error: {}", e),
            SchedError::InvalidConfig(what) => write!(f, "invalid config: {}", what),
            SchedError::Os(code) => write!(f, "os error {}", code),
        }
    }
}

impl std::error::Error for SchedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SchedError::Memory(e) => Some(e),
            SchedError::Worker(e) => Some(e),
            _ => None,
        }
    }
}

/// Stack mapping errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    MapFailed(i32),
    /// mprotect of the guard page failed
    GuardFailed(i32),
    /// Requested stack size overflows the address space
    BadSize,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::MapFailed(e) => write!(f, "stack mmap failed (errno {})", e),
            MemoryError::GuardFailed(e) => write!(f, "guard page mprotect failed (errno {})", e),
            MemoryError::BadSize => write!(f, "invalid stack size"),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<MemoryError> for SchedError {
    fn from(e: MemoryError) -> Self {
        SchedError::Memory(e)
    }
}

/// Thread-level errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// std::thread::Builder::spawn failed
    SpawnFailed(String),
    /// A runtime thread panicked
    Panicked(String),
    /// Poller setup failed (epoll/eventfd)
    PollerSetup(i32),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed(name) => write!(f, "failed to spawn thread {}", name),
            WorkerError::Panicked(name) => write!(f, "thread {} panicked", name),
            WorkerError::PollerSetup(e) => write!(f, "poller setup failed (errno {})", e),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<WorkerError> for SchedError {
    fn from(e: WorkerError) -> Self {
        SchedError::Worker(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", SchedError::NotRunning), "runtime not running");
        let e = SchedError::Memory(MemoryError::MapFailed(12));
        assert_eq!(format!("{}", e), "memory error: stack mmap failed (errno 12)");
    }

    #[test]
    fn test_error_conversion_and_retry() {
        let e: SchedError = MemoryError::BadSize.into();
        assert!(matches!(e, SchedError::Memory(MemoryError::BadSize)));
        assert!(e.is_retryable());
        assert!(SchedError::CapacityExhausted.is_retryable());
        assert!(!SchedError::NotRunning.is_retryable());
    }

    #[test]
    fn test_error_source() {
        use std::error::Error;
        let e: SchedError = WorkerError::SpawnFailed("fibra-w0".into()).into();
        assert!(e.source().is_some());
        assert!(SchedError::Os(4).source().is_none());
    }
}
