//! Synchronization primitives usable from fibers and plain threads alike
//!
//! A fiber that has to wait gives its worker back to the scheduler; a
//! thread parks. Either side may wake the other.

mod condvar;
mod event;
mod latch;
mod mutex;
mod seqlock;
mod shared_mutex;
mod timed_mutex;

pub use condvar::{ConditionVariable, WaitTimeoutResult};
pub use event::Event;
pub use latch::Latch;
pub use mutex::{Mutex, MutexGuard};
pub use seqlock::{SeqLock, SeqLockWriteGuard};
pub use shared_mutex::{SharedMutex, SharedMutexReadGuard, SharedMutexWriteGuard};
pub use timed_mutex::{TimedMutex, TimedMutexGuard};
