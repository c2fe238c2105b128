//! Fiber run state

use core::fmt;

/// Run state of a fiber entity.
///
/// Transitions happen only while the entity's scheduler lock is held:
///
/// ```text
///   Ready ──► Running ──► Exiting
///     ▲          │
///     └─ Blocked ◄┘   (Running ──► Ready on yield)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// In exactly one run queue
    Ready = 0,
    /// Executing on a worker
    Running = 1,
    /// Suspended on a waiter list, sleep or join
    Blocked = 2,
    /// Body returned, entity about to be recycled
    Exiting = 3,
}

impl FiberState {
    #[inline]
    pub const fn is_runnable(self) -> bool {
        matches!(self, FiberState::Ready)
    }

    #[inline]
    pub const fn is_terminated(self) -> bool {
        matches!(self, FiberState::Exiting)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Blocked,
            _ => FiberState::Exiting,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Ready => "ready",
            FiberState::Running => "running",
            FiberState::Blocked => "blocked",
            FiberState::Exiting => "exiting",
        };
        f.write_str(s)
    }
}
