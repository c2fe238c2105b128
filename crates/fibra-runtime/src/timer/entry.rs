//! Timer ids and entries

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use fibra_core::SpinLock;

use crate::execution_context::ExecutionContext;

const GROUP_SHIFT: u32 = 48;
const SEQ_MASK: u64 = (1 << GROUP_SHIFT) - 1;

/// Handle of a registered timer.
///
/// The owning scheduling group is encoded in the top bits, so a kill can
/// be routed without a global lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) fn new(group: usize, seq: u64) -> Self {
        TimerId(((group as u64) << GROUP_SHIFT) | (seq & SEQ_MASK))
    }

    /// Scheduling group the timer belongs to
    #[inline]
    pub fn group(&self) -> usize {
        (self.0 >> GROUP_SHIFT) as usize
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer:{}:{}", self.group(), self.0 & SEQ_MASK)
    }
}

pub(crate) type TimerCallback = Box<dyn FnMut(TimerId) + Send + 'static>;

/// A timer registered through the public API. Shared between the
/// backend entry, the group registry and the fiber running a tick.
pub(crate) struct UserTimer {
    pub id: TimerId,
    /// Only ever taken by the one fiber running a tick
    pub callback: SpinLock<TimerCallback>,
    /// A tick's fiber is still running the callback
    pub running: AtomicBool,
    pub cancelled: AtomicBool,
    /// Context captured when the timer was set
    pub ctx: Option<ExecutionContext>,
}

impl UserTimer {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub(crate) enum TimerTask {
    /// Runtime-internal one-shot (wait timeouts), run on the timer thread
    Internal(Box<dyn FnOnce() + Send + 'static>),
    /// User timer, ticked in a fresh fiber
    User(std::sync::Arc<UserTimer>),
}

pub(crate) struct TimerEntry {
    pub id: TimerId,
    pub deadline: Instant,
    /// Period of a periodic timer
    pub interval: Option<Duration>,
    pub task: TimerTask,
}

impl TimerEntry {
    /// Next occurrence of a periodic entry, anchored on the original
    /// schedule rather than the firing time.
    pub(crate) fn reschedule(&self) -> Option<TimerEntry> {
        let interval = self.interval?;
        match &self.task {
            TimerTask::User(t) => Some(TimerEntry {
                id: self.id,
                deadline: self.deadline + interval,
                interval: Some(interval),
                task: TimerTask::User(std::sync::Arc::clone(t)),
            }),
            TimerTask::Internal(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_timer_id_encodes_group() {
        let id = TimerId::new(5, 42);
        assert_eq!(id.group(), 5);
        assert_eq!(id.raw() & SEQ_MASK, 42);
        assert_eq!(id.to_string(), "timer:5:42");
    }

    #[test]
    fn test_periodic_reschedule_is_anchored() {
        let at = Instant::now();
        let id = TimerId::new(0, 1);
        let timer = Arc::new(UserTimer {
            id,
            callback: SpinLock::new(Box::new(|_| {})),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            ctx: None,
        });
        let entry = TimerEntry {
            id,
            deadline: at,
            interval: Some(Duration::from_millis(10)),
            task: TimerTask::User(timer),
        };
        let next = entry.reschedule().unwrap();
        let after = next.reschedule().unwrap();
        assert_eq!(after.deadline, at + Duration::from_millis(20));

        let once = TimerEntry {
            id,
            deadline: at,
            interval: None,
            task: TimerTask::Internal(Box::new(|| {})),
        };
        assert!(once.reschedule().is_none());
    }
}
