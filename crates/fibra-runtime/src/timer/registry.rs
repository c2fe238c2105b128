//! Per-group registry of user timers
//!
//! The backend only knows entries. The registry keeps the user-facing
//! timer objects reachable by id so `kill_timer` can flag a tick that is
//! already in flight, and so ownership can be released with
//! `detach_timer`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::timer::entry::UserTimer;
use crate::timer::TimerId;

#[derive(Default)]
pub(crate) struct TimerRegistry {
    timers: Mutex<HashMap<TimerId, Arc<UserTimer>>>,
}

impl TimerRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<TimerId, Arc<UserTimer>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, timer: Arc<UserTimer>) {
        self.lock().insert(timer.id, timer);
    }

    pub(crate) fn remove(&self, id: TimerId) -> Option<Arc<UserTimer>> {
        self.lock().remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fibra_core::SpinLock;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_register_remove() {
        let reg = TimerRegistry::default();
        let id = TimerId::new(1, 3);
        reg.register(Arc::new(UserTimer {
            id,
            callback: SpinLock::new(Box::new(|_| {})),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            ctx: None,
        }));
        assert_eq!(reg.len(), 1);
        assert!(reg.remove(id).is_some());
        assert!(reg.remove(id).is_none());
        assert_eq!(reg.len(), 0);
    }
}
