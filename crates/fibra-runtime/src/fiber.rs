//! Fiber handles
//!
//! A `Fiber` is the joinable side of a started fiber. Exactly one exit
//! barrier exists per joinable start; `join` waits on it and `detach`
//! gives it up. Either must happen before the handle is dropped.

use std::fmt;
use std::sync::Arc;

use fibra_core::FiberId;

use crate::group::LaunchPolicy;
use crate::runtime;
use crate::sync::Event;

/// Which scheduling group a new fiber is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupPlacement {
    /// The caller's group on a worker, round-robin elsewhere
    #[default]
    Nearest,
    /// A group by index
    Specific(usize),
}

/// Creation attributes for `start_fiber`
#[derive(Debug, Clone, Copy, Default)]
pub struct Attributes {
    pub scheduling_group: GroupPlacement,
    /// Never stolen by workers of another group
    pub scheduling_group_local: bool,
    pub launch_policy: LaunchPolicy,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduling_group(mut self, index: usize) -> Self {
        self.scheduling_group = GroupPlacement::Specific(index);
        self
    }

    pub fn scheduling_group_local(mut self, local: bool) -> Self {
        self.scheduling_group_local = local;
        self
    }

    pub fn launch_policy(mut self, policy: LaunchPolicy) -> Self {
        self.launch_policy = policy;
        self
    }
}

/// Handle to a started fiber
#[must_use = "a fiber handle must be joined or detached"]
pub struct Fiber {
    id: FiberId,
    exit: Option<Arc<Event>>,
}

impl Fiber {
    pub(crate) fn new(id: FiberId, exit: Arc<Event>) -> Self {
        Self { id, exit: Some(exit) }
    }

    /// Start `f` on the nearest scheduling group.
    ///
    /// # Panics
    ///
    /// Panics if the runtime is not running or out of capacity; use
    /// [`start_fiber`](crate::start_fiber) to handle those as errors.
    pub fn spawn<F>(f: F) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        match runtime::start_fiber(Attributes::default(), f) {
            Ok(fiber) => fiber,
            Err(e) => panic!("failed to start fiber: {}", e),
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// True until `join` or `detach` is called.
    #[inline]
    pub fn joinable(&self) -> bool {
        self.exit.is_some()
    }

    /// Wait for the fiber's body to return. Blocks only the calling fiber
    /// when called from one.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already joined or detached.
    pub fn join(&mut self) {
        match self.exit.take() {
            Some(exit) => exit.wait(),
            None => panic!("join on a fiber that is not joinable"),
        }
    }

    /// Let the fiber run on without anyone waiting for it.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already joined or detached.
    pub fn detach(&mut self) {
        if self.exit.take().is_none() {
            panic!("detach on a fiber that is not joinable");
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("joinable", &self.joinable())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.joinable() && !std::thread::panicking() {
            panic!("fiber {} dropped while still joinable", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_as_fiber;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_join_waits_for_body() {
        run_as_fiber(|| {
            let done = Arc::new(AtomicUsize::new(0));
            let d = Arc::clone(&done);
            let mut f = Fiber::spawn(move || {
                crate::sleep_for(std::time::Duration::from_millis(10));
                d.store(1, Ordering::SeqCst);
            });
            assert!(f.joinable());
            assert!(!f.id().is_none());
            f.join();
            assert!(!f.joinable());
            assert_eq!(done.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_join_from_plain_thread() {
        crate::testing::ensure_runtime();
        let mut f = Fiber::spawn(|| crate::yield_now());
        f.join();
    }

    #[test]
    #[should_panic(expected = "not joinable")]
    fn test_double_join_panics() {
        crate::testing::ensure_runtime();
        let mut f = Fiber::spawn(|| {});
        f.join();
        f.join();
    }

    #[test]
    #[should_panic(expected = "not joinable")]
    fn test_join_after_detach_panics() {
        crate::testing::ensure_runtime();
        let mut f = Fiber::spawn(|| {});
        f.detach();
        f.join();
    }

    #[test]
    #[should_panic(expected = "not joinable")]
    fn test_double_detach_panics() {
        crate::testing::ensure_runtime();
        let mut f = Fiber::spawn(|| {});
        f.detach();
        f.detach();
    }

    #[test]
    fn test_drop_after_detach_is_quiet() {
        crate::testing::ensure_runtime();
        let done = Arc::new(crate::sync::Latch::new(1));
        let d = Arc::clone(&done);
        let mut f = Fiber::spawn(move || d.count_down(1));
        f.detach();
        assert!(!f.joinable());
        drop(f);
        done.wait();
    }

    #[test]
    #[should_panic(expected = "dropped while still joinable")]
    fn test_drop_joinable_panics() {
        crate::testing::ensure_runtime();
        let _f = Fiber::spawn(|| {});
    }

    #[test]
    fn test_attributes_builder() {
        let attrs = Attributes::new()
            .scheduling_group(1)
            .scheduling_group_local(true)
            .launch_policy(LaunchPolicy::Dispatch);
        assert_eq!(attrs.scheduling_group, GroupPlacement::Specific(1));
        assert!(attrs.scheduling_group_local);
        assert_eq!(attrs.launch_policy, LaunchPolicy::Dispatch);
        assert_eq!(Attributes::default().scheduling_group, GroupPlacement::Nearest);
    }
}
