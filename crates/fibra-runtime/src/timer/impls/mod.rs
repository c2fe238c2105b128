//! Timer backend implementations
//!
//! Currently provides:
//! - `HeapTimerBackend` - BinaryHeap with lazy cancellation

mod heap;

pub use heap::HeapTimerBackend;

use crate::timer::TimerBackend;

/// Backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerBackendType {
    /// O(log n) insert, O(1) cancel and next-deadline peek
    #[default]
    BinaryHeap,
}

pub fn create_backend(backend_type: TimerBackendType) -> Box<dyn TimerBackend> {
    match backend_type {
        TimerBackendType::BinaryHeap => Box::new(HeapTimerBackend::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_default_backend() {
        let backend = create_backend(TimerBackendType::default());
        assert_eq!(backend.name(), "binary_heap");
        assert_eq!(backend.len(), 0);
    }
}
