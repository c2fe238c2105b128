//! Fiber identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a started fiber.
///
/// Ids are process-unique and never reused, unlike the entity that runs
/// the fiber (entities are pooled). Zero is reserved for "no fiber".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    pub const NONE: FiberId = FiberId(0);

    /// Allocate the next id.
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        FiberId(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "f{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_unique() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert!(!a.is_none());
    }

    #[test]
    fn test_fiber_id_none() {
        assert!(FiberId::NONE.is_none());
        assert_eq!(FiberId::default(), FiberId::NONE);
        assert_eq!(format!("{}", FiberId::NONE), "none");
        assert_eq!(format!("{}", FiberId::from_raw(12)), "f12");
    }
}
