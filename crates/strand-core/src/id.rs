//! Coroutine identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a coroutine
///
/// Ids are allocated from a process-wide monotone counter. Id 0 is reserved
/// for the per-thread root coroutine.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoId(u64);

impl CoId {
    /// Id of every thread's root coroutine
    pub const ROOT: CoId = CoId(0);

    /// Allocate the next fresh id
    #[inline]
    pub fn next() -> Self {
        CoId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an id from a raw value
    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        CoId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the root sentinel
    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "CoId(ROOT)")
        } else {
            write!(f, "CoId({})", self.0)
        }
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_monotone() {
        let a = CoId::next();
        let b = CoId::next();
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_root_sentinel() {
        assert!(CoId::ROOT.is_root());
        assert!(!CoId::next().is_root());
        assert_eq!(CoId::from_raw(0), CoId::ROOT);
    }
}
