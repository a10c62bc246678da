// Transactional locking: shared/exclusive locks on named resources with
// per-resource FIFO fairness, true lock upgrades, and deadlock detection.

pub mod deadlock;
pub mod manager;

pub use deadlock::{DeadlockDetector, DeadlockStats, WaitForGraph};
pub use manager::{AcquireOutcome, LockInfo, LockManager, LockManagerConfig, LockStats};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lock mode.
///
/// Compatibility: Shared is compatible with Shared; Exclusive is compatible
/// with nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// True when holding `self` already satisfies a request for `requested`.
    pub fn covers(self, requested: LockMode) -> bool {
        self == LockMode::Exclusive || requested == LockMode::Shared
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        assert!(LockMode::Shared.is_compatible(LockMode::Shared));
        assert!(!LockMode::Shared.is_compatible(LockMode::Exclusive));
        assert!(!LockMode::Exclusive.is_compatible(LockMode::Shared));
        assert!(!LockMode::Exclusive.is_compatible(LockMode::Exclusive));
    }

    #[test]
    fn test_covers() {
        assert!(LockMode::Exclusive.covers(LockMode::Shared));
        assert!(LockMode::Exclusive.covers(LockMode::Exclusive));
        assert!(LockMode::Shared.covers(LockMode::Shared));
        assert!(!LockMode::Shared.covers(LockMode::Exclusive));
    }
}
