//! Rows persisted by the store.

use serde::{Deserialize, Serialize};

use crate::ratelimit::WindowKey;

/// Request count for one identity inside one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUsage {
    /// The caller's opaque handle
    pub identity: String,
    /// Which minute or day this row counts
    pub window_key: WindowKey,
    /// Requests counted in the window so far
    pub request_count: u64,
}

/// Violation history and block state for one identity.
///
/// `blocked_until == 0` means the identity is watched but not blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// The caller's opaque handle
    pub identity: String,
    /// Quota violations observed while not actively blocked
    pub violation_count: u32,
    /// Epoch seconds at which the block ends, or 0 when not blocked
    pub blocked_until: i64,
}

impl BlockRecord {
    /// A record for an identity's first violation.
    pub fn watched(identity: &str, violation_count: u32) -> Self {
        Self {
            identity: identity.to_string(),
            violation_count,
            blocked_until: 0,
        }
    }

    /// True when violations are being tracked but no block was ever set.
    pub fn is_watched(&self) -> bool {
        self.blocked_until == 0
    }

    /// True while the block is in force at `now`.
    pub fn is_blocked_at(&self, now: i64) -> bool {
        self.blocked_until > 0 && now < self.blocked_until
    }

    /// True once a set block has run out at `now`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.blocked_until > 0 && now >= self.blocked_until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watched_record_is_never_blocked() {
        let record = BlockRecord::watched("u1", 3);
        assert!(record.is_watched());
        assert!(!record.is_blocked_at(0));
        assert!(!record.is_expired_at(i64::MAX));
    }

    #[test]
    fn test_block_boundaries() {
        let record = BlockRecord {
            identity: "u1".to_string(),
            violation_count: 5,
            blocked_until: 100,
        };
        assert!(!record.is_watched());
        assert!(record.is_blocked_at(99));
        assert!(!record.is_expired_at(99));
        // The block ends exactly at blocked_until.
        assert!(!record.is_blocked_at(100));
        assert!(record.is_expired_at(100));
    }
}
