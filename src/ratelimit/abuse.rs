//! Escalation of repeated quota violations into temporary blocks.
//!
//! Per identity the tracker moves through three states:
//! no record (clear), a record with `blocked_until == 0` (watched), and a
//! record with `blocked_until > now` (blocked). Expired blocks are cleared
//! lazily by the next [`AbuseTracker::precheck`] for that identity.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::store::{AdmissionStore, BlockRecord};

/// Whether an identity may be considered for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Not blocked; watched identities are also clear
    Clear,
    /// Blocked until the given epoch second
    Blocked { until: i64 },
}

/// Result of recording one quota violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationOutcome {
    /// Below the threshold; carries the violation count
    Watched(u32),
    /// This violation reached the threshold
    NewlyBlocked { until: i64 },
    /// A block was already in force and was left unchanged
    StillBlocked { until: i64 },
}

/// Records violations and decides when an identity is blocked.
pub struct AbuseTracker {
    store: Arc<dyn AdmissionStore>,
    threshold: u32,
    block_duration_secs: i64,
}

impl AbuseTracker {
    /// Create a tracker that blocks for `block_duration_secs` after `threshold` violations.
    pub fn new(store: Arc<dyn AdmissionStore>, threshold: u32, block_duration_secs: i64) -> Self {
        Self {
            store,
            threshold,
            block_duration_secs,
        }
    }

    /// Check for an active block, deleting the record if its block has expired.
    pub async fn precheck(&self, identity: &str, now: i64) -> Result<BlockState> {
        let Some(record) = self.store.get_block_record(identity).await? else {
            return Ok(BlockState::Clear);
        };

        if record.is_blocked_at(now) {
            return Ok(BlockState::Blocked {
                until: record.blocked_until,
            });
        }

        if record.is_expired_at(now) {
            self.store.delete_block_record(identity).await?;
            debug!(
                identity,
                blocked_until = record.blocked_until,
                now,
                "Cleared expired block"
            );
        }

        Ok(BlockState::Clear)
    }

    /// Record a quota violation, blocking the identity once the threshold is reached.
    ///
    /// An active block is never extended.
    ///
    /// Reads the block record and then writes it back. Concurrent calls for the
    /// same identity would lose counts, so callers must serialize them per
    /// identity, as `AdmissionGuard` does with `IdentityLocks`.
    pub async fn record_violation(&self, identity: &str, now: i64) -> Result<ViolationOutcome> {
        let mut record = match self.store.get_block_record(identity).await? {
            Some(existing) if existing.is_blocked_at(now) => {
                return Ok(ViolationOutcome::StillBlocked {
                    until: existing.blocked_until,
                });
            }
            Some(existing) if existing.is_watched() => BlockRecord {
                violation_count: existing.violation_count.saturating_add(1),
                ..existing
            },
            // No record, or a block that ran out without being cleared.
            _ => BlockRecord::watched(identity, 1),
        };

        if record.violation_count >= self.threshold {
            record.blocked_until = now.saturating_add(self.block_duration_secs);
            self.store.upsert_block_record(&record).await?;

            info!(
                identity,
                violations = record.violation_count,
                blocked_until = record.blocked_until,
                "Blocking identity"
            );
            return Ok(ViolationOutcome::NewlyBlocked {
                until: record.blocked_until,
            });
        }

        self.store.upsert_block_record(&record).await?;
        debug!(
            identity,
            violations = record.violation_count,
            threshold = self.threshold,
            "Recorded violation"
        );
        Ok(ViolationOutcome::Watched(record.violation_count))
    }
}
