//! Admission decisions composed from the window counter and abuse tracker.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};

use super::abuse::{AbuseTracker, BlockState};
use super::locks::IdentityLocks;
use super::window::{WindowCounter, WindowKind, WindowOutcome};
use crate::config::LimitsConfig;
use crate::error::{Result, TurnstileError};
use crate::store::{AdmissionStore, BlockRecord};

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    /// The identity is blocked until the given epoch second
    Blocked { until: i64 },
    /// The current minute window is full
    MinuteLimitExceeded,
    /// The current day window is full
    DayLimitExceeded,
}

/// The answer to "may this caller proceed right now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionVerdict {
    /// Proceed; both windows counted the request
    Admit,
    /// Turned away
    Reject(Rejection),
}

impl AdmissionVerdict {
    /// True for [`AdmissionVerdict::Admit`].
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionVerdict::Admit)
    }
}

/// Read-only view of one identity's state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    /// Requests counted in the current minute window
    pub minute_count: u64,
    /// Requests counted in the current day window
    pub day_count: u64,
    /// Violation and block state, if any has been recorded
    pub block: Option<BlockRecord>,
}

/// The admission-control entry point.
///
/// Holds configuration and a store handle only; every bit of per-identity
/// state lives in the store, so one guard can be shared by all callers.
/// Decisions for the same identity are serialized; different identities
/// proceed independently.
pub struct AdmissionGuard {
    limits: LimitsConfig,
    offset: FixedOffset,
    store: Arc<dyn AdmissionStore>,
    windows: WindowCounter,
    abuse: AbuseTracker,
    locks: IdentityLocks,
}

impl AdmissionGuard {
    /// Create a guard over `store` after validating `limits`.
    pub fn new(limits: LimitsConfig, store: Arc<dyn AdmissionStore>) -> Result<Self> {
        limits.validate()?;
        let offset = limits.utc_offset()?;

        Ok(Self {
            windows: WindowCounter::new(store.clone(), offset),
            abuse: AbuseTracker::new(
                store.clone(),
                limits.abuse_threshold,
                limits.block_duration_seconds,
            ),
            locks: IdentityLocks::new(),
            limits,
            offset,
            store,
        })
    }

    /// The limits this guard enforces.
    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Decide whether `identity` may proceed at `now` (epoch seconds).
    ///
    /// Checks run in order: active block, minute window, day window. A
    /// minute increment is kept even when the day window then rejects.
    #[instrument(skip(self, identity), fields(identity = %identity))]
    pub async fn decide(&self, identity: &str, now: i64) -> Result<AdmissionVerdict> {
        self.validate(identity, now)?;

        let _held = self.locks.lock(identity).await;

        if let BlockState::Blocked { until } = self.abuse.precheck(identity, now).await? {
            trace!(until, "Identity is blocked");
            return Ok(AdmissionVerdict::Reject(Rejection::Blocked { until }));
        }

        let checks = [
            (WindowKind::Minute, self.limits.minute_limit, Rejection::MinuteLimitExceeded),
            (WindowKind::Day, self.limits.day_limit, Rejection::DayLimitExceeded),
        ];

        for (kind, limit, rejection) in checks {
            let outcome = self
                .windows
                .check_and_increment(identity, now, kind, limit)
                .await?;

            if let WindowOutcome::Exceeded(count) = outcome {
                let violation = self.abuse.record_violation(identity, now).await?;
                debug!(window = ?kind, count, limit, ?violation, "Request rejected");
                return Ok(AdmissionVerdict::Reject(rejection));
            }
        }

        trace!("Request admitted");
        Ok(AdmissionVerdict::Admit)
    }

    /// Current counts and block state for `identity`, without side effects.
    pub async fn snapshot(&self, identity: &str, now: i64) -> Result<UsageSnapshot> {
        self.validate(identity, now)?;

        Ok(UsageSnapshot {
            minute_count: self
                .windows
                .current_count(identity, now, WindowKind::Minute)
                .await?,
            day_count: self.windows.current_count(identity, now, WindowKind::Day).await?,
            block: self.store.get_block_record(identity).await?,
        })
    }

    /// Seconds a rejected caller should wait before retrying, or `None` when admitted.
    pub fn retry_after(&self, verdict: &AdmissionVerdict, now: i64) -> Option<i64> {
        match verdict {
            AdmissionVerdict::Admit => None,
            AdmissionVerdict::Reject(Rejection::Blocked { until }) => Some((until - now).max(0)),
            AdmissionVerdict::Reject(Rejection::MinuteLimitExceeded) => {
                Some(60 - now.rem_euclid(60))
            }
            AdmissionVerdict::Reject(Rejection::DayLimitExceeded) => {
                self.next_midnight(now).map(|midnight| midnight - now)
            }
        }
    }

    /// Delete usage rows for windows that have fully elapsed at `now`.
    ///
    /// Block records are left alone; they expire through [`decide`](Self::decide).
    /// Identity locks are not taken, so `now` must not run ahead of any
    /// decision still in flight: a decision for an already-purged window
    /// would recreate its row starting from 1.
    pub async fn compact(&self, now: i64) -> Result<u64> {
        if now < 0 {
            return Err(TurnstileError::InvalidInput(format!(
                "timestamp must be non-negative, got {}",
                now
            )));
        }
        let minute = self.windows.key_for(WindowKind::Minute, now)?;
        let day = self.windows.key_for(WindowKind::Day, now)?;

        let removed = self.store.purge_elapsed_windows(&minute, &day).await?;
        info!(removed, current_minute = %minute, current_day = %day, "Compacted window usage");
        Ok(removed)
    }

    /// Reject malformed calls before they reach the store.
    fn validate(&self, identity: &str, now: i64) -> Result<()> {
        if identity.is_empty() {
            warn!("Rejected call with empty identity");
            return Err(TurnstileError::InvalidInput(
                "identity must not be empty".to_string(),
            ));
        }
        if identity.len() > self.limits.max_identity_len {
            warn!(len = identity.len(), "Rejected call with oversized identity");
            return Err(TurnstileError::InvalidInput(format!(
                "identity longer than {} bytes",
                self.limits.max_identity_len
            )));
        }
        if now < 0 {
            warn!(now, "Rejected call with negative timestamp");
            return Err(TurnstileError::InvalidInput(format!(
                "timestamp must be non-negative, got {}",
                now
            )));
        }
        let representable = DateTime::from_timestamp(now, 0)
            .and_then(|utc| utc.naive_utc().checked_add_offset(self.offset))
            .is_some();
        if !representable {
            warn!(now, "Rejected call with out-of-range timestamp");
            return Err(TurnstileError::InvalidInput(format!(
                "timestamp out of range: {}",
                now
            )));
        }
        Ok(())
    }

    /// Epoch second of the next local midnight after `now`.
    ///
    /// `None` when that midnight falls past the last representable date.
    fn next_midnight(&self, now: i64) -> Option<i64> {
        let local = DateTime::from_timestamp(now, 0)?
            .naive_utc()
            .checked_add_offset(self.offset)?;
        let midnight = local.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
        Some(midnight.checked_sub_offset(self.offset)?.and_utc().timestamp())
    }
}
