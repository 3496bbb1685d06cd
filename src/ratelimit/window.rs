//! Minute and day request windows.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Result, TurnstileError};
use crate::store::AdmissionStore;

/// Seconds in a minute window.
const MINUTE_SECS: i64 = 60;

/// The two quota windows every request is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WindowKind {
    /// Fixed window aligned to epoch minutes
    Minute,
    /// Calendar day in the configured timezone
    Day,
}

impl WindowKind {
    /// Tag prefix used in the rendered window key.
    pub fn tag(&self) -> &'static str {
        match self {
            WindowKind::Minute => "min",
            WindowKind::Day => "day",
        }
    }
}

/// Identifies one concrete window, e.g. `min:29443135` or `day:20251224`.
///
/// Minute buckets are `floor(now / 60)`. Day buckets are the local date
/// encoded as `YYYYMMDD`, so keys of the same kind order chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WindowKey {
    kind: WindowKind,
    bucket: i64,
}

impl WindowKey {
    /// Build a key from its parts.
    pub fn new(kind: WindowKind, bucket: i64) -> Self {
        Self { kind, bucket }
    }

    /// The key of the window of `kind` containing `now`.
    pub fn at(kind: WindowKind, now: i64, offset: FixedOffset) -> Result<Self> {
        match kind {
            WindowKind::Minute => Ok(Self::minute(now)),
            WindowKind::Day => Self::day(now, offset),
        }
    }

    /// The minute window containing `now`.
    pub fn minute(now: i64) -> Self {
        Self::new(WindowKind::Minute, now.div_euclid(MINUTE_SECS))
    }

    /// The local calendar day containing `now`.
    ///
    /// Fails when that local day lies past the last date chrono can represent.
    pub fn day(now: i64, offset: FixedOffset) -> Result<Self> {
        let local = DateTime::from_timestamp(now, 0)
            .and_then(|utc| utc.naive_utc().checked_add_offset(offset))
            .ok_or_else(|| {
                TurnstileError::InvalidInput(format!("timestamp out of range: {}", now))
            })?;

        let bucket = i64::from(local.year()) * 10_000
            + i64::from(local.month()) * 100
            + i64::from(local.day());
        Ok(Self::new(WindowKind::Day, bucket))
    }

    /// Which window this key belongs to.
    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    /// The bucket number within its kind.
    pub fn bucket(&self) -> i64 {
        self.bucket
    }

    /// True when `self` is a window of the same kind as `current` that ended before it.
    pub fn is_elapsed_relative_to(&self, current: &WindowKey) -> bool {
        self.kind == current.kind && self.bucket < current.bucket
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.tag(), self.bucket)
    }
}

impl FromStr for WindowKey {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TurnstileError::InvalidInput(format!("invalid window key: {}", s));

        let (tag, bucket) = s.split_once(':').ok_or_else(invalid)?;
        let kind = match tag {
            "min" => WindowKind::Minute,
            "day" => WindowKind::Day,
            _ => return Err(invalid()),
        };
        let bucket = bucket.parse::<i64>().map_err(|_| invalid())?;
        Ok(Self::new(kind, bucket))
    }
}

impl TryFrom<String> for WindowKey {
    type Error = TurnstileError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<WindowKey> for String {
    fn from(key: WindowKey) -> Self {
        key.to_string()
    }
}

/// Result of counting one request against one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// The request was counted; carries the new count
    Admitted(u64),
    /// The window is full; carries the unchanged count
    Exceeded(u64),
}

impl WindowOutcome {
    /// True when the request fit in the window.
    pub fn is_admitted(&self) -> bool {
        matches!(self, WindowOutcome::Admitted(_))
    }
}

/// Counts requests per identity inside minute and day windows.
///
/// Holds no counts itself; every read and write goes to the store.
pub struct WindowCounter {
    store: Arc<dyn AdmissionStore>,
    offset: FixedOffset,
}

impl WindowCounter {
    /// Create a counter that derives day windows in `offset`.
    pub fn new(store: Arc<dyn AdmissionStore>, offset: FixedOffset) -> Self {
        Self { store, offset }
    }

    /// The window of `kind` containing `now`.
    pub fn key_for(&self, kind: WindowKind, now: i64) -> Result<WindowKey> {
        WindowKey::at(kind, now, self.offset)
    }

    /// Count a request in the window of `kind` containing `now`, unless the
    /// window already holds `limit` requests.
    ///
    /// The first request of a window is always admitted, whatever the limit.
    /// A rejected request is not counted.
    ///
    /// The check and the increment are separate store calls. Concurrent calls
    /// for the same identity can both pass the check, so callers must
    /// serialize them per identity, as `AdmissionGuard` does with `IdentityLocks`.
    pub async fn check_and_increment(
        &self,
        identity: &str,
        now: i64,
        kind: WindowKind,
        limit: u64,
    ) -> Result<WindowOutcome> {
        let key = self.key_for(kind, now)?;

        trace!(identity, window = %key, limit, "Checking window");

        if let Some(usage) = self.store.get_window_usage(identity, &key).await? {
            if usage.request_count >= limit {
                debug!(
                    identity,
                    window = %key,
                    count = usage.request_count,
                    limit,
                    "Window limit exceeded"
                );
                return Ok(WindowOutcome::Exceeded(usage.request_count));
            }
        }

        let count = self.store.upsert_increment_window_usage(identity, &key).await?;
        Ok(WindowOutcome::Admitted(count))
    }

    /// The number of requests counted in the window of `kind` containing `now`.
    pub async fn current_count(&self, identity: &str, now: i64, kind: WindowKind) -> Result<u64> {
        let key = self.key_for(kind, now)?;
        let usage = self.store.get_window_usage(identity, &key).await?;
        Ok(usage.map(|u| u.request_count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn counter() -> WindowCounter {
        WindowCounter::new(Arc::new(MemoryStore::new()), utc())
    }

    #[test]
    fn test_minute_key() {
        assert_eq!(WindowKey::minute(0).bucket(), 0);
        assert_eq!(WindowKey::minute(59).bucket(), 0);
        assert_eq!(WindowKey::minute(60).bucket(), 1);
        assert_eq!(WindowKey::minute(1_766_588_874).to_string(), "min:29443147");
    }

    #[test]
    fn test_day_key_utc() {
        // 2025-12-24T15:07:54Z
        let key = WindowKey::day(1_766_588_874, utc()).unwrap();
        assert_eq!(key.to_string(), "day:20251224");
    }

    #[test]
    fn test_day_key_respects_offset() {
        // 2025-12-24T23:30:00Z is already the 25th at UTC+1 and still the 24th at UTC-5.
        let now = 1_766_619_000;
        let plus_one = FixedOffset::east_opt(3600).unwrap();
        let minus_five = FixedOffset::west_opt(5 * 3600).unwrap();

        assert_eq!(WindowKey::day(now, utc()).unwrap().bucket(), 20251224);
        assert_eq!(WindowKey::day(now, plus_one).unwrap().bucket(), 20251225);
        assert_eq!(WindowKey::day(now, minus_five).unwrap().bucket(), 20251224);
    }

    #[test]
    fn test_day_key_out_of_range() {
        let result = WindowKey::day(i64::MAX, utc());
        assert!(matches!(result, Err(TurnstileError::InvalidInput(_))));
    }

    #[test]
    fn test_day_key_on_last_representable_date() {
        // +262142-12-31T23:59:59Z
        let last = 8_210_266_876_799;
        assert_eq!(WindowKey::day(last, utc()).unwrap().bucket(), 2_621_421_231);

        let plus_one = FixedOffset::east_opt(3600).unwrap();
        assert!(matches!(
            WindowKey::day(last, plus_one),
            Err(TurnstileError::InvalidInput(_))
        ));
        assert_eq!(
            WindowKey::day(last - 3600, plus_one).unwrap().bucket(),
            2_621_421_231
        );
    }

    #[test]
    fn test_key_parse() {
        let key: WindowKey = "min:29443135".parse().unwrap();
        assert_eq!(key, WindowKey::new(WindowKind::Minute, 29443135));

        let key: WindowKey = "day:20251224".parse().unwrap();
        assert_eq!(key.kind(), WindowKind::Day);

        assert!("hour:1".parse::<WindowKey>().is_err());
        assert!("min".parse::<WindowKey>().is_err());
        assert!("min:abc".parse::<WindowKey>().is_err());
    }

    #[test]
    fn test_elapsed_only_within_same_kind() {
        let minute = WindowKey::new(WindowKind::Minute, 5);
        let day = WindowKey::new(WindowKind::Day, 20250101);

        assert!(WindowKey::new(WindowKind::Minute, 4).is_elapsed_relative_to(&minute));
        assert!(!minute.is_elapsed_relative_to(&minute));
        assert!(!minute.is_elapsed_relative_to(&day));
        assert!(WindowKey::new(WindowKind::Day, 20241231).is_elapsed_relative_to(&day));
    }

    #[tokio::test]
    async fn test_first_request_admitted() {
        let counter = counter();
        let outcome = counter
            .check_and_increment("u1", 0, WindowKind::Minute, 10)
            .await
            .unwrap();
        assert_eq!(outcome, WindowOutcome::Admitted(1));
        assert_eq!(counter.current_count("u1", 0, WindowKind::Minute).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exceeded_does_not_increment() {
        let counter = counter();

        for expected in 1..=3 {
            let outcome = counter
                .check_and_increment("u1", 5, WindowKind::Minute, 3)
                .await
                .unwrap();
            assert_eq!(outcome, WindowOutcome::Admitted(expected));
        }

        for _ in 0..2 {
            let outcome = counter
                .check_and_increment("u1", 5, WindowKind::Minute, 3)
                .await
                .unwrap();
            assert_eq!(outcome, WindowOutcome::Exceeded(3));
        }
        assert_eq!(counter.current_count("u1", 5, WindowKind::Minute).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_limit_admits_first_request_only() {
        let counter = counter();

        let first = counter
            .check_and_increment("u1", 0, WindowKind::Day, 0)
            .await
            .unwrap();
        assert_eq!(first, WindowOutcome::Admitted(1));

        let second = counter
            .check_and_increment("u1", 1, WindowKind::Day, 0)
            .await
            .unwrap();
        assert_eq!(second, WindowOutcome::Exceeded(1));
    }

    #[tokio::test]
    async fn test_new_minute_starts_fresh() {
        let counter = counter();

        for _ in 0..2 {
            counter
                .check_and_increment("u1", 10, WindowKind::Minute, 2)
                .await
                .unwrap();
        }
        let outcome = counter
            .check_and_increment("u1", 61, WindowKind::Minute, 2)
            .await
            .unwrap();
        assert_eq!(outcome, WindowOutcome::Admitted(1));
        assert_eq!(counter.current_count("u1", 10, WindowKind::Minute).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_minute_and_day_counted_separately() {
        let counter = counter();

        counter
            .check_and_increment("u1", 0, WindowKind::Minute, 1)
            .await
            .unwrap();
        let day = counter
            .check_and_increment("u1", 0, WindowKind::Day, 1)
            .await
            .unwrap();
        assert_eq!(day, WindowOutcome::Admitted(1));
    }
}
