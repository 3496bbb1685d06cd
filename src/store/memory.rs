//! In-process store backed by concurrent hash maps.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{AdmissionStore, BlockRecord, WindowUsage};
use crate::error::Result;
use crate::ratelimit::WindowKey;

/// An [`AdmissionStore`] that keeps all rows in memory.
///
/// Every operation completes while holding the map shard for its key, so each
/// call is atomic. State is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Request counts keyed by (identity, window)
    windows: DashMap<(String, WindowKey), u64>,
    /// Block records keyed by identity
    blocks: DashMap<String, BlockRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of window usage rows currently held.
    pub fn window_row_count(&self) -> usize {
        self.windows.len()
    }

    /// Number of block records currently held.
    pub fn block_record_count(&self) -> usize {
        self.blocks.len()
    }
}

#[async_trait]
impl AdmissionStore for MemoryStore {
    async fn get_window_usage(
        &self,
        identity: &str,
        window_key: &WindowKey,
    ) -> Result<Option<WindowUsage>> {
        let usage = self
            .windows
            .get(&(identity.to_string(), *window_key))
            .map(|count| WindowUsage {
                identity: identity.to_string(),
                window_key: *window_key,
                request_count: *count,
            });
        Ok(usage)
    }

    async fn upsert_increment_window_usage(
        &self,
        identity: &str,
        window_key: &WindowKey,
    ) -> Result<u64> {
        let mut count = self
            .windows
            .entry((identity.to_string(), *window_key))
            .or_insert(0);
        *count += 1;

        trace!(identity, window = %window_key, count = *count, "Incremented window usage");
        Ok(*count)
    }

    async fn get_block_record(&self, identity: &str) -> Result<Option<BlockRecord>> {
        Ok(self.blocks.get(identity).map(|record| record.clone()))
    }

    async fn upsert_block_record(&self, record: &BlockRecord) -> Result<()> {
        self.blocks.insert(record.identity.clone(), record.clone());
        Ok(())
    }

    async fn delete_block_record(&self, identity: &str) -> Result<()> {
        self.blocks.remove(identity);
        Ok(())
    }

    async fn purge_elapsed_windows(
        &self,
        current_minute: &WindowKey,
        current_day: &WindowKey,
    ) -> Result<u64> {
        let mut removed = 0u64;
        self.windows.retain(|(_, key), _| {
            let elapsed =
                key.is_elapsed_relative_to(current_minute) || key.is_elapsed_relative_to(current_day);
            if elapsed {
                removed += 1;
            }
            !elapsed
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::WindowKind;

    #[tokio::test]
    async fn test_upsert_creates_then_increments() {
        let store = MemoryStore::new();
        let key = WindowKey::new(WindowKind::Minute, 42);

        assert!(store.get_window_usage("u1", &key).await.unwrap().is_none());
        assert_eq!(store.upsert_increment_window_usage("u1", &key).await.unwrap(), 1);
        assert_eq!(store.upsert_increment_window_usage("u1", &key).await.unwrap(), 2);

        let usage = store.get_window_usage("u1", &key).await.unwrap().unwrap();
        assert_eq!(usage.request_count, 2);
        assert_eq!(usage.window_key, key);
    }

    #[tokio::test]
    async fn test_windows_are_keyed_by_identity_and_window() {
        let store = MemoryStore::new();
        let minute = WindowKey::new(WindowKind::Minute, 1);
        let day = WindowKey::new(WindowKind::Day, 20250101);

        store.upsert_increment_window_usage("u1", &minute).await.unwrap();
        store.upsert_increment_window_usage("u1", &day).await.unwrap();
        store.upsert_increment_window_usage("u2", &minute).await.unwrap();

        assert_eq!(store.window_row_count(), 3);
        let u2_day = store.get_window_usage("u2", &day).await.unwrap();
        assert!(u2_day.is_none());
    }

    #[tokio::test]
    async fn test_block_record_lifecycle() {
        let store = MemoryStore::new();
        let record = BlockRecord::watched("u1", 1);

        store.upsert_block_record(&record).await.unwrap();
        assert_eq!(store.get_block_record("u1").await.unwrap(), Some(record));

        let blocked = BlockRecord {
            identity: "u1".to_string(),
            violation_count: 2,
            blocked_until: 63,
        };
        store.upsert_block_record(&blocked).await.unwrap();
        assert_eq!(store.get_block_record("u1").await.unwrap(), Some(blocked));
        assert_eq!(store.block_record_count(), 1);

        store.delete_block_record("u1").await.unwrap();
        assert!(store.get_block_record("u1").await.unwrap().is_none());

        // Deleting again is harmless.
        store.delete_block_record("u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_keeps_current_windows() {
        let store = MemoryStore::new();
        let old_minute = WindowKey::new(WindowKind::Minute, 10);
        let minute = WindowKey::new(WindowKind::Minute, 11);
        let old_day = WindowKey::new(WindowKind::Day, 20250101);
        let day = WindowKey::new(WindowKind::Day, 20250102);

        for key in [&old_minute, &minute, &old_day, &day] {
            store.upsert_increment_window_usage("u1", key).await.unwrap();
        }
        store.upsert_block_record(&BlockRecord::watched("u1", 1)).await.unwrap();

        let removed = store.purge_elapsed_windows(&minute, &day).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get_window_usage("u1", &minute).await.unwrap().is_some());
        assert!(store.get_window_usage("u1", &day).await.unwrap().is_some());
        assert!(store.get_window_usage("u1", &old_minute).await.unwrap().is_none());
        assert_eq!(store.block_record_count(), 1);
    }
}
