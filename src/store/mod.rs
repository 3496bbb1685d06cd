//! Durable state behind the admission guard.
//!
//! The guard itself keeps nothing in memory between calls; every count and
//! every block lives behind the [`AdmissionStore`] contract.

mod memory;
mod record;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::WindowKey;

pub use memory::MemoryStore;
pub use record::{BlockRecord, WindowUsage};

/// Storage contract required by the admission guard.
///
/// Each method must be atomic on its own. Sequences of calls for the same
/// identity are serialized by the guard, so implementations do not need to
/// offer multi-statement transactions. Any failure to reach or update the
/// store surfaces as [`TurnstileError::StoreUnavailable`](crate::error::TurnstileError::StoreUnavailable).
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Fetch the usage row for an identity in one window.
    async fn get_window_usage(
        &self,
        identity: &str,
        window_key: &WindowKey,
    ) -> Result<Option<WindowUsage>>;

    /// Create the usage row with a count of 1, or add 1 to it.
    ///
    /// Returns the count after the increment.
    async fn upsert_increment_window_usage(
        &self,
        identity: &str,
        window_key: &WindowKey,
    ) -> Result<u64>;

    /// Fetch the block record for an identity.
    async fn get_block_record(&self, identity: &str) -> Result<Option<BlockRecord>>;

    /// Insert or replace the block record for `record.identity`.
    async fn upsert_block_record(&self, record: &BlockRecord) -> Result<()>;

    /// Remove the block record for an identity. Removing a missing record is not an error.
    async fn delete_block_record(&self, identity: &str) -> Result<()>;

    /// Delete usage rows whose window lies strictly before the given current
    /// windows of the same kind. Returns the number of rows removed.
    async fn purge_elapsed_windows(
        &self,
        current_minute: &WindowKey,
        current_day: &WindowKey,
    ) -> Result<u64>;
}
