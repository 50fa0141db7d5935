use async_trait::async_trait;

use super::DatabaseError;
use super::models::{MappingEntry, SyncedOrigin};

/// Bidirectional key registry for one [`crate::db::MappingKind`].
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Writes both directions atomically. Fails with `AlreadyRegistered` if either key is taken.
    async fn register(
        &self,
        key_a: &str,
        key_b: &str,
        parent: Option<&str>,
    ) -> Result<(), DatabaseError>;
    /// Removes both directions atomically. Fails with `NotRegistered` unless exactly `(key_a, key_b)` is stored.
    async fn unregister(&self, key_a: &str, key_b: &str) -> Result<(), DatabaseError>;
    async fn lookup_by_a(&self, key_a: &str) -> Result<Option<String>, DatabaseError>;
    async fn lookup_by_b(&self, key_b: &str) -> Result<Option<String>, DatabaseError>;
    async fn list_children(&self, parent: &str) -> Result<Vec<String>, DatabaseError>;
    async fn list_entries(&self) -> Result<Vec<MappingEntry>, DatabaseError>;
}

#[async_trait]
pub trait SyncedMessageStore: Send + Sync {
    async fn mirror_of(&self, scope: &str, message_id: &str)
    -> Result<Option<String>, DatabaseError>;
    async fn record(
        &self,
        scope: &str,
        message_id: &str,
        mirror_id: &str,
    ) -> Result<(), DatabaseError>;
    async fn record_delivery(
        &self,
        scope: &str,
        remote_id: &str,
        mirror_id: &str,
    ) -> Result<(), DatabaseError>;
    async fn origin_of(&self, mirror_id: &str) -> Result<Option<SyncedOrigin>, DatabaseError>;
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn last_seen(&self, conversation_id: &str) -> Result<Option<i64>, DatabaseError>;
    /// Monotonic max. Returns whether the stored value moved.
    async fn advance(&self, conversation_id: &str, timestamp: i64) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn cursor(&self, conversation_id: &str) -> Result<Option<String>, DatabaseError>;
    async fn put_cursor(&self, conversation_id: &str, token: &str) -> Result<(), DatabaseError>;
}
