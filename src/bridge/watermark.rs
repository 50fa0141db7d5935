use std::sync::Arc;

use tracing::debug;

use crate::db::{DatabaseError, WatermarkStore};

/// Per-conversation "last processed" timestamps.
///
/// Keys are produced by [`super::router::Link::scoped`], so each direction of a
/// conversation keeps its own watermark.
#[derive(Clone)]
pub struct WatermarkTracker {
    store: Arc<dyn WatermarkStore>,
}

impl WatermarkTracker {
    pub fn new(store: Arc<dyn WatermarkStore>) -> Self {
        Self { store }
    }

    pub async fn should_process(&self, key: &str, timestamp_ms: i64) -> Result<bool, DatabaseError> {
        let stored = self.store.last_seen(key).await?;
        Ok(stored.is_none_or(|last_seen| timestamp_ms > last_seen))
    }

    /// Lower or equal timestamps are a no-op.
    pub async fn advance(&self, key: &str, timestamp_ms: i64) -> Result<(), DatabaseError> {
        let moved = self.store.advance(key, timestamp_ms).await?;
        debug!("watermark advance key={} timestamp={} moved={}", key, timestamp_ms, moved);
        Ok(())
    }

    pub async fn current(&self, key: &str) -> Result<Option<i64>, DatabaseError> {
        self.store.last_seen(key).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::WatermarkTracker;
    use crate::db::manager::tests::sqlite_manager;

    #[tokio::test]
    async fn unseen_conversation_is_processed() {
        let file = NamedTempFile::new().expect("temp db");
        let db = sqlite_manager(&file).await;
        let tracker = WatermarkTracker::new(db.watermark_store());

        assert!(tracker.should_process("discord_to_space:c1", 0).await.expect("read"));
    }

    #[tokio::test]
    async fn equal_and_older_timestamps_are_skipped() {
        let file = NamedTempFile::new().expect("temp db");
        let db = sqlite_manager(&file).await;
        let tracker = WatermarkTracker::new(db.watermark_store());

        tracker.advance("k", 1_000).await.expect("advance");

        assert!(!tracker.should_process("k", 999).await.expect("read"));
        assert!(!tracker.should_process("k", 1_000).await.expect("read"));
        assert!(tracker.should_process("k", 1_001).await.expect("read"));
    }

    #[tokio::test]
    async fn stored_value_is_the_maximum_of_all_advances() {
        let file = NamedTempFile::new().expect("temp db");
        let db = sqlite_manager(&file).await;
        let tracker = WatermarkTracker::new(db.watermark_store());

        for ts in [5, 3, 9, 9, 1, 7] {
            tracker.advance("k", ts).await.expect("advance");
        }

        assert_eq!(tracker.current("k").await.expect("read"), Some(9));
    }
}
