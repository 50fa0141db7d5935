//! Platform-neutral event and transport types shared by the router, backfill and the adapters.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Discord,
    Matrix,
    Space,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Discord => "discord",
            Platform::Matrix => "matrix",
            Platform::Space => "space",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a mirrored message came from. Travels with every message the bridge writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub origin: Platform,
    pub origin_author: String,
    pub origin_message_id: String,
    pub mirror_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub platform: Platform,
    pub conversation_id: String,
    pub conversation_name: Option<String>,
    /// Guild id for Discord events, absent elsewhere.
    pub group_id: Option<String>,
    pub message_id: String,
    pub author_id: String,
    pub author_name: String,
    pub avatar_url: Option<String>,
    pub content: String,
    pub timestamp_ms: i64,
    pub provenance: Option<Provenance>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub conversation_id: String,
    pub content: String,
    pub author_name: String,
    pub avatar_url: Option<String>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    /// Oldest first.
    pub events: Vec<InboundEvent>,
    pub next_cursor: Option<String>,
    /// Raw items returned by the platform, before non-message items were dropped.
    pub fetched: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRef {
    pub id: String,
    pub name: String,
    pub group_id: Option<String>,
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    fn platform(&self) -> Platform;

    /// Delivers one message and returns the id the platform assigned to it.
    async fn send(&self, message: &OutboundMessage) -> Result<String>;

    /// Creates a conversation named `name` under `parent`. Only the space supports this.
    async fn provision_conversation(&self, parent: &str, name: &str) -> Result<String> {
        anyhow::bail!(
            "{} cannot provision conversation {name} under {parent}",
            self.platform()
        )
    }
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_after(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage>;

    /// Cursor pointing at the newest item, used to skip old history.
    async fn latest_cursor(&self, _conversation_id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Conversations inside a group that should be caught up even when not yet mapped.
    async fn discover_conversations(&self, _group_id: &str) -> Result<Vec<ConversationRef>> {
        Ok(Vec::new())
    }
}

/// Resolves platform group aliases and enumerates a group's conversations.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn resolve_group(&self, alias_or_id: &str) -> Result<String>;

    async fn child_conversations(&self, _group_id: &str) -> Result<Vec<ConversationRef>> {
        Ok(Vec::new())
    }
}
