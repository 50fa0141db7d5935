//! Access to the canonical data space.
//!
//! [`DataSpace`] is the narrow surface the bridge needs; [`SpaceAdapter`] turns any
//! implementation into the router's sink and the backfill engine's history source.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::bridge::platform::{
    ConversationRef, HistoryPage, HistorySource, InboundEvent, MessageSink, OutboundMessage,
    Platform, Provenance,
};
use crate::config::SpaceConfig;

#[async_trait]
pub trait DataSpace: Send + Sync {
    /// Account the bridge writes as. Users grant it access to their spaces.
    fn account_id(&self) -> &str;
    /// Canonical id for an id or alias, `None` when no such space exists.
    async fn resolve_space(&self, id_or_alias: &str) -> Result<Option<String>>;
    async fn has_write_grant(&self, space_id: &str) -> Result<bool>;
    async fn list_threads(&self, space_id: &str) -> Result<Vec<ConversationRef>>;
    async fn create_thread(&self, space_id: &str, name: &str) -> Result<String>;
    async fn post_message(&self, message: &OutboundMessage) -> Result<String>;
    async fn messages_after(
        &self,
        thread_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage>;
    async fn latest_cursor(&self, thread_id: &str) -> Result<Option<String>>;
}

pub struct SpaceAdapter {
    space: Arc<dyn DataSpace>,
}

impl SpaceAdapter {
    pub fn new(space: Arc<dyn DataSpace>) -> Self {
        Self { space }
    }
}

#[async_trait]
impl MessageSink for SpaceAdapter {
    fn platform(&self) -> Platform {
        Platform::Space
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String> {
        self.space.post_message(message).await
    }

    async fn provision_conversation(&self, parent: &str, name: &str) -> Result<String> {
        self.space.create_thread(parent, name).await
    }
}

#[async_trait]
impl HistorySource for SpaceAdapter {
    async fn fetch_after(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage> {
        self.space.messages_after(conversation_id, cursor, limit).await
    }

    async fn latest_cursor(&self, conversation_id: &str) -> Result<Option<String>> {
        self.space.latest_cursor(conversation_id).await
    }

    async fn discover_conversations(&self, group_id: &str) -> Result<Vec<ConversationRef>> {
        self.space.list_threads(group_id).await
    }
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    #[serde(default)]
    write: bool,
}

#[derive(Debug, Deserialize)]
struct ThreadEntry {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpaceMessage {
    id: String,
    author_id: String,
    #[serde(default)]
    author_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    content: String,
    created_at: i64,
    #[serde(default)]
    provenance: Option<Provenance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesResponse {
    messages: Vec<SpaceMessage>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeadResponse {
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PostMessage<'a> {
    content: &'a str,
    author_name: &'a str,
    avatar_url: Option<&'a str>,
    provenance: &'a Provenance,
}

/// [`DataSpace`] over the space's HTTP gateway.
pub struct HttpDataSpace {
    client: Client,
    base_url: Url,
    account_id: String,
    account_secret: SecretString,
    api_key: Option<SecretString>,
}

impl HttpDataSpace {
    pub fn new(config: &SpaceConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.api_url)
            .map_err(|e| anyhow!("invalid space api url {}: {}", config.api_url, e))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            account_id: config.account_id.clone(),
            account_secret: SecretString::from(config.account_secret.clone()),
            api_key: config.api_key.clone().map(SecretString::from),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("space api url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header("X-Space-Account", &self.account_id)
            .header("X-Space-Secret", self.account_secret.expose_secret());
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<Option<T>> {
        debug!("space GET {}", url.path());
        let response = self
            .authorize(self.client.get(url.clone()))
            .send()
            .await
            .map_err(|e| anyhow!("space request {} failed: {}", url.path(), e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("space request {} failed: {} - {}", url.path(), status, body));
        }
        let value = response
            .json::<T>()
            .await
            .map_err(|e| anyhow!("failed to parse space response from {}: {}", url.path(), e))?;
        Ok(Some(value))
    }

    async fn post_json<B: Serialize + ?Sized>(&self, url: Url, body: &B) -> Result<IdResponse> {
        debug!("space POST {}", url.path());
        let response = self
            .authorize(self.client.post(url.clone()))
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow!("space request {} failed: {}", url.path(), e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("space request {} failed: {} - {}", url.path(), status, body));
        }
        response
            .json::<IdResponse>()
            .await
            .map_err(|e| anyhow!("failed to parse space response from {}: {}", url.path(), e))
    }
}

#[async_trait]
impl DataSpace for HttpDataSpace {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn resolve_space(&self, id_or_alias: &str) -> Result<Option<String>> {
        let url = self.endpoint(&["spaces", id_or_alias])?;
        Ok(self.get_json::<IdResponse>(url).await?.map(|space| space.id))
    }

    async fn has_write_grant(&self, space_id: &str) -> Result<bool> {
        let url = self.endpoint(&["spaces", space_id, "grants", &self.account_id])?;
        Ok(self
            .get_json::<GrantResponse>(url)
            .await?
            .is_some_and(|grant| grant.write))
    }

    async fn list_threads(&self, space_id: &str) -> Result<Vec<ConversationRef>> {
        let url = self.endpoint(&["spaces", space_id, "threads"])?;
        let threads = self.get_json::<Vec<ThreadEntry>>(url).await?.unwrap_or_default();
        Ok(threads
            .into_iter()
            .map(|thread| ConversationRef {
                id: thread.id,
                name: thread.name,
                group_id: Some(space_id.to_string()),
            })
            .collect())
    }

    async fn create_thread(&self, space_id: &str, name: &str) -> Result<String> {
        let url = self.endpoint(&["spaces", space_id, "threads"])?;
        let created = self
            .post_json(url, &serde_json::json!({ "name": name }))
            .await?;
        Ok(created.id)
    }

    async fn post_message(&self, message: &OutboundMessage) -> Result<String> {
        let url = self.endpoint(&["threads", &message.conversation_id, "messages"])?;
        let body = PostMessage {
            content: &message.content,
            author_name: &message.author_name,
            avatar_url: message.avatar_url.as_deref(),
            provenance: &message.provenance,
        };
        Ok(self.post_json(url, &body).await?.id)
    }

    async fn messages_after(
        &self,
        thread_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let mut url = self.endpoint(&["threads", thread_id, "messages"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("after", cursor);
            }
        }
        let response = self
            .get_json::<MessagesResponse>(url)
            .await?
            .ok_or_else(|| anyhow!("space thread {} not found", thread_id))?;
        Ok(history_page(thread_id, response))
    }

    async fn latest_cursor(&self, thread_id: &str) -> Result<Option<String>> {
        let url = self.endpoint(&["threads", thread_id, "head"])?;
        Ok(self
            .get_json::<HeadResponse>(url)
            .await?
            .and_then(|head| head.cursor))
    }
}

fn history_page(thread_id: &str, response: MessagesResponse) -> HistoryPage {
    let fetched = response.messages.len();
    let events = response
        .messages
        .into_iter()
        .map(|message| InboundEvent {
            platform: Platform::Space,
            conversation_id: thread_id.to_string(),
            conversation_name: None,
            group_id: None,
            author_name: message
                .author_name
                .unwrap_or_else(|| message.author_id.clone()),
            message_id: message.id,
            author_id: message.author_id,
            avatar_url: message.avatar_url,
            content: message.content,
            timestamp_ms: message.created_at,
            provenance: message.provenance,
        })
        .collect();
    HistoryPage {
        events,
        next_cursor: response.next_cursor,
        fetched,
    }
}
