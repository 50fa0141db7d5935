use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use matrix_bot_sdk::appservice::AppserviceHandler;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{MatrixAppservice, PROVENANCE_KEY};
use crate::bridge::BridgeCore;
use crate::bridge::commands::CallerContext;
use crate::bridge::platform::{InboundEvent, Platform, Provenance};

/// Converts a room message event into a router event. Edits and non-text events yield `None`.
pub fn inbound_event(event: &Value) -> Option<InboundEvent> {
    if event.get("type").and_then(Value::as_str) != Some("m.room.message") {
        return None;
    }
    let content = event.get("content")?;
    let is_edit = content
        .get("m.relates_to")
        .and_then(|relation| relation.get("rel_type"))
        .and_then(Value::as_str)
        == Some("m.replace");
    if is_edit {
        return None;
    }
    let body = content.get("body").and_then(Value::as_str)?;
    let sender = event.get("sender").and_then(Value::as_str)?;

    Some(InboundEvent {
        platform: Platform::Matrix,
        conversation_id: event.get("room_id").and_then(Value::as_str)?.to_string(),
        conversation_name: None,
        group_id: None,
        message_id: event.get("event_id").and_then(Value::as_str)?.to_string(),
        author_id: sender.to_string(),
        author_name: sender.to_string(),
        avatar_url: None,
        content: body.to_string(),
        timestamp_ms: event
            .get("origin_server_ts")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        provenance: content
            .get(PROVENANCE_KEY)
            .and_then(|value| serde_json::from_value::<Provenance>(value.clone()).ok()),
    })
}

/// Receives homeserver transactions and feeds them into the bridge.
pub struct MatrixEventProcessor {
    appservice: Arc<MatrixAppservice>,
    bridge: RwLock<Option<Arc<BridgeCore>>>,
}

impl MatrixEventProcessor {
    pub fn new(appservice: Arc<MatrixAppservice>) -> Self {
        Self {
            appservice,
            bridge: RwLock::new(None),
        }
    }

    pub async fn set_bridge(&self, bridge: Arc<BridgeCore>) {
        *self.bridge.write().await = Some(bridge);
    }

    pub async fn process_transaction(&self, txn_id: &str, body: &Value) -> Result<()> {
        let Some(events) = body.get("events").and_then(Value::as_array) else {
            return Ok(());
        };
        debug!("matrix transaction txn_id={} events={}", txn_id, events.len());
        for event in events {
            if let Err(err) = self.process_event(event).await {
                error!("error processing matrix event: {}", err);
            }
        }
        Ok(())
    }

    async fn process_event(&self, event: &Value) -> Result<()> {
        match event.get("type").and_then(Value::as_str) {
            Some("m.room.message") => self.handle_room_message(event).await,
            Some("m.room.member") => self.handle_room_member(event).await,
            Some(other) => {
                debug!("unhandled matrix event type: {}", other);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn handle_room_message(&self, event: &Value) -> Result<()> {
        let Some(inbound) = inbound_event(event) else {
            return Ok(());
        };
        let Some(bridge) = self.bridge.read().await.clone() else {
            debug!("matrix message received without bridge binding");
            return Ok(());
        };

        if !self.appservice.is_bridge_user(&inbound.author_id)
            && inbound.content.starts_with(bridge.command_sigil())
            && self.handle_command(&bridge, &inbound).await?
        {
            return Ok(());
        }

        let message_id = inbound.message_id.clone();
        let resolution = bridge.handle_event(inbound).await;
        debug!("matrix message handled event_id={} status={}", message_id, resolution);
        Ok(())
    }

    /// Returns `true` when the message was a registered command and has been answered.
    async fn handle_command(&self, bridge: &BridgeCore, inbound: &InboundEvent) -> Result<bool> {
        let ctx = CallerContext {
            platform: Platform::Matrix,
            group_id: inbound.conversation_id.clone(),
            caller_id: inbound.author_id.clone(),
            is_admin: self
                .appservice
                .is_admin(&inbound.author_id, &inbound.conversation_id)
                .await,
        };
        let Some(reply) = bridge.handle_command_text(&inbound.content, &ctx).await else {
            return Ok(false);
        };
        self.appservice
            .send_notice(&inbound.conversation_id, &reply)
            .await?;
        Ok(true)
    }

    /// Accepts invites addressed to the bridge bot so room admins can issue commands.
    async fn handle_room_member(&self, event: &Value) -> Result<()> {
        let bot = self.appservice.bot_user_id();
        let is_bot_invite = event.get("state_key").and_then(Value::as_str) == Some(bot.as_str())
            && event
                .get("content")
                .and_then(|content| content.get("membership"))
                .and_then(Value::as_str)
                == Some("invite");
        if !is_bot_invite {
            return Ok(());
        }
        let Some(room_id) = event.get("room_id").and_then(Value::as_str) else {
            return Ok(());
        };
        match self.appservice.join_room_as(room_id, &bot).await {
            Ok(()) => info!("accepted matrix invite room_id={}", room_id),
            Err(err) => warn!("failed to accept matrix invite room_id={} error={}", room_id, err),
        }
        Ok(())
    }
}

#[async_trait]
impl AppserviceHandler for MatrixEventProcessor {
    async fn on_transaction(&self, txn_id: &str, body: &Value) -> Result<()> {
        self.process_transaction(txn_id, body).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(content: Value) -> Value {
        json!({
            "type": "m.room.message",
            "event_id": "$e1",
            "room_id": "!room:example.org",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_700_000_000_000_i64,
            "content": content,
        })
    }

    #[test]
    fn text_messages_become_inbound_events() {
        let event = inbound_event(&message(json!({ "msgtype": "m.text", "body": "hi" })))
            .expect("inbound event");

        assert_eq!(event.platform, Platform::Matrix);
        assert_eq!(event.conversation_id, "!room:example.org");
        assert_eq!(event.message_id, "$e1");
        assert_eq!(event.timestamp_ms, 1_700_000_000_000);
        assert!(event.provenance.is_none());
    }

    #[test]
    fn provenance_is_read_from_the_namespaced_key() {
        let event = inbound_event(&message(json!({
            "msgtype": "m.text",
            "body": "hi",
            PROVENANCE_KEY: {
                "origin": "discord",
                "origin_author": "1001",
                "origin_message_id": "m1",
                "mirror_id": "x"
            }
        })))
        .expect("inbound event");

        assert_eq!(event.provenance.map(|p| p.origin), Some(Platform::Discord));
    }

    #[test]
    fn edits_and_other_event_types_are_skipped() {
        let edit = message(json!({
            "msgtype": "m.text",
            "body": "* hi",
            "m.relates_to": { "rel_type": "m.replace", "event_id": "$e0" }
        }));
        let mut topic = message(json!({ "topic": "x" }));
        topic["type"] = json!("m.room.topic");

        assert!(inbound_event(&edit).is_none());
        assert!(inbound_event(&topic).is_none());
    }

    #[test]
    fn transactions_without_a_bridge_are_acknowledged() {
        let config: crate::config::MatrixConfig = serde_yaml::from_str(
            r#"
domain: "example.org"
homeserver_url: "https://matrix.example.org"
as_token: "as"
hs_token: "hs"
"#,
        )
        .expect("parse matrix config");
        let appservice = Arc::new(MatrixAppservice::new(config).expect("appservice"));
        let processor = MatrixEventProcessor::new(appservice);
        let body = json!({
            "events": [message(json!({ "msgtype": "m.text", "body": "hello" }))]
        });

        tokio_test::block_on(processor.process_transaction("t1", &body)).expect("transaction");
        tokio_test::block_on(processor.process_transaction("t2", &json!({}))).expect("empty");
    }
}
