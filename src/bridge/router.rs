use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::BridgeError;
use super::platform::{InboundEvent, MessageSink, OutboundMessage, Platform, Provenance};
use super::watermark::WatermarkTracker;
use crate::db::{DatabaseError, DatabaseManager, MappingKind};
use crate::utils::preview_text;

/// One direction of traffic. Every platform conversation is mirrored into a space thread
/// and space threads are mirrored back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    DiscordToSpace,
    SpaceToDiscord,
    MatrixToSpace,
    SpaceToMatrix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    /// Replay everything after the stored cursor, from the start of history.
    Beginning,
    /// Without a stored cursor, start at the conversation head.
    Latest,
}

impl Link {
    pub const ALL: [Link; 4] = [
        Link::DiscordToSpace,
        Link::SpaceToDiscord,
        Link::MatrixToSpace,
        Link::SpaceToMatrix,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Link::DiscordToSpace => "discord_to_space",
            Link::SpaceToDiscord => "space_to_discord",
            Link::MatrixToSpace => "matrix_to_space",
            Link::SpaceToMatrix => "space_to_matrix",
        }
    }

    pub fn source(self) -> Platform {
        match self {
            Link::DiscordToSpace => Platform::Discord,
            Link::MatrixToSpace => Platform::Matrix,
            Link::SpaceToDiscord | Link::SpaceToMatrix => Platform::Space,
        }
    }

    pub fn target(self) -> Platform {
        match self {
            Link::DiscordToSpace | Link::MatrixToSpace => Platform::Space,
            Link::SpaceToDiscord => Platform::Discord,
            Link::SpaceToMatrix => Platform::Matrix,
        }
    }

    /// Namespace holding the conversation pairs this link resolves through.
    pub fn mapping_kind(self) -> MappingKind {
        match self {
            Link::DiscordToSpace | Link::SpaceToDiscord => MappingKind::ChannelThread,
            Link::MatrixToSpace | Link::SpaceToMatrix => MappingKind::RoomThread,
        }
    }

    pub fn reverse(self) -> Link {
        match self {
            Link::DiscordToSpace => Link::SpaceToDiscord,
            Link::SpaceToDiscord => Link::DiscordToSpace,
            Link::MatrixToSpace => Link::SpaceToMatrix,
            Link::SpaceToMatrix => Link::MatrixToSpace,
        }
    }

    pub fn start_policy(self) -> StartPolicy {
        match self.source() {
            Platform::Space => StartPolicy::Latest,
            Platform::Discord | Platform::Matrix => StartPolicy::Beginning,
        }
    }

    /// Key for per-conversation state (watermarks, cursors) of this direction.
    pub fn scoped(self, conversation_id: &str) -> String {
        format!("{}:{}", self.name(), conversation_id)
    }

    pub fn inbound_from(platform: Platform) -> Option<Link> {
        match platform {
            Platform::Discord => Some(Link::DiscordToSpace),
            Platform::Matrix => Some(Link::MatrixToSpace),
            Platform::Space => None,
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Mirrored { mirror_id: String, remote_id: String },
    IgnoredVirtualUser,
    IgnoredNotMapped,
    IgnoredAlreadySeen,
    IgnoredAlreadySynced,
    SendFailed { mirror_id: String, reason: String },
}

impl RouteOutcome {
    pub fn is_mirrored(&self) -> bool {
        matches!(self, RouteOutcome::Mirrored { .. })
    }
}

/// Author patterns of the identities the bridge itself writes as, per platform.
#[derive(Debug, Clone, Default)]
pub struct IdentityPatterns {
    patterns: HashMap<Platform, Regex>,
}

impl IdentityPatterns {
    pub fn with(mut self, platform: Platform, pattern: Regex) -> Self {
        self.patterns.insert(platform, pattern);
        self
    }

    pub fn matches(&self, platform: Platform, author_id: &str) -> bool {
        self.patterns
            .get(&platform)
            .is_some_and(|pattern| pattern.is_match(author_id))
    }
}

pub struct EventRouter {
    db: Arc<DatabaseManager>,
    watermarks: WatermarkTracker,
    sinks: HashMap<Platform, Arc<dyn MessageSink>>,
    identities: IdentityPatterns,
}

impl EventRouter {
    pub fn new(
        db: Arc<DatabaseManager>,
        sinks: Vec<Arc<dyn MessageSink>>,
        identities: IdentityPatterns,
    ) -> Self {
        let watermarks = WatermarkTracker::new(db.watermark_store());
        let sinks = sinks.into_iter().map(|sink| (sink.platform(), sink)).collect();
        Self {
            db,
            watermarks,
            sinks,
            identities,
        }
    }

    pub fn watermarks(&self) -> &WatermarkTracker {
        &self.watermarks
    }

    pub fn has_sink(&self, platform: Platform) -> bool {
        self.sinks.contains_key(&platform)
    }

    pub fn is_self_echo(&self, link: Link, event: &InboundEvent) -> bool {
        if self.identities.matches(event.platform, &event.author_id) {
            return true;
        }
        match (&event.provenance, event.platform) {
            (None, _) => false,
            (Some(provenance), Platform::Space) => provenance.origin == link.target(),
            (Some(_), Platform::Discord | Platform::Matrix) => true,
        }
    }

    pub async fn route(&self, link: Link, event: InboundEvent) -> Result<RouteOutcome, BridgeError> {
        debug!(
            "route start link={} conversation={} message_id={} author={} timestamp={} preview={}",
            link,
            event.conversation_id,
            event.message_id,
            event.author_id,
            event.timestamp_ms,
            preview_text(&event.content)
        );

        if self.is_self_echo(link, &event) {
            return Ok(RouteOutcome::IgnoredVirtualUser);
        }

        let Some(sink) = self.sinks.get(&link.target()).cloned() else {
            debug!("route target not configured link={}", link);
            return Ok(RouteOutcome::IgnoredNotMapped);
        };

        let Some(destination) = self.resolve_destination(link, &event, sink.as_ref()).await? else {
            return Ok(RouteOutcome::IgnoredNotMapped);
        };

        let watermark_key = link.scoped(&event.conversation_id);
        if !self
            .watermarks
            .should_process(&watermark_key, event.timestamp_ms)
            .await?
        {
            return Ok(RouteOutcome::IgnoredAlreadySeen);
        }

        let synced = self.db.synced_store();
        if synced.mirror_of(link.name(), &event.message_id).await?.is_some() {
            return Ok(RouteOutcome::IgnoredAlreadySynced);
        }

        self.watermarks
            .advance(&watermark_key, event.timestamp_ms)
            .await?;

        let mirror_id = Uuid::new_v4().to_string();
        match synced.record(link.name(), &event.message_id, &mirror_id).await {
            Ok(()) => {}
            Err(DatabaseError::AlreadyRegistered(_)) => {
                return Ok(RouteOutcome::IgnoredAlreadySynced);
            }
            Err(err) => return Err(err.into()),
        }

        let outbound = outbound_for(&event, destination, &mirror_id);
        match sink.send(&outbound).await {
            Ok(remote_id) => {
                synced
                    .record_delivery(link.reverse().name(), &remote_id, &mirror_id)
                    .await?;
                info!(
                    "mirrored message link={} source_message={} mirror_id={} remote_id={}",
                    link, event.message_id, mirror_id, remote_id
                );
                Ok(RouteOutcome::Mirrored {
                    mirror_id,
                    remote_id,
                })
            }
            Err(err) => {
                let failure = BridgeError::TransientSendFailure {
                    platform: link.target().to_string(),
                    reason: err.to_string(),
                };
                warn!(
                    "outbound send failed link={} source_message={} mirror_id={} error={}",
                    link, event.message_id, mirror_id, failure
                );
                Ok(RouteOutcome::SendFailed {
                    mirror_id,
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn resolve_destination(
        &self,
        link: Link,
        event: &InboundEvent,
        sink: &dyn MessageSink,
    ) -> Result<Option<String>, BridgeError> {
        let store = self.db.mapping_store(link.mapping_kind());
        let existing = match link.source() {
            Platform::Space => store.lookup_by_b(&event.conversation_id).await?,
            Platform::Discord | Platform::Matrix => store.lookup_by_a(&event.conversation_id).await?,
        };
        if existing.is_some() || link != Link::DiscordToSpace {
            return Ok(existing);
        }

        let Some(guild_id) = event.group_id.as_deref() else {
            return Ok(None);
        };
        let Some(space_id) = self
            .db
            .mapping_store(MappingKind::GuildSpace)
            .lookup_by_a(guild_id)
            .await?
        else {
            return Ok(None);
        };

        let name = event
            .conversation_name
            .clone()
            .unwrap_or_else(|| event.conversation_id.clone());
        let thread_id = sink
            .provision_conversation(&space_id, &name)
            .await
            .map_err(|err| BridgeError::TransientSendFailure {
                platform: Platform::Space.to_string(),
                reason: err.to_string(),
            })?;

        match store
            .register(&event.conversation_id, &thread_id, Some(&space_id))
            .await
        {
            Ok(()) => {
                info!(
                    "provisioned thread channel={} thread={} space={}",
                    event.conversation_id, thread_id, space_id
                );
                Ok(Some(thread_id))
            }
            // A concurrent event for the same channel won the race.
            Err(DatabaseError::AlreadyRegistered(_)) => {
                Ok(store.lookup_by_a(&event.conversation_id).await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn outbound_for(event: &InboundEvent, destination: String, mirror_id: &str) -> OutboundMessage {
    let provenance = match &event.provenance {
        Some(upstream) => Provenance {
            origin: upstream.origin,
            origin_author: upstream.origin_author.clone(),
            origin_message_id: upstream.origin_message_id.clone(),
            mirror_id: mirror_id.to_string(),
        },
        None => Provenance {
            origin: event.platform,
            origin_author: event.author_id.clone(),
            origin_message_id: event.message_id.clone(),
            mirror_id: mirror_id.to_string(),
        },
    };
    OutboundMessage {
        conversation_id: destination,
        content: event.content.clone(),
        author_name: event.author_name.clone(),
        avatar_url: event.avatar_url.clone(),
        provenance,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use regex::Regex;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::db::manager::tests::sqlite_manager;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) platform: Option<Platform>,
        pub(crate) sent: Mutex<Vec<OutboundMessage>>,
        pub(crate) fail: bool,
        pub(crate) provisioned: Mutex<Vec<(String, String)>>,
    }

    impl RecordingSink {
        pub(crate) fn new(platform: Platform) -> Arc<Self> {
            Arc::new(Self {
                platform: Some(platform),
                ..Self::default()
            })
        }

        pub(crate) fn failing(platform: Platform) -> Arc<Self> {
            Arc::new(Self {
                platform: Some(platform),
                fail: true,
                ..Self::default()
            })
        }

        pub(crate) fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        fn platform(&self) -> Platform {
            self.platform.unwrap_or(Platform::Space)
        }

        async fn send(&self, message: &OutboundMessage) -> Result<String> {
            if self.fail {
                anyhow::bail!("remote rejected the message");
            }
            let mut sent = self.sent.lock();
            sent.push(message.clone());
            Ok(format!("remote-{}", sent.len()))
        }

        async fn provision_conversation(&self, parent: &str, name: &str) -> Result<String> {
            let mut provisioned = self.provisioned.lock();
            provisioned.push((parent.to_string(), name.to_string()));
            Ok(format!("thread-{}", provisioned.len()))
        }
    }

    pub(crate) fn discord_event(channel: &str, message_id: &str, timestamp_ms: i64) -> InboundEvent {
        InboundEvent {
            platform: Platform::Discord,
            conversation_id: channel.to_string(),
            conversation_name: Some("general".to_string()),
            group_id: Some("G1".to_string()),
            message_id: message_id.to_string(),
            author_id: "1001".to_string(),
            author_name: "alice".to_string(),
            avatar_url: None,
            content: "hello".to_string(),
            timestamp_ms,
            provenance: None,
        }
    }

    fn space_event(thread: &str, message_id: &str, origin: Option<Platform>) -> InboundEvent {
        InboundEvent {
            platform: Platform::Space,
            conversation_id: thread.to_string(),
            conversation_name: None,
            group_id: None,
            message_id: message_id.to_string(),
            author_id: "co_zBridge".to_string(),
            author_name: "alice".to_string(),
            avatar_url: None,
            content: "hello".to_string(),
            timestamp_ms: 10,
            provenance: origin.map(|origin| Provenance {
                origin,
                origin_author: "1001".to_string(),
                origin_message_id: "m0".to_string(),
                mirror_id: "mirror-0".to_string(),
            }),
        }
    }

    fn patterns() -> IdentityPatterns {
        IdentityPatterns::default()
            .with(Platform::Matrix, Regex::new(r"^@_space_.*:example\.org$").expect("regex"))
            .with(Platform::Discord, Regex::new(r"^webhook:").expect("regex"))
    }

    fn router(db: &Arc<DatabaseManager>, sinks: Vec<Arc<dyn MessageSink>>) -> EventRouter {
        EventRouter::new(db.clone(), sinks, patterns())
    }

    #[tokio::test]
    async fn mapped_event_is_mirrored_once_and_advances_watermark() {
        let file = NamedTempFile::new().expect("temp db");
        let db = Arc::new(sqlite_manager(&file).await);
        db.mapping_store(MappingKind::GuildSpace)
            .register("G1", "S1", None)
            .await
            .expect("register guild");
        db.mapping_store(MappingKind::ChannelThread)
            .register("C1", "T1", Some("S1"))
            .await
            .expect("register channel");
        let space = RecordingSink::new(Platform::Space);
        let router = router(&db, vec![space.clone() as Arc<dyn MessageSink>]);

        let first = router
            .route(Link::DiscordToSpace, discord_event("C1", "m1", 1_000))
            .await
            .expect("route");
        let second = router
            .route(Link::DiscordToSpace, discord_event("C1", "m1", 1_000))
            .await
            .expect("route");

        assert!(first.is_mirrored());
        assert_eq!(second, RouteOutcome::IgnoredAlreadySeen);
        assert_eq!(space.sent_count(), 1);
        assert_eq!(space.sent.lock()[0].conversation_id, "T1");
        assert_eq!(space.sent.lock()[0].provenance.origin, Platform::Discord);
        assert_eq!(
            router
                .watermarks()
                .current(&Link::DiscordToSpace.scoped("C1"))
                .await
                .expect("read"),
            Some(1_000)
        );
        assert!(
            db.synced_store()
                .mirror_of(Link::DiscordToSpace.name(), "m1")
                .await
                .expect("read")
                .is_some()
        );
    }

    #[tokio::test]
    async fn already_synced_message_with_newer_timestamp_is_skipped() {
        let file = NamedTempFile::new().expect("temp db");
        let db = Arc::new(sqlite_manager(&file).await);
        db.mapping_store(MappingKind::ChannelThread)
            .register("C1", "T1", Some("S1"))
            .await
            .expect("register channel");
        db.synced_store()
            .record(Link::DiscordToSpace.name(), "m1", "mirror-x")
            .await
            .expect("record");
        let space = RecordingSink::new(Platform::Space);
        let router = router(&db, vec![space.clone() as Arc<dyn MessageSink>]);

        let outcome = router
            .route(Link::DiscordToSpace, discord_event("C1", "m1", 5_000))
            .await
            .expect("route");

        assert_eq!(outcome, RouteOutcome::IgnoredAlreadySynced);
        assert_eq!(space.sent_count(), 0);
    }

    #[tokio::test]
    async fn ghost_authors_are_never_mirrored() {
        let file = NamedTempFile::new().expect("temp db");
        let db = Arc::new(sqlite_manager(&file).await);
        db.mapping_store(MappingKind::RoomThread)
            .register("!room:example.org", "T1", Some("S1"))
            .await
            .expect("register room");
        let space = RecordingSink::new(Platform::Space);
        let router = router(&db, vec![space.clone() as Arc<dyn MessageSink>]);

        let mut event = discord_event("!room:example.org", "$e1", 1);
        event.platform = Platform::Matrix;
        event.author_id = "@_space_discord_1001:example.org".to_string();

        let outcome = router.route(Link::MatrixToSpace, event).await.expect("route");

        assert_eq!(outcome, RouteOutcome::IgnoredVirtualUser);
        assert_eq!(space.sent_count(), 0);
    }

    #[tokio::test]
    async fn space_messages_are_echoes_only_towards_their_origin() {
        let file = NamedTempFile::new().expect("temp db");
        let db = Arc::new(sqlite_manager(&file).await);
        let router = router(&db, vec![]);

        let from_discord = space_event("T1", "s1", Some(Platform::Discord));
        let native = space_event("T1", "s2", None);

        assert!(router.is_self_echo(Link::SpaceToDiscord, &from_discord));
        assert!(!router.is_self_echo(Link::SpaceToMatrix, &from_discord));
        assert!(!router.is_self_echo(Link::SpaceToDiscord, &native));
    }

    #[tokio::test]
    async fn unmapped_conversation_is_ignored() {
        let file = NamedTempFile::new().expect("temp db");
        let db = Arc::new(sqlite_manager(&file).await);
        let space = RecordingSink::new(Platform::Space);
        let router = router(&db, vec![space.clone() as Arc<dyn MessageSink>]);

        let outcome = router
            .route(Link::DiscordToSpace, discord_event("C9", "m1", 1))
            .await
            .expect("route");

        assert_eq!(outcome, RouteOutcome::IgnoredNotMapped);
        assert!(space.provisioned.lock().is_empty());
    }

    #[tokio::test]
    async fn channel_in_mapped_guild_gets_a_thread() {
        let file = NamedTempFile::new().expect("temp db");
        let db = Arc::new(sqlite_manager(&file).await);
        db.mapping_store(MappingKind::GuildSpace)
            .register("G1", "S1", None)
            .await
            .expect("register guild");
        let space = RecordingSink::new(Platform::Space);
        let router = router(&db, vec![space.clone() as Arc<dyn MessageSink>]);

        let outcome = router
            .route(Link::DiscordToSpace, discord_event("C2", "m1", 1))
            .await
            .expect("route");

        assert!(outcome.is_mirrored());
        assert_eq!(
            space.provisioned.lock().as_slice(),
            &[("S1".to_string(), "general".to_string())]
        );
        let threads = db.mapping_store(MappingKind::ChannelThread);
        assert_eq!(
            threads.lookup_by_a("C2").await.expect("lookup").as_deref(),
            Some("thread-1")
        );
        assert_eq!(threads.list_children("S1").await.expect("children"), vec!["thread-1"]);
    }

    #[tokio::test]
    async fn failed_send_still_marks_the_event_seen() {
        let file = NamedTempFile::new().expect("temp db");
        let db = Arc::new(sqlite_manager(&file).await);
        db.mapping_store(MappingKind::ChannelThread)
            .register("C1", "T1", Some("S1"))
            .await
            .expect("register");
        let space = RecordingSink::failing(Platform::Space);
        let router = router(&db, vec![space.clone() as Arc<dyn MessageSink>]);

        let first = router
            .route(Link::DiscordToSpace, discord_event("C1", "m1", 7))
            .await
            .expect("route");
        let retry = router
            .route(Link::DiscordToSpace, discord_event("C1", "m1", 7))
            .await
            .expect("route");

        assert!(matches!(first, RouteOutcome::SendFailed { .. }));
        assert_eq!(retry, RouteOutcome::IgnoredAlreadySeen);
    }

    #[tokio::test]
    async fn delivery_is_recorded_under_the_reverse_scope() {
        let file = NamedTempFile::new().expect("temp db");
        let db = Arc::new(sqlite_manager(&file).await);
        db.mapping_store(MappingKind::ChannelThread)
            .register("C1", "T1", Some("S1"))
            .await
            .expect("register");
        let space = RecordingSink::new(Platform::Space);
        let router = router(&db, vec![space.clone() as Arc<dyn MessageSink>]);

        let RouteOutcome::Mirrored { mirror_id, remote_id } = router
            .route(Link::DiscordToSpace, discord_event("C1", "m1", 1))
            .await
            .expect("route")
        else {
            panic!("expected a mirrored outcome");
        };

        assert_eq!(
            db.synced_store()
                .mirror_of(Link::SpaceToDiscord.name(), &remote_id)
                .await
                .expect("read"),
            Some(mirror_id)
        );
    }
}
