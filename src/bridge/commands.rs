use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::error::BridgeError;
use super::platform::{GroupDirectory, Platform};
use super::request::{IgnoreReason, Resolution};
use crate::db::{DatabaseError, DatabaseManager, MappingKind};
use crate::space::DataSpace;

struct CommandSpec {
    name: &'static str,
    min_args: usize,
    max_args: usize,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "connect",
        min_args: 1,
        max_args: 2,
    },
    CommandSpec {
        name: "disconnect",
        min_args: 0,
        max_args: 0,
    },
    CommandSpec {
        name: "status",
        min_args: 0,
        max_args: 0,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `group` overrides the caller's current group.
    Connect {
        group: Option<String>,
        space: String,
    },
    Disconnect,
    Status,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Disconnect => "disconnect",
            Command::Status => "status",
        }
    }

    /// Validates name and arity against the registry. Anything else is `None`.
    pub fn from_parts(name: &str, args: &[String]) -> Option<Self> {
        let spec = COMMANDS.iter().find(|spec| spec.name == name)?;
        if args.len() < spec.min_args || args.len() > spec.max_args {
            return None;
        }
        match (spec.name, args) {
            ("connect", [space]) => Some(Command::Connect {
                group: None,
                space: space.clone(),
            }),
            ("connect", [group, space]) => Some(Command::Connect {
                group: Some(group.clone()),
                space: space.clone(),
            }),
            ("disconnect", []) => Some(Command::Disconnect),
            ("status", []) => Some(Command::Status),
            _ => None,
        }
    }

    pub fn parse(sigil: &str, text: &str) -> Option<Self> {
        let rest = text.trim_start().strip_prefix(sigil)?;
        let mut words = rest.split_whitespace();
        let name = words.next()?;
        let args: Vec<String> = words.map(str::to_string).collect();
        Self::from_parts(name, &args)
    }
}

#[derive(Debug, Clone)]
pub struct CallerContext {
    pub platform: Platform,
    /// Guild id on Discord, the current room on Matrix.
    pub group_id: String,
    pub caller_id: String,
    pub is_admin: bool,
}

impl CallerContext {
    fn group_kind(&self) -> Option<MappingKind> {
        match self.platform {
            Platform::Discord => Some(MappingKind::GuildSpace),
            Platform::Matrix => Some(MappingKind::MatrixSpace),
            Platform::Space => None,
        }
    }

    fn group_noun(&self) -> &'static str {
        match self.platform {
            Platform::Discord => "server",
            Platform::Matrix => "room",
            Platform::Space => "space",
        }
    }
}

/// Reply for the caller plus the classification logged by the request tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub reply: String,
    pub resolution: Resolution,
}

pub struct CommandProcessor {
    db: Arc<DatabaseManager>,
    space: Arc<dyn DataSpace>,
    directories: HashMap<Platform, Arc<dyn GroupDirectory>>,
    sigil: String,
}

impl CommandProcessor {
    pub fn new(
        db: Arc<DatabaseManager>,
        space: Arc<dyn DataSpace>,
        directories: HashMap<Platform, Arc<dyn GroupDirectory>>,
        sigil: impl Into<String>,
    ) -> Self {
        Self {
            db,
            space,
            directories,
            sigil: sigil.into(),
        }
    }

    pub fn sigil(&self) -> &str {
        &self.sigil
    }

    pub fn parse(&self, text: &str) -> Option<Command> {
        Command::parse(&self.sigil, text)
    }

    /// Runs a validated command. The outcome carries the reply for the caller and its classification.
    pub async fn execute(&self, command: &Command, ctx: &CallerContext) -> CommandOutcome {
        debug!(
            "command execute name={} platform={} group={} caller={}",
            command.name(),
            ctx.platform,
            ctx.group_id,
            ctx.caller_id
        );
        let result = match command {
            Command::Connect { group, space } => {
                self.connect(group.as_deref(), space, ctx).await
            }
            Command::Disconnect => self.disconnect(ctx).await,
            Command::Status => self.status(ctx).await,
        };
        match result {
            Ok(reply) => CommandOutcome {
                reply,
                resolution: Resolution::Success,
            },
            Err(err) => self.outcome_for_error(command, ctx, err),
        }
    }

    fn outcome_for_error(
        &self,
        command: &Command,
        ctx: &CallerContext,
        err: BridgeError,
    ) -> CommandOutcome {
        let (reply, resolution) = match err {
            BridgeError::PermissionDenied(reason) => (reason, Resolution::PermissionDenied),
            BridgeError::AlreadyRegistered(reason) => (reason, Resolution::AlreadyMapped),
            BridgeError::NotMapped(reason) => (reason, Resolution::Ignored(IgnoreReason::NotMapped)),
            BridgeError::NotRegistered(_) => (
                format!("This {} is no longer connected to that space.", ctx.group_noun()),
                Resolution::Ignored(IgnoreReason::NotMapped),
            ),
            other => {
                error!(
                    "command failed name={} group={} error={}",
                    command.name(),
                    ctx.group_id,
                    other
                );
                (
                    "Something went wrong, please try again later.".to_string(),
                    Resolution::Failed(other.to_string()),
                )
            }
        };
        CommandOutcome { reply, resolution }
    }

    fn require_admin(&self, ctx: &CallerContext, action: &str) -> Result<MappingKind, BridgeError> {
        let kind = ctx.group_kind().ok_or_else(|| {
            BridgeError::PermissionDenied("Commands are not available here.".to_string())
        })?;
        if !ctx.is_admin {
            return Err(BridgeError::PermissionDenied(format!(
                "You need administrator permissions in this {} to {} a space.",
                ctx.group_noun(),
                action
            )));
        }
        Ok(kind)
    }

    async fn connect(
        &self,
        group_alias: Option<&str>,
        space_alias: &str,
        ctx: &CallerContext,
    ) -> Result<String, BridgeError> {
        let kind = self.require_admin(ctx, "connect")?;

        let group_id = match group_alias {
            None => ctx.group_id.clone(),
            Some(alias) => self.resolve_group(ctx.platform, alias).await?,
        };

        let space_id = match self.space.resolve_space(space_alias).await {
            Ok(Some(space_id)) => space_id,
            Ok(None) => {
                return Err(BridgeError::NotMapped(
                    "Could not find a space with that ID.".to_string(),
                ));
            }
            Err(err) => {
                warn!("space lookup failed alias={} error={}", space_alias, err);
                return Err(BridgeError::NotMapped(
                    "Could not find a space with that ID.".to_string(),
                ));
            }
        };

        let groups = self.db.mapping_store(kind);
        if groups.lookup_by_a(&group_id).await?.is_some() {
            return Err(BridgeError::AlreadyRegistered(format!(
                "This {} is already connected to a space. Disconnect it first.",
                ctx.group_noun()
            )));
        }
        if groups.lookup_by_b(&space_id).await?.is_some() {
            return Err(BridgeError::AlreadyRegistered(format!(
                "That space is already connected to another {}.",
                ctx.group_noun()
            )));
        }

        let writable = self.space.has_write_grant(&space_id).await.map_err(|err| {
            BridgeError::TransientSendFailure {
                platform: Platform::Space.to_string(),
                reason: err.to_string(),
            }
        })?;
        if !writable {
            return Err(BridgeError::PermissionDenied(format!(
                "The bridge needs write access to that space. Grant access to the account {} and try again.",
                self.space.account_id()
            )));
        }

        groups
            .register(&group_id, &space_id, None)
            .await
            .map_err(|err| match err {
                DatabaseError::AlreadyRegistered(_) => BridgeError::AlreadyRegistered(format!(
                    "This {} or space was connected by someone else in the meantime.",
                    ctx.group_noun()
                )),
                other => other.into(),
            })?;
        info!(
            "group connected platform={} group={} space={} by={}",
            ctx.platform, group_id, space_id, ctx.caller_id
        );

        let linked = self.link_children(ctx.platform, kind, &group_id, &space_id).await;
        Ok(match linked {
            0 => format!("Connected to space {space_id}."),
            1 => format!("Connected to space {space_id}. Linked 1 existing conversation."),
            n => format!("Connected to space {space_id}. Linked {n} existing conversations."),
        })
    }

    async fn resolve_group(&self, platform: Platform, alias: &str) -> Result<String, BridgeError> {
        let Some(directory) = self.directories.get(&platform) else {
            return Ok(alias.to_string());
        };
        directory.resolve_group(alias).await.map_err(|err| {
            debug!("group alias resolution failed alias={} error={}", alias, err);
            BridgeError::NotMapped(format!("Could not resolve {alias}."))
        })
    }

    /// Pairs existing child conversations with space threads of the same name.
    async fn link_children(
        &self,
        platform: Platform,
        kind: MappingKind,
        group_id: &str,
        space_id: &str,
    ) -> usize {
        let (Some(child_kind), Some(directory)) = (kind.child_kind(), self.directories.get(&platform))
        else {
            return 0;
        };
        let children = match directory.child_conversations(group_id).await {
            Ok(children) if !children.is_empty() => children,
            Ok(_) => return 0,
            Err(err) => {
                warn!("listing child conversations failed group={} error={}", group_id, err);
                return 0;
            }
        };
        let threads = match self.space.list_threads(space_id).await {
            Ok(threads) => threads,
            Err(err) => {
                warn!("listing space threads failed space={} error={}", space_id, err);
                return 0;
            }
        };

        let store = self.db.mapping_store(child_kind);
        let mut linked = 0;
        for child in children {
            let Some(thread) = threads.iter().find(|thread| thread.name == child.name) else {
                continue;
            };
            match store.register(&child.id, &thread.id, Some(space_id)).await {
                Ok(()) => linked += 1,
                Err(DatabaseError::AlreadyRegistered(key)) => {
                    debug!("child already linked key={}", key);
                }
                Err(err) => warn!("linking child failed child={} error={}", child.id, err),
            }
        }
        linked
    }

    async fn disconnect(&self, ctx: &CallerContext) -> Result<String, BridgeError> {
        let kind = self.require_admin(ctx, "disconnect")?;
        let groups = self.db.mapping_store(kind);
        let Some(space_id) = groups.lookup_by_a(&ctx.group_id).await? else {
            return Err(BridgeError::NotMapped(format!(
                "This {} is not connected to a space.",
                ctx.group_noun()
            )));
        };

        groups.unregister(&ctx.group_id, &space_id).await?;

        if let Some(child_kind) = kind.child_kind() {
            let children = self.db.mapping_store(child_kind);
            for thread_id in children.list_children(&space_id).await? {
                let Some(conversation_id) = children.lookup_by_b(&thread_id).await? else {
                    continue;
                };
                match children.unregister(&conversation_id, &thread_id).await {
                    Ok(()) | Err(DatabaseError::NotRegistered(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        info!(
            "group disconnected platform={} group={} space={} by={}",
            ctx.platform, ctx.group_id, space_id, ctx.caller_id
        );
        Ok(format!("Disconnected from space {space_id}."))
    }

    async fn status(&self, ctx: &CallerContext) -> Result<String, BridgeError> {
        let Some(kind) = ctx.group_kind() else {
            return Ok("Commands are not available here.".to_string());
        };
        Ok(match self.db.mapping_store(kind).lookup_by_a(&ctx.group_id).await? {
            Some(space_id) => format!("This {} is connected to space {space_id}.", ctx.group_noun()),
            None => format!("This {} is not connected to any space.", ctx.group_noun()),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    use super::*;
    use crate::bridge::platform::{ConversationRef, HistoryPage, OutboundMessage};
    use crate::db::manager::tests::sqlite_manager;

    #[derive(Default)]
    pub(crate) struct FakeSpace {
        pub(crate) spaces: Vec<String>,
        pub(crate) writable: Vec<String>,
        pub(crate) threads: Vec<ConversationRef>,
        pub(crate) posted: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl DataSpace for FakeSpace {
        fn account_id(&self) -> &str {
            "co_zBridge"
        }

        async fn resolve_space(&self, id_or_alias: &str) -> Result<Option<String>> {
            let id = id_or_alias.trim_start_matches('#');
            Ok(self.spaces.iter().find(|s| s.as_str() == id).cloned())
        }

        async fn has_write_grant(&self, space_id: &str) -> Result<bool> {
            Ok(self.writable.iter().any(|s| s == space_id))
        }

        async fn list_threads(&self, _space_id: &str) -> Result<Vec<ConversationRef>> {
            Ok(self.threads.clone())
        }

        async fn create_thread(&self, _space_id: &str, name: &str) -> Result<String> {
            Ok(format!("thread-{name}"))
        }

        async fn post_message(&self, message: &OutboundMessage) -> Result<String> {
            let mut posted = self.posted.lock();
            posted.push(message.clone());
            Ok(format!("s{}", posted.len()))
        }

        async fn messages_after(
            &self,
            _thread_id: &str,
            _cursor: Option<&str>,
            _limit: usize,
        ) -> Result<HistoryPage> {
            Ok(HistoryPage::default())
        }

        async fn latest_cursor(&self, _thread_id: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct FakeDirectory {
        rooms: Vec<ConversationRef>,
    }

    #[async_trait]
    impl GroupDirectory for FakeDirectory {
        async fn resolve_group(&self, alias_or_id: &str) -> Result<String> {
            match alias_or_id {
                "#team:example.org" => Ok("!team:example.org".to_string()),
                id if id.starts_with('!') => Ok(id.to_string()),
                _ => anyhow::bail!("unknown alias"),
            }
        }

        async fn child_conversations(&self, _group_id: &str) -> Result<Vec<ConversationRef>> {
            Ok(self.rooms.clone())
        }
    }

    fn discord_admin() -> CallerContext {
        CallerContext {
            platform: Platform::Discord,
            group_id: "G1".to_string(),
            caller_id: "1001".to_string(),
            is_admin: true,
        }
    }

    fn space_with(ids: &[&str]) -> Arc<FakeSpace> {
        Arc::new(FakeSpace {
            spaces: ids.iter().map(|s| s.to_string()).collect(),
            writable: ids.iter().map(|s| s.to_string()).collect(),
            ..FakeSpace::default()
        })
    }

    async fn processor(file: &NamedTempFile, space: Arc<FakeSpace>) -> (Arc<DatabaseManager>, CommandProcessor) {
        let db = Arc::new(sqlite_manager(file).await);
        let processor = CommandProcessor::new(db.clone(), space, HashMap::new(), "!");
        (db, processor)
    }

    #[test_case("!connect S1", Some(Command::Connect { group: None, space: "S1".into() }) ; "one argument")]
    #[test_case("!connect #team:example.org S1", Some(Command::Connect { group: Some("#team:example.org".into()), space: "S1".into() }) ; "explicit group")]
    #[test_case("  !status", Some(Command::Status) ; "leading whitespace")]
    #[test_case("!disconnect", Some(Command::Disconnect) ; "disconnect")]
    #[test_case("!connect", None ; "missing argument")]
    #[test_case("!connect a b c", None ; "too many arguments")]
    #[test_case("!status now", None ; "unexpected argument")]
    #[test_case("!bridge S1", None ; "unknown command")]
    #[test_case("connect S1", None ; "missing sigil")]
    #[test_case("!", None ; "bare sigil")]
    fn parses_against_the_registry(text: &str, expected: Option<Command>) {
        assert_eq!(Command::parse("!", text), expected);
    }

    #[tokio::test]
    async fn connect_registers_and_status_reports_it() {
        let file = NamedTempFile::new().expect("temp db");
        let (db, processor) = processor(&file, space_with(&["S1"])).await;
        let ctx = discord_admin();

        let reply = processor
            .execute(&Command::Connect { group: None, space: "S1".into() }, &ctx)
            .await
            .reply;
        assert_eq!(reply, "Connected to space S1.");
        assert_eq!(
            db.mapping_store(MappingKind::GuildSpace)
                .lookup_by_b("S1")
                .await
                .expect("lookup")
                .as_deref(),
            Some("G1")
        );

        let status = processor.execute(&Command::Status, &ctx).await.reply;
        assert_eq!(status, "This server is connected to space S1.");
    }

    #[tokio::test]
    async fn unknown_space_is_reported() {
        let file = NamedTempFile::new().expect("temp db");
        let (db, processor) = processor(&file, space_with(&["S1"])).await;

        let reply = processor
            .execute(&Command::Connect { group: None, space: "S9".into() }, &discord_admin())
            .await
            .reply;

        assert_eq!(reply, "Could not find a space with that ID.");
        assert!(
            db.mapping_store(MappingKind::GuildSpace)
                .list_entries()
                .await
                .expect("entries")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn non_admins_cannot_connect() {
        let file = NamedTempFile::new().expect("temp db");
        let (db, processor) = processor(&file, space_with(&["S1"])).await;
        let ctx = CallerContext {
            is_admin: false,
            ..discord_admin()
        };

        let outcome = processor
            .execute(&Command::Connect { group: None, space: "S1".into() }, &ctx)
            .await;

        assert!(outcome.reply.contains("administrator"));
        assert_eq!(outcome.resolution, Resolution::PermissionDenied);
        assert!(
            db.mapping_store(MappingKind::GuildSpace)
                .lookup_by_a("G1")
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn missing_write_grant_names_the_bridge_account() {
        let file = NamedTempFile::new().expect("temp db");
        let space = Arc::new(FakeSpace {
            spaces: vec!["S1".to_string()],
            ..FakeSpace::default()
        });
        let (db, processor) = processor(&file, space).await;

        let reply = processor
            .execute(&Command::Connect { group: None, space: "S1".into() }, &discord_admin())
            .await
            .reply;

        assert!(reply.contains("co_zBridge"));
        assert!(
            db.mapping_store(MappingKind::GuildSpace)
                .lookup_by_a("G1")
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn connect_refuses_to_overwrite_an_existing_mapping() {
        let file = NamedTempFile::new().expect("temp db");
        let (db, processor) = processor(&file, space_with(&["S1", "S2"])).await;
        let ctx = discord_admin();
        processor
            .execute(&Command::Connect { group: None, space: "S1".into() }, &ctx)
            .await;

        let again = processor
            .execute(&Command::Connect { group: None, space: "S2".into() }, &ctx)
            .await;
        let other_guild = processor
            .execute(
                &Command::Connect { group: None, space: "S1".into() },
                &CallerContext {
                    group_id: "G2".to_string(),
                    ..discord_admin()
                },
            )
            .await;

        assert!(again.reply.contains("already connected"));
        assert_eq!(again.resolution, Resolution::AlreadyMapped);
        assert!(other_guild.reply.contains("already connected to another server"));
        assert_eq!(other_guild.resolution, Resolution::AlreadyMapped);
        assert_eq!(
            db.mapping_store(MappingKind::GuildSpace)
                .lookup_by_a("G1")
                .await
                .expect("lookup")
                .as_deref(),
            Some("S1")
        );
    }

    #[tokio::test]
    async fn disconnect_removes_the_group_and_its_children() {
        let file = NamedTempFile::new().expect("temp db");
        let (db, processor) = processor(&file, space_with(&["S1"])).await;
        let ctx = discord_admin();
        processor
            .execute(&Command::Connect { group: None, space: "S1".into() }, &ctx)
            .await;
        db.mapping_store(MappingKind::ChannelThread)
            .register("C1", "T1", Some("S1"))
            .await
            .expect("register channel");

        let reply = processor.execute(&Command::Disconnect, &ctx).await.reply;

        assert_eq!(reply, "Disconnected from space S1.");
        assert!(
            db.mapping_store(MappingKind::GuildSpace)
                .lookup_by_a("G1")
                .await
                .expect("lookup")
                .is_none()
        );
        assert!(
            db.mapping_store(MappingKind::ChannelThread)
                .lookup_by_a("C1")
                .await
                .expect("lookup")
                .is_none()
        );
        assert_eq!(
            processor.execute(&Command::Status, &ctx).await.reply,
            "This server is not connected to any space."
        );
    }

    #[tokio::test]
    async fn matrix_connect_resolves_aliases_and_links_rooms_by_name() {
        let file = NamedTempFile::new().expect("temp db");
        let db = Arc::new(sqlite_manager(&file).await);
        let space = Arc::new(FakeSpace {
            spaces: vec!["S1".to_string()],
            writable: vec!["S1".to_string()],
            threads: vec![ConversationRef {
                id: "T-general".to_string(),
                name: "general".to_string(),
                group_id: Some("S1".to_string()),
            }],
            ..FakeSpace::default()
        });
        let mut directories: HashMap<Platform, Arc<dyn GroupDirectory>> = HashMap::new();
        directories.insert(
            Platform::Matrix,
            Arc::new(FakeDirectory {
                rooms: vec![
                    ConversationRef {
                        id: "!general:example.org".to_string(),
                        name: "general".to_string(),
                        group_id: None,
                    },
                    ConversationRef {
                        id: "!random:example.org".to_string(),
                        name: "random".to_string(),
                        group_id: None,
                    },
                ],
            }),
        );
        let processor = CommandProcessor::new(db.clone(), space, directories, "!");
        let ctx = CallerContext {
            platform: Platform::Matrix,
            group_id: "!admin:example.org".to_string(),
            caller_id: "@alice:example.org".to_string(),
            is_admin: true,
        };

        let command = processor.parse("!connect #team:example.org S1").expect("command");
        let reply = processor.execute(&command, &ctx).await.reply;

        assert_eq!(reply, "Connected to space S1. Linked 1 existing conversation.");
        assert_eq!(
            db.mapping_store(MappingKind::MatrixSpace)
                .lookup_by_a("!team:example.org")
                .await
                .expect("lookup")
                .as_deref(),
            Some("S1")
        );
        assert_eq!(
            db.mapping_store(MappingKind::RoomThread)
                .lookup_by_b("T-general")
                .await
                .expect("lookup")
                .as_deref(),
            Some("!general:example.org")
        );
    }
}
