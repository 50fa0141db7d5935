use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use once_cell::sync::OnceCell;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::{DatabaseManager, MappingKind};
use crate::space::{DataSpace, SpaceAdapter};

pub mod backfill;
pub mod commands;
pub mod error;
pub mod platform;
pub mod request;
pub mod router;
pub mod watermark;

use self::backfill::BackfillEngine;
use self::commands::{CallerContext, Command, CommandProcessor};
use self::platform::{GroupDirectory, HistorySource, InboundEvent, MessageSink, Platform};
use self::request::{BridgeRequest, IgnoreReason, RequestStats, RequestTracker, Resolution};
use self::router::{EventRouter, IdentityPatterns, Link};

/// Platform adapters handed to [`BridgeCore::new`].
#[derive(Default)]
pub struct PlatformHandles {
    pub sinks: Vec<Arc<dyn MessageSink>>,
    pub sources: HashMap<Platform, Arc<dyn HistorySource>>,
    pub directories: HashMap<Platform, Arc<dyn GroupDirectory>>,
    pub identities: IdentityPatterns,
}

/// The synchronization service. Built once at startup and shared by the adapters and the web layer.
pub struct BridgeCore {
    db: Arc<DatabaseManager>,
    space: Arc<dyn DataSpace>,
    router: Arc<EventRouter>,
    backfill: BackfillEngine,
    commands: CommandProcessor,
    tracker: RequestTracker,
    sync: SyncConfig,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    identity: OnceCell<String>,
    started_at: Instant,
}

/// Counts one unit of inbound work until dropped.
struct WorkGuard<'a>(&'a BridgeCore);

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl BridgeCore {
    pub fn new(
        db: Arc<DatabaseManager>,
        space: Arc<dyn DataSpace>,
        handles: PlatformHandles,
        sync: &SyncConfig,
    ) -> Self {
        let PlatformHandles {
            mut sinks,
            mut sources,
            directories,
            identities,
        } = handles;
        let adapter = Arc::new(SpaceAdapter::new(space.clone()));
        sinks.push(adapter.clone());
        sources.insert(Platform::Space, adapter);

        let router = Arc::new(EventRouter::new(db.clone(), sinks, identities));
        let backfill = BackfillEngine::new(
            router.clone(),
            db.cursor_store(),
            sources,
            sync.page_size,
        );
        let commands = CommandProcessor::new(
            db.clone(),
            space.clone(),
            directories,
            sync.command_sigil.clone(),
        );
        let tracker = RequestTracker::new(
            Duration::from_millis(sync.delay_threshold_ms),
            Duration::from_millis(sync.dead_threshold_ms),
        );

        Self {
            db,
            space,
            router,
            backfill,
            commands,
            tracker,
            sync: sync.clone(),
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            identity: OnceCell::new(),
            started_at: Instant::now(),
        }
    }

    pub fn db(&self) -> Arc<DatabaseManager> {
        self.db.clone()
    }

    pub fn space_account_id(&self) -> &str {
        self.space.account_id()
    }

    /// First caller wins; later calls are ignored.
    pub fn set_identity(&self, identity: impl Into<String>) {
        let identity = identity.into();
        if self.identity.set(identity.clone()).is_ok() {
            info!("bridge identity initialized identity={}", identity);
        }
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    pub fn stats(&self) -> RequestStats {
        self.tracker.stats()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stops accepting inbound events and commands. Work already started runs to completion.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("bridge stopped accepting events");
        }
    }

    fn begin_work(&self) -> WorkGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        WorkGuard(self)
    }

    /// Waits up to `limit` for started work to finish. Returns `false` if work was still running.
    pub async fn drain(&self, limit: Duration) -> bool {
        let settled = async {
            loop {
                let idle = self.idle.notified();
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(limit, settled).await.is_ok()
    }

    pub fn command_sigil(&self) -> &str {
        self.commands.sigil()
    }

    /// Entry point for live platform messages.
    pub async fn handle_event(&self, event: InboundEvent) -> Resolution {
        let Some(link) = Link::inbound_from(event.platform) else {
            debug!("ignoring live event from {}", event.platform);
            return Resolution::Ignored(IgnoreReason::NotMapped);
        };
        let request = BridgeRequest::event(link.name());
        if !self.is_accepting() {
            let resolution = Resolution::Ignored(IgnoreReason::Dropped);
            self.tracker
                .on_resolved(&request, &resolution, Duration::ZERO);
            return resolution;
        }

        let _work = self.begin_work();
        self.tracker
            .track(&request, async {
                match self.router.route(link, event).await {
                    Ok(outcome) => Resolution::from(&outcome),
                    Err(err) => Resolution::Failed(err.to_string()),
                }
            })
            .await
    }

    /// Parses `text` as an in-band command. `None` when it is not a valid command.
    pub async fn handle_command_text(&self, text: &str, ctx: &CallerContext) -> Option<String> {
        let command = self.commands.parse(text)?;
        self.handle_command(&command, ctx).await
    }

    pub async fn handle_command(&self, command: &Command, ctx: &CallerContext) -> Option<String> {
        let request = BridgeRequest::command(ctx.platform.as_str());
        if !self.is_accepting() {
            self.tracker.on_resolved(
                &request,
                &Resolution::Ignored(IgnoreReason::Dropped),
                Duration::ZERO,
            );
            return None;
        }

        let _work = self.begin_work();
        let mut reply = None;
        self.tracker
            .track(&request, async {
                let outcome = self.commands.execute(command, ctx).await;
                reply = Some(outcome.reply);
                outcome.resolution
            })
            .await;
        reply
    }

    /// Backfills every known conversation of `platform` into the space.
    pub async fn catch_up(&self, platform: Platform) -> Result<usize> {
        let Some(link) = Link::inbound_from(platform) else {
            return Ok(0);
        };
        let _work = self.begin_work();
        let mut conversations: Vec<String> = self
            .db
            .mapping_store(link.mapping_kind())
            .list_entries()
            .await?
            .into_iter()
            .map(|entry| entry.key_a)
            .collect();

        if platform == Platform::Discord {
            if let Some(source) = self.backfill.source(Platform::Discord) {
                let mut known: HashSet<String> = conversations.iter().cloned().collect();
                let guilds = self
                    .db
                    .mapping_store(MappingKind::GuildSpace)
                    .list_entries()
                    .await?;
                for guild in guilds {
                    match source.discover_conversations(&guild.key_a).await {
                        Ok(channels) => {
                            for channel in channels {
                                if known.insert(channel.id.clone()) {
                                    conversations.push(channel.id);
                                }
                            }
                        }
                        Err(err) => warn!(
                            "listing guild channels failed guild={} error={}",
                            guild.key_a, err
                        ),
                    }
                }
            }
        }

        info!(
            "catch-up starting platform={} conversations={}",
            platform,
            conversations.len()
        );
        let mirrored = self
            .backfill
            .backfill_all(conversations.into_iter().map(|id| (link, id)).collect())
            .await;
        info!("catch-up finished platform={} mirrored={}", platform, mirrored);
        Ok(mirrored)
    }

    /// One ingestion pass over every mapped space thread, for each configured outbound link.
    pub async fn poll_space(&self) -> Result<usize> {
        let _work = self.begin_work();
        let mut conversations = Vec::new();
        for link in [Link::SpaceToDiscord, Link::SpaceToMatrix] {
            if !self.router.has_sink(link.target()) {
                continue;
            }
            for entry in self
                .db
                .mapping_store(link.mapping_kind())
                .list_entries()
                .await?
            {
                conversations.push((link, entry.key_b));
            }
        }
        if conversations.is_empty() {
            return Ok(0);
        }
        Ok(self.backfill.backfill_all(conversations).await)
    }

    /// Startup catch-up for Matrix followed by the space polling loop, until [`Self::shutdown`].
    pub async fn start(&self) -> Result<()> {
        info!("bridge core started");
        if self.sync.backfill_on_start && self.backfill.source(Platform::Matrix).is_some() {
            if let Err(err) = self.catch_up(Platform::Matrix).await {
                warn!("matrix catch-up failed error={}", err);
            }
        }

        let period = Duration::from_secs(self.sync.space_poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        while self.is_accepting() {
            ticker.tick().await;
            if !self.is_accepting() {
                break;
            }
            match self.poll_space().await {
                Ok(0) => debug!("space poll idle"),
                Ok(mirrored) => debug!("space poll mirrored={}", mirrored),
                Err(err) => warn!("space poll failed error={}", err),
            }
        }
        info!("bridge core stopped");
        Ok(())
    }

    pub fn backfill_on_start(&self) -> bool {
        self.sync.backfill_on_start
    }
}
