use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use serenity::all::{
    ChannelId, ChannelType, Client as SerenityClient, Command as SlashCommand, CommandInteraction,
    CommandOptionType, Context as SerenityContext, CreateCommand, CreateCommandOption,
    CreateWebhook, EditInteractionResponse, EventHandler as SerenityEventHandler, ExecuteWebhook,
    GatewayIntents, GetMessages, GuildId, Http, Interaction, Message as SerenityMessage, MessageId,
    Permissions, Ready, Webhook,
};
use tokio::sync::{Mutex as AsyncMutex, RwLock, oneshot};
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeCore;
use crate::bridge::commands::{CallerContext, Command};
use crate::bridge::platform::{
    ConversationRef, HistoryPage, HistorySource, InboundEvent, MessageSink, OutboundMessage,
    Platform,
};
use crate::config::DiscordConfig;

const INITIAL_LOGIN_RETRY_SECONDS: u64 = 2;
const MAX_LOGIN_RETRY_SECONDS: u64 = 300;
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;
const MAX_WEBHOOK_USERNAME_CHARS: usize = 80;
/// Author id prefix for messages posted through the bridge's own webhooks.
pub const WEBHOOK_AUTHOR_PREFIX: &str = "webhook:";

const CONNECT_COMMAND: &str = "connect-space";
const DISCONNECT_COMMAND: &str = "disconnect-space";
const STATUS_COMMAND: &str = "space-status";

type BridgeSlot = Arc<RwLock<Option<Arc<BridgeCore>>>>;

/// Creation time embedded in a Discord snowflake.
pub fn snowflake_millis(id: u64) -> i64 {
    ((id >> 22) + DISCORD_EPOCH_MS) as i64
}

pub fn identity_pattern() -> Result<Regex> {
    Regex::new(&format!("^{}", regex::escape(WEBHOOK_AUTHOR_PREFIX)))
        .map_err(|e| anyhow!("invalid discord identity pattern: {e}"))
}

fn webhook_username(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    trimmed.chars().take(MAX_WEBHOOK_USERNAME_CHARS).collect()
}

fn is_guild_admin(permissions: Option<Permissions>) -> bool {
    permissions.is_some_and(|p| p.administrator() || p.manage_guild())
}

fn slash_command(name: &str, space: Option<&str>) -> Option<Command> {
    match (name, space) {
        (CONNECT_COMMAND, Some(space)) => Command::from_parts("connect", &[space.to_string()]),
        (DISCONNECT_COMMAND, _) => Command::from_parts("disconnect", &[]),
        (STATUS_COMMAND, _) => Command::from_parts("status", &[]),
        _ => None,
    }
}

fn slash_command_definitions() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new(CONNECT_COMMAND)
            .description("Connect this server to a space")
            .default_member_permissions(Permissions::MANAGE_GUILD)
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "space", "Space ID or alias")
                    .required(true),
            ),
        CreateCommand::new(DISCONNECT_COMMAND)
            .description("Disconnect this server from its space")
            .default_member_permissions(Permissions::MANAGE_GUILD),
        CreateCommand::new(STATUS_COMMAND).description("Show which space this server is connected to"),
    ]
}

/// Maps a gateway or REST message into a router event. `None` for foreign bot traffic.
fn inbound_event(
    msg: &SerenityMessage,
    guild_id: Option<GuildId>,
    channel_name: Option<String>,
    our_webhooks: &HashSet<u64>,
) -> Option<InboundEvent> {
    let author_id = match msg.webhook_id {
        Some(webhook_id) if our_webhooks.contains(&webhook_id.get()) => {
            format!("{WEBHOOK_AUTHOR_PREFIX}{webhook_id}")
        }
        _ if msg.author.bot => return None,
        _ => msg.author.id.to_string(),
    };
    Some(InboundEvent {
        platform: Platform::Discord,
        conversation_id: msg.channel_id.to_string(),
        conversation_name: channel_name,
        group_id: msg.guild_id.or(guild_id).map(|id| id.to_string()),
        message_id: msg.id.to_string(),
        author_id,
        author_name: msg
            .author
            .global_name
            .clone()
            .unwrap_or_else(|| msg.author.name.clone()),
        avatar_url: msg.author.avatar_url(),
        content: msg.content.clone(),
        timestamp_ms: snowflake_millis(msg.id.get()),
        provenance: None,
    })
}

struct DiscordHandler {
    ready_sender: AsyncMutex<Option<oneshot::Sender<()>>>,
    http_sender: AsyncMutex<Option<oneshot::Sender<Arc<Http>>>>,
    bridge: BridgeSlot,
    our_webhook_ids: Arc<RwLock<HashSet<u64>>>,
}

#[serenity::async_trait]
impl SerenityEventHandler for DiscordHandler {
    async fn ready(&self, ctx: SerenityContext, ready: Ready) {
        info!(
            "discord gateway ready as {} ({}) application={}",
            ready.user.name, ready.user.id, ready.application.id
        );

        match SlashCommand::set_global_commands(&ctx.http, slash_command_definitions()).await {
            Ok(commands) => debug!("registered discord slash commands count={}", commands.len()),
            Err(err) => error!("failed to register discord slash commands: {err}"),
        }

        if let Some(sender) = self.ready_sender.lock().await.take() {
            let _ = sender.send(());
        }
        if let Some(sender) = self.http_sender.lock().await.take() {
            let _ = sender.send(ctx.http.clone());
        }

        let Some(bridge) = self.bridge.read().await.clone() else {
            return;
        };
        bridge.set_identity(ready.application.id.to_string());
        if bridge.backfill_on_start() {
            tokio::spawn(async move {
                if let Err(err) = bridge.catch_up(Platform::Discord).await {
                    error!("discord catch-up failed: {err}");
                }
            });
        }
    }

    async fn message(&self, ctx: SerenityContext, msg: SerenityMessage) {
        let event = {
            let our_ids = self.our_webhook_ids.read().await;
            inbound_event(&msg, None, None, &our_ids)
        };
        let Some(mut event) = event else {
            return;
        };

        let Some(bridge) = self.bridge.read().await.clone() else {
            debug!("ignoring discord message before bridge binding");
            return;
        };

        event.conversation_name = msg.channel_id.name(&ctx).await.ok();
        let resolution = bridge.handle_event(event).await;
        debug!(
            "discord message handled message_id={} status={}",
            msg.id, resolution
        );
    }

    async fn interaction_create(&self, ctx: SerenityContext, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };
        let Some(bridge) = self.bridge.read().await.clone() else {
            return;
        };
        if let Err(err) = handle_slash_command(&ctx, &bridge, &command).await {
            error!("failed to answer discord slash command name={} error={err}", command.data.name);
        }
    }
}

async fn handle_slash_command(
    ctx: &SerenityContext,
    bridge: &BridgeCore,
    interaction: &CommandInteraction,
) -> Result<()> {
    let space = interaction
        .data
        .options
        .iter()
        .find(|option| option.name == "space")
        .and_then(|option| option.value.as_str());
    let Some(command) = slash_command(&interaction.data.name, space) else {
        debug!("ignoring unknown slash command name={}", interaction.data.name);
        return Ok(());
    };

    interaction
        .defer_ephemeral(ctx)
        .await
        .map_err(|e| anyhow!("failed to defer interaction: {e}"))?;

    let reply = match interaction.guild_id {
        None => "Use this command inside a server.".to_string(),
        Some(guild_id) => {
            let caller = CallerContext {
                platform: Platform::Discord,
                group_id: guild_id.to_string(),
                caller_id: interaction.user.id.to_string(),
                is_admin: is_guild_admin(
                    interaction.member.as_ref().and_then(|member| member.permissions),
                ),
            };
            bridge
                .handle_command(&command, &caller)
                .await
                .unwrap_or_else(|| "The bridge is shutting down, try again shortly.".to_string())
        }
    };

    interaction
        .edit_response(ctx, EditInteractionResponse::new().content(reply))
        .await
        .map_err(|e| anyhow!("failed to reply to interaction: {e}"))?;
    Ok(())
}

#[derive(Default)]
struct DiscordLoginState {
    is_logged_in: bool,
    gateway_task: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Clone)]
pub struct DiscordClient {
    config: DiscordConfig,
    send_lock: Arc<AsyncMutex<()>>,
    login_state: Arc<AsyncMutex<DiscordLoginState>>,
    bridge: BridgeSlot,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    webhook_cache: Arc<RwLock<HashMap<u64, Webhook>>>,
    our_webhook_ids: Arc<RwLock<HashSet<u64>>>,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig) -> Self {
        info!("initializing discord client");
        Self {
            config,
            send_lock: Arc::new(AsyncMutex::new(())),
            login_state: Arc::new(AsyncMutex::new(DiscordLoginState::default())),
            bridge: Arc::new(RwLock::new(None)),
            http: Arc::new(RwLock::new(None)),
            webhook_cache: Arc::new(RwLock::new(HashMap::new())),
            our_webhook_ids: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub async fn set_bridge(&self, bridge: Arc<BridgeCore>) {
        *self.bridge.write().await = Some(bridge);
    }

    pub async fn login(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if state.is_logged_in {
            return Ok(());
        }

        let intents = if self.config.use_privileged_intents {
            GatewayIntents::all()
        } else {
            GatewayIntents::non_privileged()
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let (http_tx, http_rx) = oneshot::channel();
        let handler = DiscordHandler {
            ready_sender: AsyncMutex::new(Some(ready_tx)),
            http_sender: AsyncMutex::new(Some(http_tx)),
            bridge: self.bridge.clone(),
            our_webhook_ids: self.our_webhook_ids.clone(),
        };

        let mut gateway_client = SerenityClient::builder(&self.config.bot_token, intents)
            .event_handler(handler)
            .await
            .map_err(|err| anyhow!("failed to build discord gateway client: {err}"))?;

        let gateway_task = tokio::spawn(async move {
            if let Err(err) = gateway_client.start_autosharded().await {
                error!("discord gateway stopped: {err}");
            }
        });

        match tokio::time::timeout(Duration::from_secs(30), ready_rx).await {
            Ok(Ok(())) => {
                state.is_logged_in = true;
                state.gateway_task = Some(gateway_task);
                if let Ok(Ok(http)) = tokio::time::timeout(Duration::from_secs(5), http_rx).await {
                    *self.http.write().await = Some(http);
                }
                info!("discord bot login succeeded and gateway is connected");
                Ok(())
            }
            Ok(Err(_)) => {
                gateway_task.abort();
                Err(anyhow!("discord gateway exited before receiving Ready event"))
            }
            Err(_) => {
                gateway_task.abort();
                Err(anyhow!("timed out waiting for discord Ready event"))
            }
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut retry_seconds = INITIAL_LOGIN_RETRY_SECONDS;
        loop {
            match self.login().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    error!(
                        "failed to start discord client: {err}. retrying in {} seconds",
                        retry_seconds
                    );
                    tokio::time::sleep(Duration::from_secs(retry_seconds)).await;
                    retry_seconds = (retry_seconds * 2).min(MAX_LOGIN_RETRY_SECONDS);
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if !state.is_logged_in {
            return Ok(());
        }
        if let Some(gateway_task) = state.gateway_task.take() {
            gateway_task.abort();
            match gateway_task.await {
                Ok(()) => info!("discord gateway task exited"),
                Err(join_err) if join_err.is_cancelled() => info!("discord gateway task aborted"),
                Err(join_err) => error!("discord gateway task join error: {join_err}"),
            }
        }
        state.is_logged_in = false;
        info!("discord client stopped");
        Ok(())
    }

    async fn http(&self) -> Result<Arc<Http>> {
        self.http
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("discord http client not available"))
    }

    async fn get_or_create_webhook(&self, http: &Http, channel_id: u64) -> Result<Webhook> {
        if let Some(webhook) = self.webhook_cache.read().await.get(&channel_id) {
            return Ok(webhook.clone());
        }

        let channel = ChannelId::new(channel_id);
        let webhooks = channel
            .webhooks(http)
            .await
            .map_err(|e| anyhow!("failed to fetch webhooks: {}", e))?;

        let webhook_name = &self.config.webhook_name;
        let webhook = match webhooks
            .into_iter()
            .find(|w| w.name.as_deref() == Some(webhook_name.as_str()) && w.token.is_some())
        {
            Some(existing) => existing,
            None => channel
                .create_webhook(http, CreateWebhook::new(webhook_name))
                .await
                .map_err(|e| anyhow!("failed to create webhook: {}", e))?,
        };

        self.our_webhook_ids.write().await.insert(webhook.id.get());
        debug!("recorded our webhook id={} for channel={}", webhook.id, channel_id);
        self.webhook_cache
            .write()
            .await
            .insert(channel_id, webhook.clone());
        Ok(webhook)
    }

    async fn channel_context(&self, http: &Http, channel_id: ChannelId) -> (Option<GuildId>, Option<String>) {
        match channel_id.to_channel(http).await {
            Ok(channel) => match channel.guild() {
                Some(guild_channel) => (Some(guild_channel.guild_id), Some(guild_channel.name)),
                None => (None, None),
            },
            Err(err) => {
                warn!("failed to load discord channel channel={} error={}", channel_id, err);
                (None, None)
            }
        }
    }
}

#[async_trait]
impl MessageSink for DiscordClient {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String> {
        let _guard = self.send_lock.lock().await;
        if self.config.send_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.send_delay_ms)).await;
        }

        let http = self.http().await?;
        let channel_id: u64 = message
            .conversation_id
            .parse()
            .map_err(|_| anyhow!("invalid channel id: {}", message.conversation_id))?;
        let webhook = self.get_or_create_webhook(&http, channel_id).await?;

        let mut builder = ExecuteWebhook::new()
            .content(&message.content)
            .username(webhook_username(&message.author_name));
        if let Some(avatar) = message.avatar_url.as_deref() {
            builder = builder.avatar_url(avatar);
        }

        let sent = webhook
            .execute(&*http, true, builder)
            .await
            .map_err(|e| anyhow!("webhook send failed: {}", e))?
            .ok_or_else(|| anyhow!("webhook execution returned no message"))?;

        debug!(
            "sent message via webhook channel={} message_id={} mirror_id={}",
            channel_id, sent.id, message.provenance.mirror_id
        );
        Ok(sent.id.to_string())
    }
}

#[async_trait]
impl HistorySource for DiscordClient {
    async fn fetch_after(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let http = self.http().await?;
        let channel = ChannelId::new(
            conversation_id
                .parse()
                .map_err(|_| anyhow!("invalid channel id: {}", conversation_id))?,
        );
        // Snowflakes are non-zero; 1 precedes every real message.
        let after = match cursor {
            Some(cursor) => cursor
                .parse::<u64>()
                .map_err(|_| anyhow!("invalid discord cursor: {}", cursor))?
                .max(1),
            None => 1,
        };

        let limit = limit.clamp(1, 100) as u8;
        let mut messages = channel
            .messages(&*http, GetMessages::new().after(MessageId::new(after)).limit(limit))
            .await
            .map_err(|e| anyhow!("failed to fetch discord history: {}", e))?;
        messages.sort_by_key(|msg| msg.id);

        let fetched = messages.len();
        let next_cursor = messages.last().map(|msg| msg.id.to_string());
        let (guild_id, channel_name) = self.channel_context(&http, channel).await;
        let our_ids = self.our_webhook_ids.read().await;
        let events = messages
            .iter()
            .filter_map(|msg| inbound_event(msg, guild_id, channel_name.clone(), &our_ids))
            .collect();

        Ok(HistoryPage {
            events,
            next_cursor,
            fetched,
        })
    }

    async fn discover_conversations(&self, group_id: &str) -> Result<Vec<ConversationRef>> {
        let http = self.http().await?;
        let guild = GuildId::new(
            group_id
                .parse()
                .map_err(|_| anyhow!("invalid guild id: {}", group_id))?,
        );
        let channels = guild
            .channels(&*http)
            .await
            .map_err(|e| anyhow!("failed to list guild channels: {}", e))?;
        Ok(channels
            .into_values()
            .filter(|channel| channel.kind == ChannelType::Text)
            .map(|channel| ConversationRef {
                id: channel.id.to_string(),
                name: channel.name,
                group_id: Some(group_id.to_string()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn snowflake_timestamp_uses_discord_epoch() {
        // Example id from the Discord developer documentation.
        assert_eq!(snowflake_millis(175_928_847_299_117_063), 1_462_015_105_796);
    }

    #[test]
    fn identity_pattern_matches_only_webhook_authors() {
        let pattern = identity_pattern().expect("pattern");

        assert!(pattern.is_match("webhook:123"));
        assert!(!pattern.is_match("123"));
    }

    #[test_case(CONNECT_COMMAND, Some("co_zSpace"), Some(Command::Connect { group: None, space: "co_zSpace".into() }) ; "connect")]
    #[test_case(CONNECT_COMMAND, None, None ; "connect without space")]
    #[test_case(DISCONNECT_COMMAND, None, Some(Command::Disconnect) ; "disconnect")]
    #[test_case(STATUS_COMMAND, None, Some(Command::Status) ; "status")]
    #[test_case("ping", None, None ; "unknown")]
    fn slash_commands_map_to_bridge_commands(name: &str, space: Option<&str>, expected: Option<Command>) {
        assert_eq!(slash_command(name, space), expected);
    }

    #[test]
    fn admin_requires_manage_guild_or_administrator() {
        assert!(is_guild_admin(Some(Permissions::MANAGE_GUILD)));
        assert!(is_guild_admin(Some(Permissions::ADMINISTRATOR)));
        assert!(!is_guild_admin(Some(Permissions::SEND_MESSAGES)));
        assert!(!is_guild_admin(None));
    }

    #[test]
    fn webhook_usernames_are_trimmed_and_bounded() {
        assert_eq!(webhook_username("  alice "), "alice");
        assert_eq!(webhook_username(""), "unknown");
        assert_eq!(webhook_username(&"x".repeat(120)).chars().count(), 80);
    }
}
