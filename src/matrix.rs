use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use matrix_bot_sdk::{
    appservice::Appservice,
    client::{MatrixAuth, MatrixClient},
};
use parking_lot::Mutex;
use regex::Regex;
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::bridge::platform::{
    ConversationRef, GroupDirectory, HistoryPage, HistorySource, MessageSink, OutboundMessage,
    Platform,
};
use crate::config::MatrixConfig;

pub mod event_handler;

pub use self::event_handler::MatrixEventProcessor;

/// Content key carrying [`crate::bridge::platform::Provenance`] on messages the bridge sends.
pub const PROVENANCE_KEY: &str = "org.space_bridge.provenance";

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    chunk: Vec<Value>,
    #[serde(default)]
    end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    room_id: String,
}

#[derive(Debug)]
struct MatrixCallError {
    path: String,
    status: Option<StatusCode>,
    errcode: Option<String>,
    message: String,
}

impl MatrixCallError {
    fn transport(path: &str, err: reqwest::Error) -> Self {
        Self {
            path: path.to_string(),
            status: None,
            errcode: None,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for MatrixCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.errcode) {
            (Some(status), Some(errcode)) => {
                write!(f, "{} {}: {} {}", self.path, status, errcode, self.message)
            }
            (Some(status), None) => write!(f, "{} {}: {}", self.path, status, self.message),
            (None, _) => write!(f, "{}: {}", self.path, self.message),
        }
    }
}

pub struct MatrixAppservice {
    config: MatrixConfig,
    pub appservice: Appservice,
    http: HttpClient,
    homeserver_url: Url,
    identity: Regex,
    send_lock: AsyncMutex<()>,
    ghost_profiles: Mutex<HashMap<String, String>>,
    joined: Mutex<HashSet<(String, String)>>,
}

/// Matrix localparts only allow `[a-z0-9._=/-]`.
pub fn sanitize_localpart(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '=' | '-' | '/') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn identity_pattern(config: &MatrixConfig) -> Result<Regex> {
    let pattern = format!(
        "^@(?:{}.*|{}):{}$",
        regex::escape(&config.ghost_prefix),
        regex::escape(&config.sender_localpart),
        regex::escape(&config.domain)
    );
    Regex::new(&pattern).map_err(|e| anyhow!("invalid matrix identity pattern: {e}"))
}

pub fn power_level_of(power_levels: &Value, user_id: &str) -> i64 {
    power_levels
        .get("users")
        .and_then(|users| users.get(user_id))
        .and_then(Value::as_i64)
        .unwrap_or_else(|| {
            power_levels
                .get("users_default")
                .and_then(Value::as_i64)
                .unwrap_or(0)
        })
}

impl MatrixAppservice {
    pub fn new(config: MatrixConfig) -> Result<Self> {
        info!("initializing matrix appservice for {}", config.domain);

        let homeserver_url = Url::parse(&config.homeserver_url)?;
        let auth = MatrixAuth::new(&config.appservice_token);
        let client = MatrixClient::new(homeserver_url.clone(), auth);
        let appservice = Appservice::new(&config.homeserver_token, &config.appservice_token, client)
            .with_appservice_id(&config.bridge_id);
        let identity = identity_pattern(&config)?;

        Ok(Self {
            config,
            appservice,
            http: HttpClient::new(),
            homeserver_url,
            identity,
            send_lock: AsyncMutex::new(()),
            ghost_profiles: Mutex::new(HashMap::new()),
            joined: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    pub fn bot_user_id(&self) -> String {
        self.config.bot_user_id()
    }

    pub fn ghost_user_id(&self, origin: Platform, author: &str) -> String {
        self.config
            .ghost_user_id(&sanitize_localpart(&format!("{}_{}", origin, author)))
    }

    /// Ghost users and the bot itself.
    pub fn identity_pattern(&self) -> Regex {
        self.identity.clone()
    }

    pub fn is_bridge_user(&self, user_id: &str) -> bool {
        self.identity.is_match(user_id)
    }

    fn client_api(&self, segments: &[&str], as_user: Option<&str>) -> Result<Url> {
        let mut url = self.homeserver_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("homeserver url cannot be a base"))?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        if let Some(user_id) = as_user {
            url.query_pairs_mut().append_pair("user_id", user_id);
        }
        Ok(url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<Option<T>> {
        let response = self
            .http
            .get(url.clone())
            .bearer_auth(&self.config.appservice_token)
            .send()
            .await
            .map_err(|e| anyhow!("matrix request {} failed: {}", url.path(), e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("matrix request {} failed: {} - {}", url.path(), status, body));
        }
        let value = response
            .json::<T>()
            .await
            .map_err(|e| anyhow!("failed to parse matrix response from {}: {}", url.path(), e))?;
        Ok(Some(value))
    }

    /// Sends `body` with the appservice token. Non-2xx replies come back as `Err` with the Matrix `errcode`.
    async fn call(&self, method: Method, url: Url, body: &Value) -> Result<Value, MatrixCallError> {
        let path = url.path().to_string();
        let response = self
            .http
            .request(method, url)
            .bearer_auth(&self.config.appservice_token)
            .json(body)
            .send()
            .await
            .map_err(|e| MatrixCallError::transport(&path, e))?;
        let status = response.status();
        let value = response.json::<Value>().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(value);
        }
        Err(MatrixCallError {
            path,
            status: Some(status),
            errcode: value
                .get("errcode")
                .and_then(Value::as_str)
                .map(str::to_string),
            message: value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    pub async fn join_room_as(&self, room_id: &str, user_id: &str) -> Result<()> {
        let key = (room_id.to_string(), user_id.to_string());
        if self.joined.lock().contains(&key) {
            return Ok(());
        }
        let url = self.client_api(&["rooms", room_id, "join"], Some(user_id))?;
        self.call(Method::POST, url, &json!({}))
            .await
            .map_err(|e| anyhow!("failed to join {} as {}: {}", room_id, user_id, e))?;
        debug!("joined room room_id={} user_id={}", room_id, user_id);
        self.joined.lock().insert(key);
        Ok(())
    }

    /// Registers the ghost on first use and keeps its display name in sync with the origin author.
    async fn ensure_ghost(&self, user_id: &str, display_name: &str) -> Result<()> {
        let known = self.ghost_profiles.lock().get(user_id).cloned();
        if known.as_deref() == Some(display_name) {
            return Ok(());
        }

        if known.is_none() {
            let localpart = user_id
                .trim_start_matches('@')
                .split(':')
                .next()
                .unwrap_or_default();
            let url = self.client_api(&["register"], None)?;
            let body = json!({
                "type": "m.login.application_service",
                "username": localpart,
            });
            match self.call(Method::POST, url, &body).await {
                Ok(_) => info!("registered ghost user_id={}", user_id),
                Err(err) if err.errcode.as_deref() == Some("M_USER_IN_USE") => {}
                Err(err) => return Err(anyhow!("failed to register {}: {}", user_id, err)),
            }
        }

        let url = self.client_api(&["profile", user_id, "displayname"], Some(user_id))?;
        self.call(Method::PUT, url, &json!({ "displayname": display_name }))
            .await
            .map_err(|e| anyhow!("failed to set display name of {}: {}", user_id, e))?;
        self.ghost_profiles
            .lock()
            .insert(user_id.to_string(), display_name.to_string());
        Ok(())
    }

    pub async fn send_notice(&self, room_id: &str, content: &str) -> Result<()> {
        self.appservice.client.send_notice(room_id, content).await?;
        Ok(())
    }

    pub async fn is_admin(&self, user_id: &str, room_id: &str) -> bool {
        match self
            .appservice
            .client
            .get_room_state_event(room_id, "m.room.power_levels", "")
            .await
        {
            Ok(power_levels) => power_level_of(&power_levels, user_id) >= self.config.admin_power_level,
            Err(err) => {
                warn!("failed to read power levels room_id={} error={}", room_id, err);
                false
            }
        }
    }

    async fn room_name(&self, room_id: &str) -> Option<String> {
        let url = self
            .client_api(&["rooms", room_id, "state", "m.room.name", ""], None)
            .ok()?;
        match self.get_json::<Value>(url).await {
            Ok(Some(content)) => content.get("name").and_then(Value::as_str).map(str::to_string),
            Ok(None) => None,
            Err(err) => {
                debug!("failed to read room name room_id={} error={}", room_id, err);
                None
            }
        }
    }

    pub fn registration_preview(&self, url: &str) -> Value {
        json!({
            "id": self.config.bridge_id,
            "url": url,
            "as_token": self.config.appservice_token,
            "hs_token": self.config.homeserver_token,
            "sender_localpart": self.config.sender_localpart,
            "rate_limited": false,
            "namespaces": {
                "users": [{
                    "exclusive": true,
                    "regex": format!(
                        "@{}.*:{}",
                        regex::escape(&self.config.ghost_prefix),
                        regex::escape(&self.config.domain)
                    )
                }],
                "aliases": [],
                "rooms": []
            }
        })
    }
}

#[async_trait]
impl MessageSink for MatrixAppservice {
    fn platform(&self) -> Platform {
        Platform::Matrix
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String> {
        let ghost = self.ghost_user_id(
            message.provenance.origin,
            &message.provenance.origin_author,
        );
        let _guard = self.send_lock.lock().await;
        self.ensure_ghost(&ghost, &message.author_name).await?;
        self.join_room_as(&message.conversation_id, &ghost).await?;

        let mut content = json!({
            "msgtype": "m.text",
            "body": message.content,
        });
        content[PROVENANCE_KEY] = serde_json::to_value(&message.provenance)?;
        let txn_id = Uuid::new_v4().to_string();
        let url = self.client_api(
            &[
                "rooms",
                &message.conversation_id,
                "send",
                "m.room.message",
                &txn_id,
            ],
            Some(&ghost),
        )?;
        let response = self
            .call(Method::PUT, url, &content)
            .await
            .map_err(|e| anyhow!("failed to send to {}: {}", message.conversation_id, e))?;
        let event_id = response
            .get("event_id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("homeserver reply carried no event_id"))?
            .to_string();
        debug!(
            "sent matrix message room_id={} sender={} event_id={} mirror_id={}",
            message.conversation_id, ghost, event_id, message.provenance.mirror_id
        );
        Ok(event_id)
    }
}

#[async_trait]
impl HistorySource for MatrixAppservice {
    async fn fetch_after(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let bot = self.bot_user_id();
        let mut url = self.client_api(&["rooms", conversation_id, "messages"], Some(&bot))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("dir", "f");
            query.append_pair("limit", &limit.to_string());
            if let Some(from) = cursor {
                query.append_pair("from", from);
            }
        }
        let response = self
            .get_json::<MessagesResponse>(url)
            .await?
            .ok_or_else(|| anyhow!("matrix room {} not found", conversation_id))?;

        let fetched = response.chunk.len();
        let events = response
            .chunk
            .iter()
            .filter_map(event_handler::inbound_event)
            .collect();
        Ok(HistoryPage {
            events,
            next_cursor: response.end,
            fetched,
        })
    }
}

#[async_trait]
impl GroupDirectory for MatrixAppservice {
    async fn resolve_group(&self, alias_or_id: &str) -> Result<String> {
        if alias_or_id.starts_with('!') {
            return Ok(alias_or_id.to_string());
        }
        if !alias_or_id.starts_with('#') {
            return Err(anyhow!("not a matrix room alias or id: {}", alias_or_id));
        }
        let url = self.client_api(&["directory", "room", alias_or_id], None)?;
        self.get_json::<DirectoryResponse>(url)
            .await?
            .map(|entry| entry.room_id)
            .ok_or_else(|| anyhow!("unknown matrix alias {}", alias_or_id))
    }

    async fn child_conversations(&self, group_id: &str) -> Result<Vec<ConversationRef>> {
        let bot = self.bot_user_id();
        let url = self.client_api(&["rooms", group_id, "state"], Some(&bot))?;
        let state = self.get_json::<Vec<Value>>(url).await?.unwrap_or_default();

        let mut children = Vec::new();
        for child_id in space_children(&state) {
            if let Some(name) = self.room_name(&child_id).await {
                children.push(ConversationRef {
                    id: child_id,
                    name,
                    group_id: Some(group_id.to_string()),
                });
            }
        }
        Ok(children)
    }
}

/// Child room ids of a space, from its `m.space.child` state. Removed children have empty content.
fn space_children(state: &[Value]) -> Vec<String> {
    state
        .iter()
        .filter(|event| event.get("type").and_then(Value::as_str) == Some("m.space.child"))
        .filter(|event| {
            event
                .get("content")
                .and_then(Value::as_object)
                .is_some_and(|content| !content.is_empty())
        })
        .filter_map(|event| event.get("state_key").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MatrixConfig {
        serde_yaml::from_str(
            r#"
domain: "example.org"
homeserver_url: "https://matrix.example.org"
as_token: "as-secret"
hs_token: "hs-secret"
"#,
        )
        .expect("parse matrix config")
    }

    #[test]
    fn localparts_are_sanitized() {
        assert_eq!(sanitize_localpart("discord_Alice#1234"), "discord_alice_1234");
        assert_eq!(sanitize_localpart("space_co_zAbC"), "space_co_zabc");
    }

    #[test]
    fn ghosts_and_bot_match_the_identity_pattern() {
        let appservice = MatrixAppservice::new(config()).expect("appservice");
        let ghost = appservice.ghost_user_id(Platform::Discord, "1001");

        assert_eq!(ghost, "@_space_discord_1001:example.org");
        assert!(appservice.is_bridge_user(&ghost));
        assert!(appservice.is_bridge_user("@_space_bridge:example.org"));
        assert!(!appservice.is_bridge_user("@alice:example.org"));
        assert!(!appservice.is_bridge_user("@_space_discord_1001:evil.org"));
    }

    #[test]
    fn power_level_falls_back_to_users_default() {
        let levels = json!({ "users": { "@admin:example.org": 100 }, "users_default": 10 });

        assert_eq!(power_level_of(&levels, "@admin:example.org"), 100);
        assert_eq!(power_level_of(&levels, "@guest:example.org"), 10);
        assert_eq!(power_level_of(&json!({}), "@guest:example.org"), 0);
    }

    #[test]
    fn client_api_urls_escape_room_ids() {
        let appservice = MatrixAppservice::new(config()).expect("appservice");

        let url = appservice
            .client_api(&["rooms", "!abc:example.org", "messages"], Some("@_space_bridge:example.org"))
            .expect("url");

        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!abc:example.org/messages?user_id=%40_space_bridge%3Aexample.org"
        );
    }

    #[test]
    fn space_children_skip_removed_entries() {
        let state = vec![
            json!({ "type": "m.space.child", "state_key": "!a:example.org", "content": { "via": ["example.org"] } }),
            json!({ "type": "m.space.child", "state_key": "!b:example.org", "content": {} }),
            json!({ "type": "m.room.name", "state_key": "", "content": { "name": "Team" } }),
        ];

        assert_eq!(space_children(&state), vec!["!a:example.org"]);
    }

    #[test]
    fn registration_reserves_the_ghost_namespace() {
        let appservice = MatrixAppservice::new(config()).expect("appservice");

        let registration = appservice.registration_preview("http://bridge:3302");

        assert_eq!(registration["sender_localpart"], "_space_bridge");
        assert_eq!(registration["namespaces"]["users"][0]["regex"], "@_space_.*:example\\.org");
        assert_eq!(registration["hs_token"], "hs-secret");
    }

    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        path: String,
        user_id: Option<String>,
        body: Value,
    }

    /// Minimal homeserver that records every client-server call it receives.
    #[derive(Clone, Default)]
    struct FakeHomeserver {
        requests: Arc<Mutex<Vec<Recorded>>>,
    }

    #[salvo::handler]
    impl FakeHomeserver {
        async fn handle(&self, req: &mut salvo::Request, res: &mut salvo::Response) {
            let recorded = Recorded {
                method: req.method().to_string(),
                path: req.uri().path().to_string(),
                user_id: req.query::<String>("user_id"),
                body: req.parse_json::<Value>().await.unwrap_or(Value::Null),
            };
            let reply = if recorded.path.ends_with("/register")
                && recorded.body["username"] == "_space_discord_2002"
            {
                res.status_code(StatusCode::BAD_REQUEST);
                json!({ "errcode": "M_USER_IN_USE", "error": "User ID already taken." })
            } else if recorded.path.contains("/send/") {
                json!({ "event_id": "$ev1" })
            } else {
                json!({})
            };
            self.requests.lock().push(recorded);
            res.render(salvo::writing::Json(reply));
        }
    }

    async fn spawn_homeserver(fake: FakeHomeserver) -> String {
        use salvo::conn::{Listener, TcpListener};

        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("free port")
            .local_addr()
            .expect("local addr")
            .port();
        let acceptor = TcpListener::new(format!("127.0.0.1:{port}")).bind().await;
        let router = salvo::Router::with_path("{**rest}").goal(fake);
        tokio::spawn(salvo::Server::new(acceptor).serve(router));
        format!("http://127.0.0.1:{port}")
    }

    fn discord_message(author: &str) -> OutboundMessage {
        OutboundMessage {
            conversation_id: "!r:example.org".to_string(),
            content: "hello".to_string(),
            author_name: "Alice".to_string(),
            avatar_url: None,
            provenance: crate::bridge::platform::Provenance {
                origin: Platform::Discord,
                origin_author: author.to_string(),
                origin_message_id: "m1".to_string(),
                mirror_id: "mirror-1".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn mirrored_messages_are_sent_as_the_ghost() {
        let fake = FakeHomeserver::default();
        let mut config = config();
        config.homeserver_url = spawn_homeserver(fake.clone()).await;
        let appservice = MatrixAppservice::new(config).expect("appservice");

        let event_id = appservice.send(&discord_message("1001")).await.expect("send");
        appservice
            .send(&discord_message("2002"))
            .await
            .expect("ghost already registered");

        assert_eq!(event_id, "$ev1");
        let requests = fake.requests.lock().clone();
        let ghost = "@_space_discord_1001:example.org";

        let register = requests
            .iter()
            .find(|r| r.path.ends_with("/register"))
            .expect("register call");
        assert_eq!(register.method, "POST");
        assert_eq!(register.body["type"], "m.login.application_service");
        assert_eq!(register.body["username"], "_space_discord_1001");

        let profile = requests
            .iter()
            .find(|r| r.path.ends_with("/displayname"))
            .expect("display name call");
        assert!(profile.path.contains("_space_discord_1001"));
        assert_eq!(profile.user_id.as_deref(), Some(ghost));
        assert_eq!(profile.body["displayname"], "Alice");

        let sends: Vec<&Recorded> = requests
            .iter()
            .filter(|r| r.path.contains("/send/m.room.message/"))
            .collect();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].method, "PUT");
        assert_eq!(sends[0].user_id.as_deref(), Some(ghost));
        assert_eq!(sends[0].body[PROVENANCE_KEY]["origin"], "discord");
        assert_eq!(
            sends[1].user_id.as_deref(),
            Some("@_space_discord_2002:example.org")
        );
        assert!(
            requests
                .iter()
                .filter(|r| r.path.ends_with("/join"))
                .all(|r| r.user_id.as_deref() != Some("@_space_bridge:example.org"))
        );
    }
}
