use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    #[serde(default)]
    pub space: SpaceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscordConfig {
    #[serde(alias = "token")]
    pub bot_token: String,
    #[serde(default)]
    pub use_privileged_intents: bool,
    #[serde(default = "default_webhook_name")]
    pub webhook_name: String,
    #[serde(default)]
    pub send_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatrixConfig {
    pub domain: String,
    pub homeserver_url: String,
    #[serde(default = "default_bridge_id")]
    pub bridge_id: String,
    #[serde(alias = "as_token")]
    pub appservice_token: String,
    #[serde(alias = "hs_token")]
    pub homeserver_token: String,
    #[serde(default = "default_sender_localpart")]
    pub sender_localpart: String,
    #[serde(default = "default_ghost_prefix")]
    pub ghost_prefix: String,
    #[serde(default = "default_admin_power_level")]
    pub admin_power_level: i64,
    /// Public URL the homeserver uses to reach this bridge, written into the registration.
    #[serde(default)]
    pub bridge_url: Option<String>,
}

impl MatrixConfig {
    pub fn bot_user_id(&self) -> String {
        format!("@{}:{}", self.sender_localpart, self.domain)
    }

    pub fn ghost_user_id(&self, localpart_suffix: &str) -> String {
        format!("@{}{}:{}", self.ghost_prefix, localpart_suffix, self.domain)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SpaceConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub account_secret: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_database_filename")]
    pub filename: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            filename: default_database_filename(),
            data_dir: default_data_dir(),
            max_connections: None,
            min_connections: None,
        }
    }
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        let url = self.connection_string();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DbType::Postgres
        } else {
            DbType::Sqlite
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref file) = self.filename {
            let path = Path::new(file);
            if path.is_absolute() {
                format!("sqlite://{}", file)
            } else {
                format!("sqlite://{}", PathBuf::from(&self.data_dir).join(path).display())
            }
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.max_connections,
            DbType::Sqlite => Some(1),
        }
    }

    pub fn min_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.min_connections,
            DbType::Sqlite => Some(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_command_sigil")]
    pub command_sigil: String,
    #[serde(default = "default_delay_threshold_ms")]
    pub delay_threshold_ms: u64,
    #[serde(default = "default_dead_threshold_ms")]
    pub dead_threshold_ms: u64,
    #[serde(default = "default_space_poll_interval_secs")]
    pub space_poll_interval_secs: u64,
    #[serde(default = "default_backfill_on_start")]
    pub backfill_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            command_sigil: default_command_sigil(),
            delay_threshold_ms: default_delay_threshold_ms(),
            dead_threshold_ms: default_dead_threshold_ms(),
            space_poll_interval_secs: default_space_poll_interval_secs(),
            backfill_on_start: default_backfill_on_start(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        super::validator::validate(self)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("DISCORD_TOKEN") {
            match self.discord.as_mut() {
                Some(discord) => discord.bot_token = value,
                None => {
                    self.discord = Some(DiscordConfig {
                        bot_token: value,
                        use_privileged_intents: false,
                        webhook_name: default_webhook_name(),
                        send_delay_ms: 0,
                    })
                }
            }
        }
        if let Some(matrix) = self.matrix.as_mut() {
            if let Ok(value) = std::env::var("HS_DOMAIN") {
                matrix.domain = value;
            }
            if let Ok(value) = std::env::var("HS_PUBLIC_URL") {
                matrix.homeserver_url = value;
            }
        }
        if let Ok(value) = std::env::var("API_HOSTNAME") {
            self.api.bind_address = value;
        }
        if let Some(port) = std::env::var("API_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
        {
            self.api.port = port;
        }
        if let Ok(value) = std::env::var("SPACE_API_URL") {
            self.space.api_url = value;
        }
        if let Ok(value) = std::env::var("SPACE_ACCOUNT_ID") {
            self.space.account_id = value;
        }
        if let Ok(value) = std::env::var("SPACE_ACCOUNT_SECRET") {
            self.space.account_secret = value;
        }
        if let Ok(value) = std::env::var("SPACE_API_KEY") {
            self.space.api_key = Some(value);
        }
        if let Ok(value) = std::env::var("DATA_DIR") {
            self.database.data_dir = value;
        }
        if let Ok(value) = std::env::var("LOG_LEVEL") {
            self.logging.level = value;
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3302
}

fn default_webhook_name() -> String {
    "space-bridge".to_string()
}

fn default_bridge_id() -> String {
    "space-bridge".to_string()
}

fn default_sender_localpart() -> String {
    "_space_bridge".to_string()
}

fn default_ghost_prefix() -> String {
    "_space_".to_string()
}

fn default_admin_power_level() -> i64 {
    100
}

fn default_database_filename() -> Option<String> {
    Some("space-bridge.db".to_string())
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_command_sigil() -> String {
    "!".to_string()
}

fn default_delay_threshold_ms() -> u64 {
    10_000
}

fn default_dead_threshold_ms() -> u64 {
    300_000
}

fn default_space_poll_interval_secs() -> u64 {
    5
}

fn default_backfill_on_start() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
discord:
  bot_token: "discord-token"
space:
  api_url: "https://space.example.org/api"
  account_id: "co_zBridge"
  account_secret: "sealed"
"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).expect("parse config");

        assert_eq!(config.api.port, 3302);
        assert_eq!(config.api.bind_address, "0.0.0.0");
        assert_eq!(config.sync.page_size, 100);
        assert_eq!(config.sync.command_sigil, "!");
        assert_eq!(config.sync.delay_threshold_ms, 10_000);
        assert_eq!(config.sync.dead_threshold_ms, 300_000);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.matrix.is_none());
        assert_eq!(
            config.discord.as_ref().map(|d| d.webhook_name.as_str()),
            Some("space-bridge")
        );
        config.validate().expect("minimal config is valid");
    }

    #[test]
    fn relative_sqlite_filename_resolves_under_data_dir() {
        let config = DatabaseConfig {
            url: None,
            filename: Some("bridge.db".to_string()),
            data_dir: "/var/lib/space-bridge".to_string(),
            max_connections: None,
            min_connections: None,
        };

        assert_eq!(config.db_type(), DbType::Sqlite);
        assert_eq!(
            config.sqlite_path().as_deref(),
            Some("/var/lib/space-bridge/bridge.db")
        );
    }

    #[test]
    fn postgres_url_selects_postgres() {
        let config = DatabaseConfig {
            url: Some("postgres://bridge@localhost/bridge".to_string()),
            ..DatabaseConfig::default()
        };

        assert_eq!(config.db_type(), DbType::Postgres);
        assert!(config.sqlite_path().is_none());
    }

    #[test]
    fn matrix_identities_use_configured_prefixes() {
        let yaml = r#"
domain: "example.org"
homeserver_url: "https://matrix.example.org"
as_token: "as"
hs_token: "hs"
"#;
        let matrix: MatrixConfig = serde_yaml::from_str(yaml).expect("parse matrix config");

        assert_eq!(matrix.bot_user_id(), "@_space_bridge:example.org");
        assert_eq!(matrix.ghost_user_id("discord_42"), "@_space_discord_42:example.org");
        assert_eq!(matrix.admin_power_level, 100);
    }
}
