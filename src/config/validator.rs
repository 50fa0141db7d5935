use thiserror::Error;
use url::Url;

use super::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("missing required setting: {0}")]
    Missing(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.discord.is_none() && config.matrix.is_none() {
        return Err(ConfigError::Missing(
            "at least one of `discord` or `matrix` must be configured".to_string(),
        ));
    }

    if let Some(discord) = &config.discord {
        if discord.bot_token.is_empty() {
            return Err(ConfigError::Missing("discord.bot_token".to_string()));
        }
    }

    if let Some(matrix) = &config.matrix {
        if matrix.domain.is_empty() {
            return Err(ConfigError::Missing("matrix.domain".to_string()));
        }
        if matrix.appservice_token.is_empty() || matrix.homeserver_token.is_empty() {
            return Err(ConfigError::Missing(
                "matrix.appservice_token and matrix.homeserver_token".to_string(),
            ));
        }
        Url::parse(&matrix.homeserver_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("matrix.homeserver_url is not a valid URL: {e}"))
        })?;
    }

    if config.space.account_id.is_empty() || config.space.account_secret.is_empty() {
        return Err(ConfigError::Missing(
            "space.account_id and space.account_secret".to_string(),
        ));
    }
    Url::parse(&config.space.api_url).map_err(|e| {
        ConfigError::InvalidConfig(format!("space.api_url is not a valid URL: {e}"))
    })?;

    if config.database.connection_string().is_empty() {
        return Err(ConfigError::InvalidConfig(
            "database connection string cannot be empty".to_string(),
        ));
    }

    if config.api.port == 0 {
        return Err(ConfigError::InvalidConfig(
            "api.port must be between 1 and 65535".to_string(),
        ));
    }

    if config.sync.page_size == 0 || config.sync.page_size > 100 {
        return Err(ConfigError::InvalidConfig(
            "sync.page_size must be between 1 and 100".to_string(),
        ));
    }

    if config.sync.command_sigil.trim().is_empty() {
        return Err(ConfigError::InvalidConfig(
            "sync.command_sigil cannot be blank".to_string(),
        ));
    }

    if config.sync.dead_threshold_ms <= config.sync.delay_threshold_ms {
        return Err(ConfigError::InvalidConfig(
            "sync.dead_threshold_ms must be greater than sync.delay_threshold_ms".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        serde_yaml::from_str(
            r#"
discord:
  bot_token: "token"
space:
  api_url: "https://space.example.org"
  account_id: "co_zBridge"
  account_secret: "secret"
"#,
        )
        .expect("parse base config")
    }

    #[test]
    fn rejects_config_without_platforms() {
        let mut config = base();
        config.discord = None;

        assert!(matches!(validate(&config), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn rejects_missing_space_credentials() {
        let mut config = base();
        config.space.account_secret.clear();

        assert!(matches!(validate(&config), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = base();
        config.sync.delay_threshold_ms = 5_000;
        config.sync.dead_threshold_ms = 5_000;

        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_oversized_pages() {
        let mut config = base();
        config.sync.page_size = 101;

        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidConfig(_))
        ));
    }
}
