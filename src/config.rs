pub use self::parser::{
    ApiConfig, Config, DatabaseConfig, DbType, DiscordConfig, LogFormat, LoggingConfig,
    MatrixConfig, SpaceConfig, SyncConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
