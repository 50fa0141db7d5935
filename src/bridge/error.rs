use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no mapping registered for {0}")]
    NotMapped(String),
    #[error("{0} is already registered")]
    AlreadyRegistered(String),
    #[error("{0} is not registered")]
    NotRegistered(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("send to {platform} failed: {reason}")]
    TransientSendFailure { platform: String, reason: String },
    #[error("history fetch for {conversation} failed: {reason}")]
    BackfillFetchFailure {
        conversation: String,
        reason: String,
    },
    #[error("missing configuration: {0}")]
    ConfigurationMissing(String),
    #[error(transparent)]
    Database(DatabaseError),
}

impl From<DatabaseError> for BridgeError {
    fn from(value: DatabaseError) -> Self {
        match value {
            DatabaseError::AlreadyRegistered(key) => BridgeError::AlreadyRegistered(key),
            DatabaseError::NotRegistered(key) => BridgeError::NotRegistered(key),
            other => BridgeError::Database(other),
        }
    }
}
