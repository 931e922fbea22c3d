//! Storage error types for the API storage backends.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage operation errors.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageError {
    /// Entity not found
    #[error("Entity not found: {entity_type} with id {entity_id}")]
    NotFound {
        entity_type: String,
        entity_id: String,
    },
    /// Unique or state constraint violated
    #[error("Conflict on {entity_type}: {message}")]
    Conflict {
        entity_type: String,
        message: String,
    },
    /// Database connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),
    /// Stored JSON or timestamp could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The backend's connection mutex was poisoned by a panic
    #[error("Storage lock poisoned")]
    LockPoisoned,
    /// General storage error
    #[error("Storage error: {0}")]
    Other(String),
}

impl StorageError {
    pub fn not_found(entity_type: &str, entity_id: impl ToString) -> Self {
        StorageError::NotFound {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    pub fn conflict(entity_type: &str, message: impl Into<String>) -> Self {
        StorageError::Conflict {
            entity_type: entity_type.to_string(),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StorageError::conflict(
                    "row",
                    msg.clone().unwrap_or_else(|| "constraint violation".to_string()),
                )
            }
            _ => StorageError::ConnectionError(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() || db.is_foreign_key_violation() {
                return StorageError::conflict("row", db.message().to_string());
            }
        }
        StorageError::ConnectionError(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
