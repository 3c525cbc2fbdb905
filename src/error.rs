//! Typed error kinds crossing the library boundary.
//!
//! Pure engines never return these for partial data; they carry warnings in
//! their results instead. Stores and fetchers roll back and surface a kind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("SDE snapshot not found or unreadable: {0}")]
    MissingSde(String),

    #[error("Character {0} not found")]
    MissingCharacter(i64),

    #[error("Token refresh failed for character {character_id}: {reason}")]
    TokenRefreshFailed { character_id: i64, reason: String },

    #[error("HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to decode response: {0}")]
    Deserialize(String),

    #[error("Blueprint {0} not found in SDE")]
    BlueprintNotFound(i64),

    #[error("Manufacturing recursion exceeded depth {0}")]
    RecursionLimit(usize),

    #[error("No cost index for system {0}")]
    MissingCostIndex(i64),

    #[error("No price available for type {0}")]
    MissingPrice(i64),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    Deadline,

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound("row".to_string()),
            other => CoreError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Deserialize(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CoreError::Deadline
        } else if e.is_decode() {
            CoreError::Deserialize(e.to_string())
        } else {
            CoreError::Network(e.to_string())
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
