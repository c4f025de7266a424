//! Relational store
//!
//! SQLite database holding users, login sessions, conversations, their
//! members and the message history. All access goes through a single
//! `tokio-rusqlite` connection so callers never block the runtime.

mod conversations;
mod messages;
mod schema;
mod sessions;
mod users;

use std::path::Path;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::debug;

pub use conversations::{ConversationSummary, WORLD_CHANNEL_ID};
pub use messages::{clamp_history_limit, StoredMessage};
pub use users::User;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            // Domain errors raised inside a connection closure travel back boxed
            tokio_rusqlite::Error::Other(inner) => match inner.downcast::<StoreError>() {
                Ok(store_err) => *store_err,
                Err(other) => StoreError::Database(other.to_string()),
            },
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Abort a connection closure with a domain error
pub(crate) fn reject(err: StoreError) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(err))
}

/// Current time as stored in the database
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a stored timestamp back into a `DateTime`
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Handle to the chat database
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a file-backed database and make sure the schema exists
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening database at {}", path.display());
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    /// Open a private in-memory database
    pub async fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> StoreResult<Self> {
        conn.call(|conn| Ok(schema::init_schema(conn)?)).await?;
        Ok(Self { conn })
    }
}
