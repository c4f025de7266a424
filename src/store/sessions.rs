//! Login sessions (token -> user)

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{from_millis, Store, StoreResult};

/// A persisted login token
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub token: String,
    pub uid: i64,
    pub created_at: DateTime<Utc>,
    /// `None` means the token never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Whether the token is past its expiry at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

impl Store {
    /// Persist a new token for a user
    pub async fn create_session(
        &self,
        uid: i64,
        token: &str,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let token = token.to_string();
        let created = created_at.timestamp_millis();
        let expires = expires_at.map(|t| t.timestamp_millis());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (uid, token, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![uid, token, created, expires],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Look a token up, expired or not
    pub async fn find_session(&self, token: &str) -> StoreResult<Option<SessionRecord>> {
        let token = token.to_string();
        let record = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT token, uid, created_at, expires_at FROM sessions WHERE token = ?1",
                        [&token],
                        |row| {
                            let created_at: i64 = row.get(2)?;
                            let expires_at: Option<i64> = row.get(3)?;
                            Ok(SessionRecord {
                                token: row.get(0)?,
                                uid: row.get(1)?,
                                created_at: from_millis(created_at),
                                expires_at: expires_at.map(from_millis),
                            })
                        },
                    )
                    .optional()?)
            })
            .await?;
        Ok(record)
    }

    /// Delete a token. Returns whether a row was removed.
    pub async fn delete_session(&self, token: &str) -> StoreResult<bool> {
        let token = token.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM sessions WHERE token = ?1", [&token])?))
            .await?;
        Ok(removed > 0)
    }

    /// Drop every token that expired at or before `now`
    pub async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let now = now.timestamp_millis();
        let removed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM sessions WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    [now],
                )?)
            })
            .await?;
        Ok(removed)
    }
}
