//! User accounts

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{from_millis, now_millis, reject, Store, StoreError, StoreResult, WORLD_CHANNEL_ID};

/// A registered user
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Encoded password digest, never sent to clients
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: i64 = row.get(4)?;
        let last_login_at: Option<i64> = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            password_hash: row.get(2)?,
            avatar: row.get(3)?,
            created_at: from_millis(created_at),
            last_login_at: last_login_at.map(from_millis),
        })
    }
}

const USER_COLUMNS: &str = "id, username, password_hash, avatar, created_at, last_login_at";

impl Store {
    /// Insert a user and enrol them in the World Channel in one transaction
    ///
    /// Fails with `Conflict` when the name is taken. Nothing is written when
    /// either step fails.
    pub async fn register_user(
        &self,
        username: &str,
        password_hash: &str,
        avatar: Option<&str>,
    ) -> StoreResult<i64> {
        self.insert_user(username, password_hash, avatar, true).await
    }

    /// Insert a user without any memberships
    #[cfg(test)]
    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        avatar: Option<&str>,
    ) -> StoreResult<i64> {
        self.insert_user(username, password_hash, avatar, false).await
    }

    async fn insert_user(
        &self,
        username: &str,
        password_hash: &str,
        avatar: Option<&str>,
        join_world_channel: bool,
    ) -> StoreResult<i64> {
        let username = username.to_string();
        let password_hash = password_hash.to_string();
        let avatar = avatar.map(str::to_string);

        let uid = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists = tx
                    .query_row(
                        "SELECT 1 FROM users WHERE username = ?1",
                        [&username],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if exists {
                    return Err(reject(StoreError::Conflict(format!(
                        "user '{}' already exists",
                        username
                    ))));
                }

                tx.execute(
                    "INSERT INTO users (username, password_hash, avatar, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![username, password_hash, avatar, now_millis()],
                )?;
                let uid = tx.last_insert_rowid();
                if join_world_channel {
                    tx.execute(
                        "INSERT INTO conversation_members (conversation_id, uid, joined_at)
                         VALUES (?1, ?2, ?3)",
                        params![WORLD_CHANNEL_ID, uid, now_millis()],
                    )?;
                }
                tx.commit()?;
                Ok(uid)
            })
            .await?;
        Ok(uid)
    }

    /// Look a user up by name
    pub async fn find_user_by_name(&self, username: &str) -> StoreResult<Option<User>> {
        let username = username.to_string();
        let user = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1");
                Ok(conn.query_row(&sql, [&username], User::from_row).optional()?)
            })
            .await?;
        Ok(user)
    }

    /// Look a user up by id
    pub async fn get_user(&self, uid: i64) -> StoreResult<Option<User>> {
        let user = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
                Ok(conn.query_row(&sql, [uid], User::from_row).optional()?)
            })
            .await?;
        Ok(user)
    }

    /// Record a successful login
    pub async fn touch_login(&self, uid: i64) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
                    params![now_millis(), uid],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
