//! Message history

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::{from_millis, Store, StoreResult};

/// History page size when the client does not ask for one
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Largest history page served
pub const MAX_HISTORY_LIMIT: usize = 200;

/// Clamp a requested page size into `1..=MAX_HISTORY_LIMIT`
pub fn clamp_history_limit(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

/// A persisted chat message
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_uid: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Append a message and bump the conversation's activity time
    pub async fn save_message(
        &self,
        cid: i64,
        sender_uid: i64,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let content = content.to_string();
        let created = created_at.timestamp_millis();

        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO messages (conversation_id, sender_uid, content, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![cid, sender_uid, content, created],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "UPDATE conversations SET updated_at = MAX(updated_at, ?1) WHERE id = ?2",
                    params![created, cid],
                )?;
                tx.commit()?;
                Ok(id)
            })
            .await?;
        Ok(id)
    }

    /// The newest `limit` messages of a conversation, oldest first
    pub async fn list_recent_messages(
        &self,
        cid: i64,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let limit = limit as i64;
        let mut messages = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, sender_uid, content, created_at
                     FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![cid, limit], |row| {
                        let created_at: i64 = row.get(4)?;
                        Ok(StoredMessage {
                            id: row.get(0)?,
                            conversation_id: row.get(1)?,
                            sender_uid: row.get(2)?,
                            content: row.get(3)?,
                            created_at: from_millis(created_at),
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        // Clients render top to bottom
        messages.reverse();
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use chrono::Duration;

    #[tokio::test]
    async fn test_recent_messages_chronological() {
        let store = Store::in_memory().await.unwrap();
        let uid = store.create_user("alice", "digest", None).await.unwrap();
        let cid = store.create_group(uid, "g").await.unwrap();
        let t0 = Utc::now();

        for i in 0..5 {
            store
                .save_message(cid, uid, &format!("m{}", i), t0 + Duration::milliseconds(i))
                .await
                .unwrap();
        }

        let page = store.list_recent_messages(cid, 3).await.unwrap();
        let texts: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert!(page.iter().all(|m| m.conversation_id == cid && m.sender_uid == uid));
    }

    #[tokio::test]
    async fn test_messages_scoped_to_conversation() {
        let store = Store::in_memory().await.unwrap();
        let uid = store.create_user("alice", "digest", None).await.unwrap();
        let a = store.create_group(uid, "a").await.unwrap();
        let b = store.create_group(uid, "b").await.unwrap();

        store.save_message(a, uid, "for a", Utc::now()).await.unwrap();

        assert_eq!(store.list_recent_messages(a, 50).await.unwrap().len(), 1);
        assert!(store.list_recent_messages(b, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_message_unknown_conversation() {
        let store = Store::in_memory().await.unwrap();
        let uid = store.create_user("alice", "digest", None).await.unwrap();

        let result = store.save_message(404, uid, "lost", Utc::now()).await;
        assert!(matches!(result, Err(StoreError::Database(_))));
    }

    #[test]
    fn test_clamp_history_limit() {
        assert_eq!(clamp_history_limit(None), DEFAULT_HISTORY_LIMIT);
        assert_eq!(clamp_history_limit(Some(0)), 1);
        assert_eq!(clamp_history_limit(Some(10)), 10);
        assert_eq!(clamp_history_limit(Some(10_000)), MAX_HISTORY_LIMIT);
    }
}
