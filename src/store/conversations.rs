//! Conversations and their members
//!
//! A conversation is either a private chat between exactly two users or a
//! group with an owner. Conversation 1 is the World Channel, seeded with the
//! schema, which every user may join.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use super::{from_millis, now_millis, reject, Store, StoreError, StoreResult};

/// Id of the seeded public group
pub const WORLD_CHANNEL_ID: i64 = 1;

/// Longest accepted group title
pub const MAX_TITLE_LENGTH: usize = 100;

/// Conversation flavour
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Private,
    Group,
}

impl ConversationKind {
    fn from_db(value: &str) -> Self {
        match value {
            "private" => ConversationKind::Private,
            _ => ConversationKind::Group,
        }
    }
}

/// A member's role inside a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    fn from_db(value: &str) -> Self {
        match value {
            "owner" => MemberRole::Owner,
            "admin" => MemberRole::Admin,
            _ => MemberRole::Member,
        }
    }

    /// Whether a member with this role may remove a member with `target`
    pub fn can_remove(self, target: MemberRole) -> bool {
        match self {
            MemberRole::Owner => target != MemberRole::Owner,
            MemberRole::Admin => target == MemberRole::Member,
            MemberRole::Member => false,
        }
    }
}

/// One row of a user's conversation list
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationSummary {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    /// Group title, or the peer's username for private chats
    pub title: Option<String>,
    /// Group avatar, or the peer's avatar for private chats
    pub avatar: Option<String>,
    pub peer_uid: Option<i64>,
    pub is_pinned: bool,
    pub is_muted: bool,
    /// Messages from others newer than the caller's last read mark
    pub unread: i64,
    pub last_msg: String,
    pub last_time: Option<DateTime<Utc>>,
    pub my_role: MemberRole,
}

/// Placeholder title for a private chat whose peer account is gone
const UNKNOWN_PEER: &str = "Unknown user";

fn role_of(tx: &Transaction<'_>, cid: i64, uid: i64) -> rusqlite::Result<Option<MemberRole>> {
    tx.query_row(
        "SELECT role FROM conversation_members WHERE conversation_id = ?1 AND uid = ?2",
        params![cid, uid],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map(|role| role.map(|r| MemberRole::from_db(&r)))
}

fn kind_of(tx: &Transaction<'_>, cid: i64) -> rusqlite::Result<Option<ConversationKind>> {
    tx.query_row(
        "SELECT kind FROM conversations WHERE id = ?1",
        [cid],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map(|kind| kind.map(|k| ConversationKind::from_db(&k)))
}

fn user_exists(tx: &Transaction<'_>, uid: i64) -> rusqlite::Result<bool> {
    Ok(tx
        .query_row("SELECT 1 FROM users WHERE id = ?1", [uid], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Fail unless the conversation exists and is a group
fn require_group(tx: &Transaction<'_>, cid: i64) -> Result<(), tokio_rusqlite::Error> {
    match kind_of(tx, cid)? {
        None => Err(reject(StoreError::NotFound(format!("conversation {}", cid)))),
        Some(ConversationKind::Private) => Err(reject(StoreError::PermissionDenied(
            "private conversations have fixed members".to_string(),
        ))),
        Some(ConversationKind::Group) => Ok(()),
    }
}

impl Store {
    /// Open a private chat between two users, reusing an existing one
    pub async fn create_private(&self, uid: i64, peer_uid: i64) -> StoreResult<i64> {
        if uid == peer_uid {
            return Err(StoreError::Invalid(
                "cannot open a private conversation with yourself".to_string(),
            ));
        }

        let cid = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if !user_exists(&tx, peer_uid)? {
                    return Err(reject(StoreError::NotFound(format!("user {}", peer_uid))));
                }

                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT c.id FROM conversations c
                         JOIN conversation_members m1 ON c.id = m1.conversation_id
                         JOIN conversation_members m2 ON c.id = m2.conversation_id
                         WHERE c.kind = 'private' AND m1.uid = ?1 AND m2.uid = ?2
                         LIMIT 1",
                        params![uid, peer_uid],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(cid) = existing {
                    return Ok(cid);
                }

                let now = now_millis();
                tx.execute(
                    "INSERT INTO conversations (kind, created_at, updated_at) VALUES ('private', ?1, ?1)",
                    [now],
                )?;
                let cid = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO conversation_members (conversation_id, uid, joined_at)
                     VALUES (?1, ?2, ?4), (?1, ?3, ?4)",
                    params![cid, uid, peer_uid, now],
                )?;
                tx.commit()?;
                Ok(cid)
            })
            .await?;
        Ok(cid)
    }

    /// Create a group owned by `owner_uid`
    pub async fn create_group(&self, owner_uid: i64, title: &str) -> StoreResult<i64> {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(StoreError::Invalid("group title cannot be empty".to_string()));
        }
        if title.chars().count() > MAX_TITLE_LENGTH {
            return Err(StoreError::Invalid(format!(
                "group title exceeds maximum length of {} characters",
                MAX_TITLE_LENGTH
            )));
        }

        let cid = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = now_millis();
                tx.execute(
                    "INSERT INTO conversations (kind, title, owner_uid, created_at, updated_at)
                     VALUES ('group', ?1, ?2, ?3, ?3)",
                    params![title, owner_uid, now],
                )?;
                let cid = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO conversation_members (conversation_id, uid, role, joined_at)
                     VALUES (?1, ?2, 'owner', ?3)",
                    params![cid, owner_uid, now],
                )?;
                tx.commit()?;
                Ok(cid)
            })
            .await?;
        Ok(cid)
    }

    /// Every conversation `uid` belongs to, pinned first, then by latest activity
    pub async fn list_conversations(&self, uid: i64) -> StoreResult<Vec<ConversationSummary>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT
                        c.id, c.kind, c.title, c.avatar, c.updated_at,
                        m.is_pinned, m.is_muted, m.role,
                        (SELECT COUNT(*) FROM messages msg
                         WHERE msg.conversation_id = c.id
                           AND msg.created_at > m.last_read_at
                           AND msg.sender_uid != m.uid) AS unread_count,
                        (SELECT content FROM messages msg
                         WHERE msg.conversation_id = c.id
                         ORDER BY msg.created_at DESC, msg.id DESC LIMIT 1) AS last_message,
                        (SELECT created_at FROM messages msg
                         WHERE msg.conversation_id = c.id
                         ORDER BY msg.created_at DESC, msg.id DESC LIMIT 1) AS last_message_time,
                        peer.username, peer.avatar, pm.uid
                     FROM conversation_members m
                     JOIN conversations c ON m.conversation_id = c.id
                     LEFT JOIN conversation_members pm
                        ON pm.conversation_id = c.id AND c.kind = 'private' AND pm.uid != m.uid
                     LEFT JOIN users peer ON pm.uid = peer.id
                     WHERE m.uid = ?1
                     ORDER BY m.is_pinned DESC,
                              COALESCE(last_message_time, c.updated_at) DESC,
                              c.id DESC",
                )?;

                let rows = stmt
                    .query_map([uid], |row| {
                        let kind = ConversationKind::from_db(&row.get::<_, String>(1)?);
                        let role: String = row.get(7)?;
                        let last_time: Option<i64> = row.get(10)?;
                        let peer_name: Option<String> = row.get(11)?;
                        let peer_avatar: Option<String> = row.get(12)?;

                        let (title, avatar) = match kind {
                            ConversationKind::Private => (
                                Some(peer_name.unwrap_or_else(|| UNKNOWN_PEER.to_string())),
                                peer_avatar,
                            ),
                            ConversationKind::Group => (row.get(2)?, row.get(3)?),
                        };

                        Ok(ConversationSummary {
                            id: row.get(0)?,
                            kind,
                            title,
                            avatar,
                            peer_uid: row.get(13)?,
                            is_pinned: row.get(5)?,
                            is_muted: row.get(6)?,
                            unread: row.get(8)?,
                            last_msg: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                            last_time: last_time.map(from_millis),
                            my_role: MemberRole::from_db(&role),
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Rename a group or change its avatar. Owner only.
    pub async fn update_group_info(
        &self,
        operator_uid: i64,
        cid: i64,
        title: Option<&str>,
        avatar: Option<&str>,
    ) -> StoreResult<()> {
        let title = title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        let avatar = avatar.map(str::to_string).filter(|a| !a.is_empty());
        if title.is_none() && avatar.is_none() {
            return Err(StoreError::Invalid("nothing to update".to_string()));
        }
        if title
            .as_ref()
            .is_some_and(|t| t.chars().count() > MAX_TITLE_LENGTH)
        {
            return Err(StoreError::Invalid(format!(
                "group title exceeds maximum length of {} characters",
                MAX_TITLE_LENGTH
            )));
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                require_group(&tx, cid)?;
                if role_of(&tx, cid, operator_uid)? != Some(MemberRole::Owner) {
                    return Err(reject(StoreError::PermissionDenied(
                        "only the group owner can change group info".to_string(),
                    )));
                }

                let now = now_millis();
                if let Some(title) = title {
                    tx.execute(
                        "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
                        params![title, now, cid],
                    )?;
                }
                if let Some(avatar) = avatar {
                    tx.execute(
                        "UPDATE conversations SET avatar = ?1, updated_at = ?2 WHERE id = ?3",
                        params![avatar, now, cid],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Add a user to a group. Returns `false` when they were already a member.
    ///
    /// Anyone may join the World Channel; other groups require the operator
    /// to be a member already.
    pub async fn add_member(&self, operator_uid: i64, cid: i64, new_uid: i64) -> StoreResult<bool> {
        let added = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                require_group(&tx, cid)?;
                if !user_exists(&tx, new_uid)? {
                    return Err(reject(StoreError::NotFound(format!("user {}", new_uid))));
                }
                if cid != WORLD_CHANNEL_ID && role_of(&tx, cid, operator_uid)?.is_none() {
                    return Err(reject(StoreError::PermissionDenied(
                        "only members can invite to this group".to_string(),
                    )));
                }

                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO conversation_members (conversation_id, uid, joined_at)
                     VALUES (?1, ?2, ?3)",
                    params![cid, new_uid, now_millis()],
                )?;
                tx.commit()?;
                Ok(inserted > 0)
            })
            .await?;
        Ok(added)
    }

    /// Remove a member from a group. Returns `false` when the target was not a member.
    ///
    /// Members may leave on their own, except the owner. The owner may remove
    /// anyone else; admins may remove plain members.
    pub async fn remove_member(
        &self,
        operator_uid: i64,
        cid: i64,
        target_uid: i64,
    ) -> StoreResult<bool> {
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                require_group(&tx, cid)?;

                let Some(operator) = role_of(&tx, cid, operator_uid)? else {
                    return Err(reject(StoreError::PermissionDenied(
                        "you are not a member of this group".to_string(),
                    )));
                };
                let Some(target) = role_of(&tx, cid, target_uid)? else {
                    return Ok(false);
                };

                let allowed = if operator_uid == target_uid {
                    operator != MemberRole::Owner
                } else {
                    operator.can_remove(target)
                };
                if !allowed {
                    return Err(reject(StoreError::PermissionDenied(
                        "insufficient role to remove this member".to_string(),
                    )));
                }

                tx.execute(
                    "DELETE FROM conversation_members WHERE conversation_id = ?1 AND uid = ?2",
                    params![cid, target_uid],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(removed)
    }

    /// Whether `uid` belongs to conversation `cid`
    pub async fn is_member(&self, cid: i64, uid: i64) -> StoreResult<bool> {
        let member = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT 1 FROM conversation_members WHERE conversation_id = ?1 AND uid = ?2",
                        params![cid, uid],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some())
            })
            .await?;
        Ok(member)
    }

    /// Whether a conversation with this id exists
    pub async fn conversation_exists(&self, cid: i64) -> StoreResult<bool> {
        let exists = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT 1 FROM conversations WHERE id = ?1", [cid], |_| Ok(()))
                    .optional()?
                    .is_some())
            })
            .await?;
        Ok(exists)
    }

    /// Move the caller's read mark to `at`
    pub async fn mark_read(&self, uid: i64, cid: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let at = at.timestamp_millis();
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE conversation_members SET last_read_at = ?1
                     WHERE conversation_id = ?2 AND uid = ?3",
                    params![at, cid, uid],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "membership in conversation {}",
                cid
            )));
        }
        Ok(())
    }

    /// Pin or mute a conversation for the caller
    pub async fn set_flags(
        &self,
        uid: i64,
        cid: i64,
        pinned: Option<bool>,
        muted: Option<bool>,
    ) -> StoreResult<()> {
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE conversation_members
                     SET is_pinned = COALESCE(?1, is_pinned), is_muted = COALESCE(?2, is_muted)
                     WHERE conversation_id = ?3 AND uid = ?4",
                    params![pinned, muted, cid, uid],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "membership in conversation {}",
                cid
            )));
        }
        Ok(())
    }
}
