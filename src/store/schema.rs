//! Database schema

use rusqlite::{params, Connection};

use super::{now_millis, WORLD_CHANNEL_ID};

/// Create tables and seed the World Channel. Safe to run on every start.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;
    let now = now_millis();
    conn.execute(
        "INSERT OR IGNORE INTO conversations (id, kind, title, created_at, updated_at)
         VALUES (?1, 'group', ?2, ?3, ?3)",
        params![WORLD_CHANNEL_ID, WORLD_CHANNEL_TITLE, now],
    )?;
    Ok(())
}

/// Title of the seeded conversation every user joins
pub const WORLD_CHANNEL_TITLE: &str = "World Channel";

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    avatar TEXT,
    created_at INTEGER NOT NULL,
    last_login_at INTEGER
);

-- Login tokens
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uid INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    token TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sessions_uid ON sessions(uid);

-- Private chats and groups
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL CHECK (kind IN ('private', 'group')),
    title TEXT,
    avatar TEXT,
    owner_uid INTEGER REFERENCES users(id) ON DELETE SET NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_kind ON conversations(kind);

CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    uid INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role TEXT NOT NULL DEFAULT 'member' CHECK (role IN ('owner', 'admin', 'member')),
    joined_at INTEGER NOT NULL,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    is_muted INTEGER NOT NULL DEFAULT 0,
    last_read_at INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (conversation_id, uid)
);

CREATE INDEX IF NOT EXISTS idx_members_uid ON conversation_members(uid);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    sender_uid INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conv_time ON messages(conversation_id, created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let title: String = conn
            .query_row(
                "SELECT title FROM conversations WHERE id = ?1",
                [WORLD_CHANNEL_ID],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(title, WORLD_CHANNEL_TITLE);
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO messages (conversation_id, sender_uid, content, created_at)
             VALUES (1, 999, 'orphan', 0)",
            [],
        );
        assert!(result.is_err());
    }
}
