//! T1 - durable per-user archive of every message. In-memory adapter for
//! tests and light deployments; an SQLite+FTS5 adapter (behind the
//! `sqlite-archive` feature) for durable storage.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::model::Message;

use super::ArchiveTier;

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// In-memory T1 adapter: append-only per-user message list plus a
/// lexical index. Suitable for tests; carries no durability guarantee.
pub struct InMemoryArchive {
    users: StdMutex<HashMap<String, Vec<Message>>>,
}

impl Default for InMemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self {
            users: StdMutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ArchiveTier for InMemoryArchive {
    async fn archive(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut users = self.users.lock().expect("archive lock poisoned");
        users.entry(message.user_id.clone()).or_default().push(message);
        Ok(())
    }

    async fn search(&self, user: &str, query: &str, max_k: usize, cancel: &CancellationToken) -> Result<Vec<Message>> {
        check_cancelled(cancel)?;
        let query_lower = query.to_lowercase();
        let users = self.users.lock().expect("archive lock poisoned");
        let Some(messages) = users.get(user) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<(f32, &Message)> = messages
            .iter()
            .filter_map(|m| {
                let lower = m.content.to_lowercase();
                if lower.contains(&query_lower) {
                    let relevance = query_lower.len() as f32 / lower.len().max(1) as f32;
                    Some((relevance, m))
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.metadata.importance.total_cmp(&a.1.metadata.importance))
                .then_with(|| b.1.timestamp.cmp(&a.1.timestamp))
        });
        hits.truncate(max_k);
        Ok(hits.into_iter().map(|(_, m)| m.clone()).collect())
    }

    async fn get(&self, message_id: &str, cancel: &CancellationToken) -> Result<Option<Message>> {
        check_cancelled(cancel)?;
        let users = self.users.lock().expect("archive lock poisoned");
        Ok(users.values().flatten().find(|m| m.id == message_id).cloned())
    }

    async fn delete(&self, user: &str, message_id: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut users = self.users.lock().expect("archive lock poisoned");
        if let Some(messages) = users.get_mut(user) {
            messages.retain(|m| m.id != message_id);
        }
        Ok(())
    }

    async fn erase_user(&self, user: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut users = self.users.lock().expect("archive lock poisoned");
        users.remove(user);
        Ok(())
    }

    async fn is_empty_for_user(&self, user: &str) -> bool {
        let users = self.users.lock().expect("archive lock poisoned");
        users.get(user).is_none_or(|messages| messages.is_empty())
    }
}

#[cfg(feature = "sqlite-archive")]
mod sqlite_backend {
    use super::*;
    use rusqlite::Connection;
    use tokio::sync::Mutex as AsyncMutex;

    /// SQLite + FTS5-backed T1 adapter. One connection behind an async
    /// mutex; reads and writes both serialize on it since
    /// `rusqlite::Connection` is not `Sync`.
    pub struct SqliteArchive {
        conn: AsyncMutex<Connection>,
    }

    impl SqliteArchive {
        /// Open (or create) the archive database at `path`, running
        /// migrations idempotently.
        pub fn open(path: &std::path::Path) -> Result<Self> {
            let conn = Connection::open(path)?;
            Self::migrate(&conn)?;
            Ok(Self {
                conn: AsyncMutex::new(conn),
            })
        }

        /// In-process, non-persistent database - useful for tests that
        /// want the SQLite code path without a filesystem fixture.
        pub fn open_in_memory() -> Result<Self> {
            let conn = Connection::open_in_memory()?;
            Self::migrate(&conn)?;
            Ok(Self {
                conn: AsyncMutex::new(conn),
            })
        }

        fn migrate(conn: &Connection) -> Result<()> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS archived_messages (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    conversation_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    importance REAL NOT NULL,
                    metadata_json TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_archived_messages_user
                    ON archived_messages(user_id);
                CREATE VIRTUAL TABLE IF NOT EXISTS archived_messages_fts
                    USING fts5(id UNINDEXED, user_id UNINDEXED, content, content=archived_messages, content_rowid=rowid);",
            )?;
            Ok(())
        }

        fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
            let metadata_json: String = row.get("metadata_json")?;
            let metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
            Ok(Message {
                id: row.get("id")?,
                user_id: row.get("user_id")?,
                conversation_id: row.get("conversation_id")?,
                role: serde_json::from_value(serde_json::Value::String(row.get("role")?))
                    .unwrap_or(crate::model::Role::User),
                content: row.get("content")?,
                timestamp: row.get("timestamp")?,
                metadata,
            })
        }
    }

    #[async_trait]
    impl ArchiveTier for SqliteArchive {
        async fn archive(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
            check_cancelled(cancel)?;
            let conn = self.conn.lock().await;
            let metadata_json = serde_json::to_string(&message.metadata)
                .map_err(|e| EngineError::Adapter(e.to_string()))?;
            let role_json = serde_json::to_value(message.role).map_err(|e| EngineError::Adapter(e.to_string()))?;
            conn.execute(
                "INSERT OR REPLACE INTO archived_messages
                    (id, user_id, conversation_id, role, content, timestamp, importance, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    message.id,
                    message.user_id,
                    message.conversation_id,
                    role_json.as_str(),
                    message.content,
                    message.timestamp,
                    message.metadata.importance,
                    metadata_json,
                ],
            )?;
            conn.execute(
                "INSERT INTO archived_messages_fts(rowid, id, user_id, content)
                 SELECT rowid, id, user_id, content FROM archived_messages WHERE id = ?1",
                rusqlite::params![message.id],
            )?;
            Ok(())
        }

        async fn search(&self, user: &str, query: &str, max_k: usize, cancel: &CancellationToken) -> Result<Vec<Message>> {
            check_cancelled(cancel)?;
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT m.* FROM archived_messages m
                 JOIN archived_messages_fts ON archived_messages_fts.rowid = m.rowid
                 WHERE archived_messages_fts.user_id = ?1 AND archived_messages_fts MATCH ?2
                 ORDER BY bm25(archived_messages_fts) ASC, m.importance DESC, m.timestamp DESC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(rusqlite::params![user, query, max_k as i64], Self::row_to_message)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        }

        async fn get(&self, message_id: &str, cancel: &CancellationToken) -> Result<Option<Message>> {
            check_cancelled(cancel)?;
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare("SELECT * FROM archived_messages WHERE id = ?1")?;
            let mut rows = stmt.query_map(rusqlite::params![message_id], Self::row_to_message)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        }

        async fn delete(&self, user: &str, message_id: &str, cancel: &CancellationToken) -> Result<()> {
            check_cancelled(cancel)?;
            let conn = self.conn.lock().await;
            conn.execute(
                "DELETE FROM archived_messages WHERE id = ?1 AND user_id = ?2",
                rusqlite::params![message_id, user],
            )?;
            Ok(())
        }

        async fn erase_user(&self, user: &str, cancel: &CancellationToken) -> Result<()> {
            check_cancelled(cancel)?;
            let conn = self.conn.lock().await;
            conn.execute("DELETE FROM archived_messages WHERE user_id = ?1", rusqlite::params![user])?;
            Ok(())
        }

        async fn is_empty_for_user(&self, user: &str) -> bool {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT COUNT(*) FROM archived_messages WHERE user_id = ?1",
                rusqlite::params![user],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count == 0)
            .unwrap_or(true)
        }
    }
}

#[cfg(feature = "sqlite-archive")]
pub use sqlite_backend::SqliteArchive;
