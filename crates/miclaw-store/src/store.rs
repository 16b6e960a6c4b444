// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use miclaw_provider::{Message, Part, Role};

use crate::Session;

/// Errors returned by the session store.
///
/// `Closed` is a distinct variant so callers (and the shutdown tests) can
/// tell a use-after-close programming error apart from a transport error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store is closed")]
    Closed,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("corrupt message parts: {0}")]
    Parts(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// SQLite-backed store for sessions and messages.
///
/// All access is serialized on a single connection.  Message rows are
/// returned in persistence order (rowid), which by construction equals
/// `created_at` order.  After [`SessionStore::close`] every operation fails
/// with [`StoreError::Closed`].
pub struct SessionStore {
    conn: Mutex<Option<Connection>>,
}

impl SessionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(Some(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(Some(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    parent_session_id TEXT,
                    title TEXT NOT NULL DEFAULT '',
                    message_count INTEGER NOT NULL DEFAULT 0,
                    prompt_tokens INTEGER NOT NULL DEFAULT 0,
                    completion_tokens INTEGER NOT NULL DEFAULT 0,
                    cost REAL NOT NULL DEFAULT 0,
                    summary_message_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    parts TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
                CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);
                CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);
                "#,
            )?;
            Ok(())
        })
    }

    /// Run `f` against the live connection, or fail with `Closed`.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().expect("store mutex poisoned");
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }

    /// Release the connection.  Idempotent; all later calls fail with
    /// [`StoreError::Closed`].
    pub fn close(&self) {
        let mut guard = self.conn.lock().expect("store mutex poisoned");
        if guard.take().is_some() {
            debug!("session store closed");
        }
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub fn create_session(&self, session: &Session) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO sessions (id, parent_session_id, title, message_count,
                    prompt_tokens, completion_tokens, cost, summary_message_id,
                    created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    session.id,
                    session.parent_session_id,
                    session.title,
                    session.message_count,
                    session.prompt_tokens,
                    session.completion_tokens,
                    session.cost,
                    session.summary_message_id,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, parent_session_id, title, message_count, prompt_tokens,
                        completion_tokens, cost, summary_message_id, created_at, updated_at
                 FROM sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Sessions ordered by most recent activity.
    pub fn list_sessions(&self, limit: usize, offset: usize) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, parent_session_id, title, message_count, prompt_tokens,
                        completion_tokens, cost, summary_message_id, created_at, updated_at
                 FROM sessions ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![limit, offset], row_to_session)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    pub fn count_sessions(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: u64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
            Ok(n)
        })
    }

    pub fn update_session(&self, session: &Session) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                r#"
                UPDATE sessions SET parent_session_id = ?2, title = ?3, message_count = ?4,
                    prompt_tokens = ?5, completion_tokens = ?6, cost = ?7,
                    summary_message_id = ?8, updated_at = ?9
                WHERE id = ?1
                "#,
                params![
                    session.id,
                    session.parent_session_id,
                    session.title,
                    session.message_count,
                    session.prompt_tokens,
                    session.completion_tokens,
                    session.cost,
                    session.summary_message_id,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(session.id.clone()));
            }
            Ok(())
        })
    }

    /// Delete a session and all its messages in one transaction.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN")?;
            let result = (|| -> Result<()> {
                conn.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
                conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
                Ok(())
            })();
            match result {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
            Ok(())
        })
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn create_message(&self, message: &Message) -> Result<()> {
        self.with_conn(|conn| {
            insert_message(conn, message)?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, session_id, role, parts, created_at FROM messages WHERE id = ?1",
                params![id],
                row_to_message_raw,
            )
            .optional()?
            .map(decode_message)
            .transpose()
        })
    }

    /// Messages of one session in persistence order.  `limit = 0` means no
    /// limit.
    pub fn list_by_session(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        // SQLite treats a negative LIMIT as "no limit".
        let effective: i64 = if limit == 0 { -1 } else { limit as i64 };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, parts, created_at FROM messages
                 WHERE session_id = ?1 ORDER BY rowid LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![session_id, effective, offset], row_to_message_raw)?;
            let raw = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            raw.into_iter().map(decode_message).collect()
        })
    }

    pub fn count_by_session(&self, session_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: u64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                params![session_id],
                |r| r.get(0),
            )?;
            Ok(n)
        })
    }

    /// Atomically replace a session's messages (used by compaction).
    pub fn replace_session_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN")?;
            let result = (|| -> Result<()> {
                conn.execute(
                    "DELETE FROM messages WHERE session_id = ?1",
                    params![session_id],
                )?;
                for m in messages {
                    insert_message(conn, m)?;
                }
                Ok(())
            })();
            match result {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
            Ok(())
        })
    }
}

fn insert_message(conn: &Connection, message: &Message) -> Result<()> {
    let parts = serde_json::to_string(&message.parts)?;
    conn.execute(
        "INSERT INTO messages (id, session_id, role, parts, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.id,
            message.session_id,
            role_str(message.role),
            parts,
            message.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn parse_role(s: &str) -> Option<Role> {
    match s {
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        "tool" => Some(Role::Tool),
        _ => None,
    }
}

struct RawMessage {
    id: String,
    session_id: String,
    role: String,
    parts: String,
    created_at: String,
}

fn row_to_message_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        parts: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Decode a raw row into a [`Message`].  Unknown part tags and unknown roles
/// are hard errors — a transcript that cannot round-trip must not be
/// silently truncated.
fn decode_message(raw: RawMessage) -> Result<Message> {
    let parts: Vec<Part> = serde_json::from_str(&raw.parts)?;
    let role = parse_role(&raw.role).ok_or_else(|| {
        StoreError::Corrupt(format!("unknown role {:?} on message {}", raw.role, raw.id))
    })?;
    Ok(Message {
        id: raw.id,
        session_id: raw.session_id,
        role,
        parts,
        created_at: parse_ts(&raw.created_at),
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let created: String = row.get(8)?;
    let updated: String = row.get(9)?;
    Ok(Session {
        id: row.get(0)?,
        parent_session_id: row.get(1)?,
        title: row.get(2)?,
        message_count: row.get(3)?,
        prompt_tokens: row.get(4)?,
        completion_tokens: row.get(5)?,
        cost: row.get(6)?,
        summary_message_id: row.get(7)?,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
