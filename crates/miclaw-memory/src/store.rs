// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory store is closed")]
    Closed,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// One indexed workspace file, keyed by workspace-relative path.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryFile {
    pub path: String,
    /// SHA-256 hex of the file content.
    pub hash: String,
    pub mtime: i64,
    pub size: u64,
}

/// One embedded slice of a file.  The id is deterministic from path and
/// chunk index (`"<path>#<index>"`) so reindexing a file is idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryChunk {
    pub id: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub hash: String,
    pub text: String,
    /// Empty when the chunk has not been embedded.
    pub embedding: Vec<f32>,
}

/// A scored search result.  Higher scores are better for both primitives.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: MemoryChunk,
    pub score: f32,
}

/// SQLite store holding the file table, the chunk table, and an FTS5 mirror
/// of the chunk text kept in sync by triggers.  A single connection
/// serializes all access; reads see a consistent snapshot at statement
/// granularity.
pub struct MemoryStore {
    conn: Mutex<Option<Connection>>,
}

impl MemoryStore {
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
                CREATE TABLE IF NOT EXISTS files (
                    path TEXT PRIMARY KEY,
                    hash TEXT NOT NULL,
                    mtime INTEGER NOT NULL,
                    size INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS chunks (
                    id TEXT PRIMARY KEY,
                    path TEXT NOT NULL,
                    start_line INTEGER NOT NULL,
                    end_line INTEGER NOT NULL,
                    hash TEXT NOT NULL,
                    text TEXT NOT NULL,
                    embedding BLOB NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path);

                CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts
                    USING fts5(text, content='chunks', content_rowid='rowid');

                CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                    INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
                END;
                CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                    INSERT INTO chunks_fts(chunks_fts, rowid, text)
                        VALUES ('delete', old.rowid, old.text);
                END;
                CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
                    INSERT INTO chunks_fts(chunks_fts, rowid, text)
                        VALUES ('delete', old.rowid, old.text);
                    INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
                END;
                "#,
            )?;
            Ok(())
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().expect("memory mutex poisoned");
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(MemoryError::Closed),
        }
    }

    /// Release the connection; idempotent.
    pub fn close(&self) {
        let mut guard = self.conn.lock().expect("memory mutex poisoned");
        if guard.take().is_some() {
            debug!("memory store closed");
        }
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    pub fn put_file(&self, file: &MemoryFile) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO files (path, hash, mtime, size) VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(path) DO UPDATE SET hash = ?2, mtime = ?3, size = ?4
                "#,
                params![file.path, file.hash, file.mtime, file.size],
            )?;
            Ok(())
        })
    }

    pub fn get_file(&self, path: &str) -> Result<Option<MemoryFile>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT path, hash, mtime, size FROM files WHERE path = ?1",
                params![path],
                |row| {
                    Ok(MemoryFile {
                        path: row.get(0)?,
                        hash: row.get(1)?,
                        mtime: row.get(2)?,
                        size: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn list_file_paths(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT path FROM files ORDER BY path")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    /// Remove a file row and all its chunks (the FTS mirror follows via the
    /// delete trigger).
    pub fn delete_file(&self, path: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM chunks WHERE path = ?1", params![path])?;
            conn.execute("DELETE FROM files WHERE path = ?1", params![path])?;
            Ok(())
        })
    }

    // ── Chunks ────────────────────────────────────────────────────────────────

    pub fn put_chunk(&self, chunk: &MemoryChunk) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO chunks (id, path, start_line, end_line, hash, text, embedding, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET path = ?2, start_line = ?3, end_line = ?4,
                    hash = ?5, text = ?6, embedding = ?7, updated_at = ?8
                "#,
                params![
                    chunk.id,
                    chunk.path,
                    chunk.start_line,
                    chunk.end_line,
                    chunk.hash,
                    chunk.text,
                    encode_embedding(&chunk.embedding),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_chunks_by_path(&self, path: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM chunks WHERE path = ?1", params![path])?;
            Ok(())
        })
    }

    pub fn list_chunks_by_path(&self, path: &str) -> Result<Vec<MemoryChunk>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path, start_line, end_line, hash, text, embedding
                 FROM chunks WHERE path = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![path], row_to_chunk)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    pub fn count_chunks(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: u64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
            Ok(n)
        })
    }

    // ── Search ────────────────────────────────────────────────────────────────

    /// Lexical search via FTS5 MATCH.  Scores are `-rank` (higher is
    /// better); ties break by chunk id.
    pub fn search_fts(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT c.id, c.path, c.start_line, c.end_line, c.hash, c.text, c.embedding,
                       -chunks_fts.rank AS score
                FROM chunks_fts JOIN chunks c ON c.rowid = chunks_fts.rowid
                WHERE chunks_fts MATCH ?1
                ORDER BY chunks_fts.rank, c.id
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![fts_query(query), limit], |row| {
                let chunk = row_to_chunk(row)?;
                let score: f64 = row.get(7)?;
                Ok(SearchHit {
                    chunk,
                    score: score as f32,
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    /// Cosine-similarity search over all chunks with a non-empty embedding.
    /// Ordered by score descending, ties by chunk id ascending.
    pub fn search_vector(&self, query_vec: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path, start_line, end_line, hash, text, embedding
                 FROM chunks WHERE length(embedding) > 0",
            )?;
            let rows = stmt.query_map([], row_to_chunk)?;
            let mut hits: Vec<SearchHit> = Vec::new();
            for row in rows {
                let chunk = row?;
                let score = cosine(query_vec, &chunk.embedding);
                hits.push(SearchHit { chunk, score });
            }
            hits.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.chunk.id.cmp(&b.chunk.id))
            });
            hits.truncate(limit);
            Ok(hits)
        })
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryChunk> {
    let blob: Vec<u8> = row.get(6)?;
    Ok(MemoryChunk {
        id: row.get(0)?,
        path: row.get(1)?,
        start_line: row.get::<_, i64>(2)? as usize,
        end_line: row.get::<_, i64>(3)? as usize,
        hash: row.get(4)?,
        text: row.get(5)?,
        embedding: decode_embedding(&blob),
    })
}

/// Embeddings are serialized as raw little-endian f32 bytes; the dimension
/// is derived from the blob length.
pub(crate) fn encode_embedding(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub(crate) fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Quote each whitespace-separated term so FTS5 treats the input as plain
/// words rather than query syntax.
fn fts_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
