// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{split_chunks, Embedder, MemoryChunk, MemoryFile, MemoryStore};

/// Files larger than this are skipped — they are unlikely to be prose or
/// code worth embedding and would dominate the index.
const MAX_FILE_SIZE: u64 = 512 * 1024;

/// Extensions considered text.  Everything else is ignored by the walk.
const TEXT_EXTENSIONS: &[&str] = &[
    "md", "txt", "rst", "rs", "go", "py", "js", "ts", "c", "h", "cpp", "hpp", "sh", "toml",
    "yaml", "yml", "json", "html", "css", "sql",
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// Incremental workspace indexer.
///
/// Each sync walks the workspace, re-embeds only files whose content hash
/// changed, and garbage-collects rows for files that disappeared.  Running
/// sync twice on an unchanged workspace issues zero embedding requests.
pub struct MemoryIndexer {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    workspace: PathBuf,
}

impl MemoryIndexer {
    pub fn new(store: Arc<MemoryStore>, embedder: Arc<dyn Embedder>, workspace: PathBuf) -> Self {
        Self {
            store,
            embedder,
            workspace,
        }
    }

    pub async fn sync(&self) -> anyhow::Result<SyncStats> {
        let mut stats = SyncStats::default();
        let mut seen: Vec<String> = Vec::new();

        for entry in WalkDir::new(&self.workspace)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()))
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !has_text_extension(path) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), "stat failed: {e}");
                    continue;
                }
            };
            if meta.len() > MAX_FILE_SIZE {
                stats.skipped += 1;
                continue;
            }

            let rel = relative_path(&self.workspace, path);
            stats.scanned += 1;
            seen.push(rel.clone());

            let content = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(_) => {
                    // Not valid UTF-8 despite the extension; skip.
                    stats.skipped += 1;
                    continue;
                }
            };
            let hash = sha256_hex(content.as_bytes());
            if let Some(existing) = self.store.get_file(&rel)? {
                if existing.hash == hash {
                    continue;
                }
            }

            self.index_file(&rel, &content, &hash, &meta).await?;
            stats.indexed += 1;
        }

        // GC: drop every file (and its chunks) not seen on this walk.
        for stored in self.store.list_file_paths()? {
            if !seen.contains(&stored) {
                debug!(path = %stored, "removing vanished file from index");
                self.store.delete_file(&stored)?;
                stats.removed += 1;
            }
        }

        Ok(stats)
    }

    async fn index_file(
        &self,
        rel: &str,
        content: &str,
        hash: &str,
        meta: &std::fs::Metadata,
    ) -> anyhow::Result<()> {
        self.store.delete_chunks_by_path(rel)?;

        let pieces = split_chunks(content);
        let texts: Vec<String> = pieces.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        for (idx, (piece, embedding)) in pieces.into_iter().zip(vectors).enumerate() {
            let chunk_hash = sha256_hex(piece.text.as_bytes());
            self.store.put_chunk(&MemoryChunk {
                id: format!("{rel}#{idx}"),
                path: rel.to_string(),
                start_line: piece.start_line,
                end_line: piece.end_line,
                hash: chunk_hash,
                text: piece.text,
                embedding,
            })?;
        }

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.store.put_file(&MemoryFile {
            path: rel.to_string(),
            hash: hash.to_string(),
            mtime,
            size: meta.len(),
        })?;
        Ok(())
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n != ".")
        .unwrap_or(false)
}

fn has_text_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| TEXT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Workspace-relative path, forward-slash normalized.
fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embedder that returns unit vectors and counts calls.
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if !texts.is_empty() {
                self.calls.fetch_add(1, Ordering::SeqCst);
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<MemoryStore>, Arc<CountingEmbedder>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        (dir, store, CountingEmbedder::new())
    }

    #[tokio::test]
    async fn sync_indexes_text_files() {
        let (dir, store, embedder) = setup();
        std::fs::write(dir.path().join("a.md"), "alpha beta gamma").unwrap();
        std::fs::write(dir.path().join("b.bin"), [0u8, 1, 2]).unwrap();
        let indexer =
            MemoryIndexer::new(store.clone(), embedder.clone(), dir.path().to_path_buf());
        let stats = indexer.sync().await.unwrap();
        assert_eq!(stats.indexed, 1);
        assert!(store.get_file("a.md").unwrap().is_some());
        assert_eq!(store.list_chunks_by_path("a.md").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_sync_on_unchanged_workspace_embeds_nothing() {
        let (dir, store, embedder) = setup();
        std::fs::write(dir.path().join("a.md"), "stable content").unwrap();
        let indexer =
            MemoryIndexer::new(store.clone(), embedder.clone(), dir.path().to_path_buf());

        indexer.sync().await.unwrap();
        let calls_after_first = embedder.calls();
        let chunks_before = store.list_chunks_by_path("a.md").unwrap();
        let file_before = store.get_file("a.md").unwrap();

        let stats = indexer.sync().await.unwrap();
        assert_eq!(stats.indexed, 0);
        assert_eq!(embedder.calls(), calls_after_first);
        assert_eq!(store.list_chunks_by_path("a.md").unwrap(), chunks_before);
        assert_eq!(store.get_file("a.md").unwrap(), file_before);
    }

    #[tokio::test]
    async fn changed_file_is_reembedded() {
        let (dir, store, embedder) = setup();
        let file = dir.path().join("a.md");
        std::fs::write(&file, "version one").unwrap();
        let indexer =
            MemoryIndexer::new(store.clone(), embedder.clone(), dir.path().to_path_buf());
        indexer.sync().await.unwrap();

        std::fs::write(&file, "version two").unwrap();
        let stats = indexer.sync().await.unwrap();
        assert_eq!(stats.indexed, 1);
        assert_eq!(embedder.calls(), 2);
        let chunks = store.list_chunks_by_path("a.md").unwrap();
        assert!(chunks[0].text.contains("version two"));
    }

    #[tokio::test]
    async fn deleted_file_is_garbage_collected() {
        let (dir, store, embedder) = setup();
        let file = dir.path().join("gone.md");
        std::fs::write(&file, "soon to vanish").unwrap();
        let indexer =
            MemoryIndexer::new(store.clone(), embedder.clone(), dir.path().to_path_buf());
        indexer.sync().await.unwrap();
        assert!(store.get_file("gone.md").unwrap().is_some());

        std::fs::remove_file(&file).unwrap();
        let stats = indexer.sync().await.unwrap();
        assert_eq!(stats.removed, 1);
        assert!(store.get_file("gone.md").unwrap().is_none());
        assert!(store.list_chunks_by_path("gone.md").unwrap().is_empty());
    }

    #[tokio::test]
    async fn nested_paths_are_forward_slash_normalized() {
        let (dir, store, embedder) = setup();
        std::fs::create_dir_all(dir.path().join("docs/sub")).unwrap();
        std::fs::write(dir.path().join("docs/sub/n.md"), "nested note").unwrap();
        let indexer =
            MemoryIndexer::new(store.clone(), embedder.clone(), dir.path().to_path_buf());
        indexer.sync().await.unwrap();
        assert!(store.get_file("docs/sub/n.md").unwrap().is_some());
    }

    #[tokio::test]
    async fn hidden_directories_are_skipped() {
        let (dir, store, embedder) = setup();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/x.md"), "internals").unwrap();
        let indexer =
            MemoryIndexer::new(store.clone(), embedder.clone(), dir.path().to_path_buf());
        let stats = indexer.sync().await.unwrap();
        assert_eq!(stats.scanned, 0);
        assert!(store.get_file(".git/x.md").unwrap().is_none());
    }

    #[test]
    fn chunk_ids_are_deterministic() {
        assert_eq!(format!("{}#{}", "a/b.md", 0), "a/b.md#0");
    }
}
