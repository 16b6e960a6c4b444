// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod chunker;
mod embed;
mod store;
mod sync;

pub use chunker::{split_chunks, TextChunk};
pub use embed::{EmbedClient, Embedder};
pub use store::{MemoryChunk, MemoryError, MemoryFile, MemoryStore, SearchHit};
pub use sync::{MemoryIndexer, SyncStats};
