// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use miclaw_memory::{Embedder, MemoryStore, SearchHit};

use crate::tool::{Tool, ToolCall, ToolResult};

const VECTOR_WEIGHT: f32 = 0.7;
const FTS_WEIGHT: f32 = 0.3;

/// Hybrid semantic search over the workspace memory index.
///
/// The store only offers the two primitives (FTS rank, cosine); combining
/// them lives here: scores are normalized per list, then blended
/// 0.7·vector + 0.3·fts.  When the query cannot be embedded the search
/// degrades to lexical-only instead of failing.
pub struct MemorySearchTool {
    pub store: Arc<MemoryStore>,
    pub embedder: Arc<dyn Embedder>,
    pub min_score: f32,
    pub default_results: usize,
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search the workspace memory index (hybrid keyword + semantic). \
         Returns the most relevant chunks with path and line range."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "limit": { "type": "integer", "description": "Maximum results (optional)" }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(query) = call.str_arg("query") else {
            return Ok(ToolResult::err(&call.id, "missing 'query'"));
        };
        let limit = call.u64_arg("limit").unwrap_or(self.default_results as u64) as usize;
        debug!(query = %query, limit, "memory search");

        // Oversample both primitives so normalization has material to work
        // with before the final cut.
        let pool = (limit * 4).max(20);

        let fts_hits = match self.store.search_fts(query, pool) {
            Ok(h) => h,
            Err(e) => return Ok(ToolResult::err(&call.id, format!("search error: {e}"))),
        };

        let vector_hits = match self.embedder.embed_batch(&[query.to_string()]).await {
            Ok(mut vecs) if !vecs.is_empty() => {
                let qvec = vecs.remove(0);
                match self.store.search_vector(&qvec, pool) {
                    Ok(h) => h,
                    Err(e) => return Ok(ToolResult::err(&call.id, format!("search error: {e}"))),
                }
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!("query embedding failed, falling back to lexical only: {e}");
                Vec::new()
            }
        };

        let ranked = hybrid_rank(&vector_hits, &fts_hits, self.min_score, limit);
        if ranked.is_empty() {
            return Ok(ToolResult::ok(&call.id, "(no results)"));
        }

        let mut out = String::new();
        for (hit, score) in ranked {
            out.push_str(&format!(
                "{}:{}-{} (score {:.2})\n{}\n\n",
                hit.chunk.path,
                hit.chunk.start_line,
                hit.chunk.end_line,
                score,
                hit.chunk.text.trim()
            ));
        }
        Ok(ToolResult::ok(&call.id, out.trim_end().to_string()))
    }
}

/// Blend vector and FTS hits: per-list max-normalization, then
/// `0.7·vec + 0.3·fts` with a missing component contributing zero.
fn hybrid_rank(
    vector_hits: &[SearchHit],
    fts_hits: &[SearchHit],
    min_score: f32,
    limit: usize,
) -> Vec<(SearchHit, f32)> {
    let vec_max = vector_hits.iter().map(|h| h.score).fold(0.0f32, f32::max);
    let fts_max = fts_hits.iter().map(|h| h.score).fold(0.0f32, f32::max);

    let mut combined: HashMap<String, (SearchHit, f32)> = HashMap::new();
    for h in vector_hits {
        let norm = if vec_max > 0.0 { h.score / vec_max } else { 0.0 };
        combined.insert(h.chunk.id.clone(), (h.clone(), VECTOR_WEIGHT * norm));
    }
    for h in fts_hits {
        let norm = if fts_max > 0.0 { h.score / fts_max } else { 0.0 };
        combined
            .entry(h.chunk.id.clone())
            .and_modify(|(_, score)| *score += FTS_WEIGHT * norm)
            .or_insert_with(|| (h.clone(), FTS_WEIGHT * norm));
    }

    let mut ranked: Vec<(SearchHit, f32)> = combined
        .into_values()
        .filter(|(_, score)| *score >= min_score)
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.chunk.id.cmp(&b.0.chunk.id))
    });
    ranked.truncate(limit);
    ranked
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use miclaw_memory::MemoryChunk;

    fn hit(id: &str, score: f32) -> SearchHit {
        SearchHit {
            chunk: MemoryChunk {
                id: id.into(),
                path: id.into(),
                start_line: 1,
                end_line: 1,
                hash: "h".into(),
                text: "t".into(),
                embedding: vec![],
            },
            score,
        }
    }

    #[test]
    fn intersection_outscores_pure_vector() {
        let vector = vec![hit("both", 0.8), hit("vec_only", 0.8)];
        let fts = vec![hit("both", 2.0)];
        let ranked = hybrid_rank(&vector, &fts, 0.0, 10);
        let both = ranked.iter().find(|(h, _)| h.chunk.id == "both").unwrap();
        let vec_only = ranked.iter().find(|(h, _)| h.chunk.id == "vec_only").unwrap();
        // Same vector score, but the intersecting chunk gains the FTS share.
        assert!(both.1 > vec_only.1);
        assert!((both.1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn min_score_filters_weak_hits() {
        let vector = vec![hit("strong", 1.0), hit("weak", 0.01)];
        let ranked = hybrid_rank(&vector, &[], 0.5, 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].0.chunk.id, "strong");
    }

    #[test]
    fn fts_only_results_survive_when_no_vector() {
        let fts = vec![hit("lex", 3.0)];
        let ranked = hybrid_rank(&[], &fts, 0.1, 10);
        assert_eq!(ranked.len(), 1);
        assert!((ranked[0].1 - FTS_WEIGHT).abs() < 1e-6);
    }

    #[test]
    fn limit_truncates_ranked_output() {
        let vector: Vec<SearchHit> = (0..10).map(|i| hit(&format!("v{i}"), 1.0)).collect();
        let ranked = hybrid_rank(&vector, &[], 0.0, 3);
        assert_eq!(ranked.len(), 3);
    }
}
