// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Paragraph-preferred text chunking for the memory indexer.
//!
//! Chunks target a fixed character width.  Whole lines are packed until the
//! target is reached; a blank line past half the target also flushes so
//! chunk boundaries prefer paragraph breaks.  A single line longer than the
//! target is hard-wrapped.  Each chunk after the first carries the previous
//! chunk's trailing characters as a prefix so search context does not lose
//! sentences that straddle a boundary.

/// Target chunk width in characters.
const CHUNK_WIDTH: usize = 2000;

/// Characters of the previous chunk prepended to the next one.
const CHUNK_OVERLAP: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// 1-based line range of the chunk's own content (the overlap prefix is
    /// not counted).
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

pub fn split_chunks(text: &str) -> Vec<TextChunk> {
    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut current = String::new();
    let mut current_start = 0usize;
    let mut current_end = 0usize;

    let flush =
        |chunks: &mut Vec<TextChunk>, current: &mut String, start: usize, end: usize| {
            if current.trim().is_empty() {
                current.clear();
                return;
            }
            let own = std::mem::take(current);
            let prefix = chunks
                .last()
                .map(|prev: &TextChunk| suffix_chars(&prev.text, CHUNK_OVERLAP))
                .unwrap_or_default();
            let text = if prefix.is_empty() {
                own
            } else {
                format!("{prefix}\n{own}")
            };
            chunks.push(TextChunk {
                start_line: start,
                end_line: end,
                text,
            });
        };

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;

        // Oversized single line: flush what we have, then hard-wrap it.
        if line.len() > CHUNK_WIDTH {
            flush(&mut chunks, &mut current, current_start, current_end);
            for piece in wrap_chars(line, CHUNK_WIDTH) {
                let mut piece = piece;
                flush(&mut chunks, &mut piece, line_no, line_no);
            }
            current_start = 0;
            continue;
        }

        if current.is_empty() {
            current_start = line_no;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
        current_end = line_no;

        let at_paragraph_break = line.trim().is_empty();
        if current.len() >= CHUNK_WIDTH
            || (at_paragraph_break && current.len() >= CHUNK_WIDTH / 2)
        {
            flush(&mut chunks, &mut current, current_start, current_end);
            current_start = 0;
        }
    }
    flush(&mut chunks, &mut current, current_start, current_end);
    chunks
}

/// Last `n` characters of `s`, respecting char boundaries.
fn suffix_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}

/// Split `s` into pieces of at most `width` characters.
fn wrap_chars(s: &str, width: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut piece = String::new();
    for c in s.chars() {
        piece.push(c);
        if piece.chars().count() >= width {
            pieces.push(std::mem::take(&mut piece));
        }
    }
    if !piece.is_empty() {
        pieces.push(piece);
    }
    pieces
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
