// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Head/tail truncation for oversized command output.
//!
//! Errors and summaries almost always appear at the end of build/test
//! output, so preserving the tail is at least as important as preserving
//! the head.

/// Hard byte ceiling for combined stdout + stderr returned to the model.
pub const OUTPUT_LIMIT_BYTES: usize = 20_000;

const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

/// Keep the first and last lines of `text` with an omission marker in the
/// middle once it exceeds `limit` bytes.
pub fn head_tail_truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= HEAD_LINES + TAIL_LINES {
        // Few but huge lines; cut on a char boundary instead.
        let cut = floor_char_boundary(text, limit / 2);
        let tail_start = ceil_char_boundary(text, text.len() - limit / 2);
        return format!(
            "{}\n[... {} bytes omitted ...]\n{}",
            &text[..cut],
            text.len() - cut - (text.len() - tail_start),
            &text[tail_start..]
        );
    }
    let omitted = lines.len() - HEAD_LINES - TAIL_LINES;
    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[lines.len() - TAIL_LINES..].join("\n");
    format!("{head}\n[... {omitted} lines omitted ...]\n{tail}")
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
