// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Markdown → Signal text styles.
//!
//! Signal has no markup; formatting travels as `(start, length, style)`
//! spans next to a plain string.  Only the markdown subset that maps onto
//! Signal styles is interpreted; everything else passes through verbatim.
//! Offsets are in Unicode scalar values.

/// Styles understood by signal-cli's `send` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextStyle {
    Bold,
    Italic,
    Strikethrough,
    Monospace,
}

impl TextStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextStyle::Bold => "BOLD",
            TextStyle::Italic => "ITALIC",
            TextStyle::Strikethrough => "STRIKETHROUGH",
            TextStyle::Monospace => "MONOSPACE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleSpan {
    pub start: usize,
    pub length: usize,
    pub style: TextStyle,
}

/// Render markdown into `(plain_text, spans)`.
///
/// Recognized: `**bold**`, `*italic*`, `_italic_`, `~~strike~~`,
/// `` `code` ``, and fenced ``` blocks (monospace).  Unterminated markers
/// are treated as literal text.
pub fn render(markdown: &str) -> (String, Vec<StyleSpan>) {
    let chars: Vec<char> = markdown.chars().collect();
    let mut out = String::new();
    let mut out_len = 0usize; // chars in `out`
    let mut spans = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        // Fenced code block.
        if lookahead(&chars, i, "```") {
            if let Some(end) = find_seq(&chars, i + 3, "```") {
                // Skip an optional language tag line.
                let mut body_start = i + 3;
                if let Some(nl) = (body_start..end).find(|&k| chars[k] == '\n') {
                    let tag: String = chars[body_start..nl].iter().collect();
                    if !tag.trim().is_empty() && !tag.trim().contains(' ') {
                        body_start = nl + 1;
                    }
                }
                let body: String = chars[body_start..end].iter().collect();
                let body = body.trim_matches('\n');
                let start = out_len;
                push(&mut out, &mut out_len, body);
                spans.push(StyleSpan {
                    start,
                    length: out_len - start,
                    style: TextStyle::Monospace,
                });
                i = end + 3;
                continue;
            }
        }
        // Inline markers, longest first.
        let marker: Option<(&str, TextStyle)> = if lookahead(&chars, i, "**") {
            Some(("**", TextStyle::Bold))
        } else if lookahead(&chars, i, "~~") {
            Some(("~~", TextStyle::Strikethrough))
        } else if chars[i] == '`' {
            Some(("`", TextStyle::Monospace))
        } else if chars[i] == '*' {
            Some(("*", TextStyle::Italic))
        } else if chars[i] == '_' {
            Some(("_", TextStyle::Italic))
        } else {
            None
        };

        if let Some((marker, style)) = marker {
            let content_start = i + marker.chars().count();
            if let Some(end) = find_seq(&chars, content_start, marker) {
                if end > content_start {
                    let inner: String = chars[content_start..end].iter().collect();
                    let start = out_len;
                    push(&mut out, &mut out_len, &inner);
                    spans.push(StyleSpan {
                        start,
                        length: out_len - start,
                        style,
                    });
                    i = end + marker.chars().count();
                    continue;
                }
            }
        }

        out.push(chars[i]);
        out_len += 1;
        i += 1;
    }

    (out, spans)
}

fn lookahead(chars: &[char], at: usize, seq: &str) -> bool {
    let seq: Vec<char> = seq.chars().collect();
    chars.len() >= at + seq.len() && chars[at..at + seq.len()] == seq[..]
}

fn find_seq(chars: &[char], from: usize, seq: &str) -> Option<usize> {
    let seq: Vec<char> = seq.chars().collect();
    if seq.is_empty() || chars.len() < seq.len() {
        return None;
    }
    (from..=chars.len() - seq.len()).find(|&k| chars[k..k + seq.len()] == seq[..])
}

fn push(out: &mut String, out_len: &mut usize, text: &str) {
    out.push_str(text);
    *out_len += text.chars().count();
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let (text, spans) = render("just words");
        assert_eq!(text, "just words");
        assert!(spans.is_empty());
    }

    #[test]
    fn bold_produces_span_without_markers() {
        let (text, spans) = render("a **bold** word");
        assert_eq!(text, "a bold word");
        assert_eq!(
            spans,
            vec![StyleSpan {
                start: 2,
                length: 4,
                style: TextStyle::Bold
            }]
        );
    }

    #[test]
    fn italic_with_both_marker_kinds() {
        let (text, spans) = render("*a* and _b_");
        assert_eq!(text, "a and b");
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.style == TextStyle::Italic));
    }

    #[test]
    fn strikethrough_and_code() {
        let (text, spans) = render("~~gone~~ `kept`");
        assert_eq!(text, "gone kept");
        assert_eq!(spans[0].style, TextStyle::Strikethrough);
        assert_eq!(spans[1].style, TextStyle::Monospace);
        assert_eq!(spans[1].start, 5);
        assert_eq!(spans[1].length, 4);
    }

    #[test]
    fn fenced_block_is_monospace_without_fences() {
        let (text, spans) = render("see:\n```rust\nlet x = 1;\n```\ndone");
        assert!(text.contains("let x = 1;"));
        assert!(!text.contains("```"));
        assert!(!text.contains("rust"));
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].style, TextStyle::Monospace);
    }

    #[test]
    fn unterminated_marker_is_literal() {
        let (text, spans) = render("2 * 3 is six");
        assert_eq!(text, "2 * 3 is six");
        assert!(spans.is_empty());
    }

    #[test]
    fn offsets_count_unicode_scalars() {
        let (text, spans) = render("héé **b**");
        assert_eq!(text, "héé b");
        assert_eq!(spans[0].start, 4);
        assert_eq!(spans[0].length, 1);
    }

    #[test]
    fn empty_marker_pair_is_literal() {
        let (text, spans) = render("****");
        assert_eq!(text, "****");
        assert!(spans.is_empty());
    }
}
