// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity and running totals of one conversation thread.
///
/// The id is assigned by the channel adapter (e.g. `webhook:<hook-id>`,
/// `signal:dm:<uuid>`, `cron`) and is stable for the life of the
/// conversation.  Sessions are created lazily on first input and never
/// deleted by the runtime itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub parent_session_id: Option<String>,
    pub title: String,
    pub message_count: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    /// Set after a compaction replaced the history with a summary.
    pub summary_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            parent_session_id: None,
            title: String::new(),
            message_count: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            summary_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_with_zero_totals() {
        let s = Session::new("webhook:test");
        assert_eq!(s.id, "webhook:test");
        assert_eq!(s.message_count, 0);
        assert_eq!(s.cost, 0.0);
        assert!(s.summary_message_id.is_none());
    }
}
