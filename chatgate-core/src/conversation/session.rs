//! Conversation Session

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The requester
    User,
    /// The completion service
    Assistant,
}

/// One message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// The persona seed every new session starts with
pub fn default_opening() -> Vec<ConversationTurn> {
    vec![
        ConversationTurn::user("Hi!"),
        ConversationTurn::assistant(
            "Hello! I am 911 Intel, an AI assistant designed by kelpyshades!",
        ),
        ConversationTurn::user("Please give helpful and concise answers."),
        ConversationTurn::assistant(
            "I'll do my best to provide you with accurate and concise information. How can I assist you today?",
        ),
    ]
}

/// Per-user conversational memory.
///
/// The opening template is fixed at creation; only `turns` grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    user_id: String,
    opening: Vec<ConversationTurn>,
    turns: Vec<ConversationTurn>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConversationSession {
    /// Create a session seeded with `opening`
    pub fn new(
        user_id: impl Into<String>,
        opening: Vec<ConversationTurn>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            opening,
            turns: Vec::new(),
            created_at,
            updated_at: created_at,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When a turn was last appended
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn opening(&self) -> &[ConversationTurn] {
        &self.opening
    }

    /// Turns appended after the opening template
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// Number of completed user/assistant exchanges
    pub fn exchange_count(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| t.role == TurnRole::Assistant)
            .count()
    }

    /// Full context to send with the next request: opening, then history
    pub fn context(&self) -> Vec<ConversationTurn> {
        self.opening.iter().chain(self.turns.iter()).cloned().collect()
    }

    pub(crate) fn push(&mut self, turn: ConversationTurn, at: DateTime<Utc>) {
        self.turns.push(turn);
        self.updated_at = at;
    }

    /// Instant after which the session is eligible for eviction
    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        self.created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether `now - created_at > ttl`. Activity does not extend the lifetime.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        is_past_ttl(self.created_at, now, ttl)
    }
}

pub(crate) fn is_past_ttl(created_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    match ChronoDuration::from_std(ttl) {
        Ok(ttl) => now.signed_duration_since(created_at) > ttl,
        Err(_) => false,
    }
}
