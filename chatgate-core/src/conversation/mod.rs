//! Conversation Memory
//!
//! Per-user conversation sessions with a fixed opening template, a shared
//! store, and a reaper that evicts sessions older than their time-to-live.
//!
//! # Example
//!
//! ```rust
//! use chatgate_core::conversation::{ConversationStore, ConversationTurn};
//!
//! let store = ConversationStore::new();
//! let session = store.get_or_create("user-1");
//! assert_eq!(session.turns().len(), 0);
//!
//! store.append_turn("user-1", ConversationTurn::user("Hello!")).unwrap();
//! assert_eq!(store.get("user-1").unwrap().turns().len(), 1);
//! ```

mod reaper;
mod session;
mod store;

pub use reaper::Reaper;
pub use session::{ConversationSession, ConversationTurn, TurnRole, default_opening};
pub use store::ConversationStore;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session lifetime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Age after which a session is evicted (7 days)
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub ttl: Duration,

    /// How often the reaper sweeps (24 hours)
    #[serde(with = "humantime_serde", default = "default_reap_interval")]
    pub reap_interval: Duration,

    /// Persona seed prepended to every new session
    #[serde(default = "default_opening")]
    pub opening: Vec<ConversationTurn>,
}

fn default_ttl() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            reap_interval: default_reap_interval(),
            opening: default_opening(),
        }
    }
}
