//! # Chatgate
//!
//! Chatgate mediates access from many concurrent users to a rate-limited,
//! stateful completion service. It provides:
//! - Sliding-window call budgets, per user and global
//! - Per-user conversation memory with a fixed persona seed
//! - Time-to-live eviction of conversations by a background reaper
//! - Bounded retries with exponential backoff around the completion call
//! - One-off web search summaries and image, video or audio analysis
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatgate_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = GateConfig::load()?;
//!     let handler = RequestHandler::builder()
//!         .config(&config)
//!         .provider(Arc::new(GeminiProvider::from_config(&config.llm)?))
//!         .build()?;
//!
//!     let reply = handler.ask("user-1", "What is a sliding window?").await?;
//!     println!("{}", reply.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `llm-gemini`: Gemini `generateContent` provider (default)
//! - `search-serpapi`: SerpAPI web search provider (default)

pub mod clock;
pub mod config;
pub mod conversation;
pub mod error;
pub mod handler;
pub mod llm;
pub mod ratelimit;
pub mod search;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{GateConfig, LlmConfig, SearchConfig};
    pub use crate::conversation::{
        ConversationSession, ConversationStore, ConversationTurn, Reaper, SessionConfig,
        TurnRole, default_opening,
    };
    pub use crate::error::{GateError, Result};
    pub use crate::handler::{
        ForgetScope, ProbeResult, RequestHandler, RequestHandlerBuilder, SearchOutcome,
        SessionExpiry, StatusReport,
    };
    pub use crate::llm::{
        CompletionError, CompletionProvider, GenerateOptions, MediaKind, MediaPart, ModelInfo,
        Reply, ReplyKind, RetryConfig, RetryingClient, StubCompletionProvider, mime_for_path,
    };
    pub use crate::ratelimit::{
        LimitsConfig, RateLimitConfig, RateLimitKey, RateLimitScope, SlidingWindowLimiter,
    };
    pub use crate::search::{SearchProvider, SearchResult};

    #[cfg(feature = "llm-gemini")]
    pub use crate::llm::providers::GeminiProvider;

    #[cfg(feature = "search-serpapi")]
    pub use crate::search::SerpApiProvider;
}
