//! Error types for chatgate operations

use std::time::Duration;

use crate::llm::MediaKind;
use crate::ratelimit::RateLimitScope;

/// Result type for chatgate operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Error types for the gateway
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// A limiter rejected the call
    #[error("{scope} rate limit reached, retry after {secs:.1}s", secs = .retry_after.as_secs_f64())]
    RateLimited {
        scope: RateLimitScope,
        retry_after: Duration,
    },

    /// The completion service refused the content
    #[error("Content blocked by safety settings")]
    BlockedContent,

    /// A single attempt against the completion service failed
    #[error("Attempt {attempt} failed: {cause}")]
    TransientFailure { attempt: usize, cause: String },

    /// Every attempt against the completion service failed
    #[error("Retries exhausted: {last_cause}")]
    ExhaustedRetries { last_cause: String },

    /// A turn was appended before the session was created
    #[error("No conversation session for user {user_id}")]
    SessionNotFound { user_id: String },

    /// Caller lacks the privilege for the requested operation
    #[error("Only administrators can clear all conversations")]
    Unauthorized,

    /// The upload does not match the requested analysis
    #[error("Expected {kind} content, got {mime_type}")]
    UnsupportedMedia { kind: MediaKind, mime_type: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Web search collaborator failed
    #[error("Search error: {0}")]
    Search(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl GateError {
    /// Message shown to the requester when this error ends a request.
    pub fn user_message(&self) -> String {
        match self {
            GateError::RateLimited {
                scope: RateLimitScope::User,
                retry_after,
            } => format!(
                "You're sending messages too quickly! Please wait {:.1} seconds before trying again.",
                retry_after.as_secs_f64()
            ),
            GateError::RateLimited {
                scope: RateLimitScope::Global,
                retry_after,
            } => format!(
                "The bot is handling too many requests right now. Please try again in {:.1} seconds.",
                retry_after.as_secs_f64()
            ),
            GateError::UnsupportedMedia { kind, .. } => match kind {
                MediaKind::Image => "Please attach an image to analyze.".to_string(),
                MediaKind::Video => "Please attach a video to analyze.".to_string(),
                MediaKind::Audio => "Please attach an audio file to analyze.".to_string(),
            },
            other => format!("Sorry, I encountered an error: {}", other),
        }
    }

    /// Whether this error ends the request without any retry
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GateError::TransientFailure { .. })
    }
}

impl From<String> for GateError {
    fn from(s: String) -> Self {
        GateError::Other(s)
    }
}

impl From<&str> for GateError {
    fn from(s: &str) -> Self {
        GateError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for GateError {
    fn from(err: anyhow::Error) -> Self {
        GateError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_messages_differ_by_scope() {
        let user = GateError::RateLimited {
            scope: RateLimitScope::User,
            retry_after: Duration::from_millis(6_960),
        };
        let global = GateError::RateLimited {
            scope: RateLimitScope::Global,
            retry_after: Duration::from_millis(12_040),
        };

        assert!(user.user_message().contains("wait 7.0 seconds"));
        assert!(global.user_message().contains("try again in 12.0 seconds"));
        assert_eq!(user.to_string(), "user rate limit reached, retry after 7.0s");
    }

    #[test]
    fn test_unsupported_media_message() {
        let err = GateError::UnsupportedMedia {
            kind: MediaKind::Audio,
            mime_type: "text/plain".into(),
        };
        assert_eq!(err.to_string(), "Expected audio content, got text/plain");
        assert_eq!(err.user_message(), "Please attach an audio file to analyze.");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(GateError::BlockedContent.is_terminal());
        assert!(GateError::Unauthorized.is_terminal());
        assert!(
            !GateError::TransientFailure {
                attempt: 1,
                cause: "timeout".into()
            }
            .is_terminal()
        );
    }
}
