//! Retry Logic for the Completion Service
//!
//! Bounded retries with exponential backoff. Content-policy rejections end
//! the loop at once, and exhausted retries become display text, so callers
//! always get a [`Reply`] back.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::conversation::{ConversationSession, ConversationTurn};
use crate::error::GateError;

use super::{
    CompletionError, CompletionProvider, GenerateOptions, MEDIA_MAX_OUTPUT_TOKENS, MediaPart,
};

/// Returned in place of a reply when the service blocks the content
pub const REFUSAL_TEXT: &str =
    "I'm sorry, but I cannot respond to that request as it may violate content safety guidelines.";

/// Leads the text returned once every attempt has failed
pub const EXHAUSTED_PREFIX: &str =
    "I'm experiencing technical difficulties. Please try again later. Error:";

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: usize,
    /// Delay after the first failed attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Maximum delay between attempts
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Builder: set max attempts
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Builder: set base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Builder: set max delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Builder: set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Delay after the failure of attempt `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let clamped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(clamped.max(0.0))
    }
}

/// How a [`RetryingClient`] call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    /// The service produced text
    Generated,
    /// The service blocked the content; the text is [`REFUSAL_TEXT`]
    Refused,
    /// Every attempt failed; the text embeds the last cause
    Exhausted { last_cause: String },
    /// The caller went away before an answer arrived
    Cancelled,
}

/// Text for the requester plus how it was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub text: String,
    pub attempts: usize,
}

impl Reply {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Only generated replies belong in conversation history
    pub fn is_generated(&self) -> bool {
        self.kind == ReplyKind::Generated
    }

    /// The terminal error this reply stands in for, if any
    pub fn failure(&self) -> Option<GateError> {
        match &self.kind {
            ReplyKind::Generated | ReplyKind::Cancelled => None,
            ReplyKind::Refused => Some(GateError::BlockedContent),
            ReplyKind::Exhausted { last_cause } => Some(GateError::ExhaustedRetries {
                last_cause: last_cause.clone(),
            }),
        }
    }
}

/// Wraps a [`CompletionProvider`] with retries and backoff.
#[derive(Clone)]
pub struct RetryingClient {
    provider: Arc<dyn CompletionProvider>,
    config: RetryConfig,
    options: GenerateOptions,
}

impl RetryingClient {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: RetryConfig) -> Self {
        Self {
            provider,
            config,
            options: GenerateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn CompletionProvider> {
        &self.provider
    }

    /// Send `prompt` with the session's accumulated context.
    pub async fn send(&self, session: &ConversationSession, prompt: &str) -> Reply {
        let context = session.context();
        self.run(Request::Text(&context, prompt), &self.options, None)
            .await
    }

    /// Like [`send`](Self::send), but gives up when `cancel` fires.
    pub async fn send_with_cancel(
        &self,
        session: &ConversationSession,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Reply {
        let context = session.context();
        self.run(Request::Text(&context, prompt), &self.options, Some(cancel))
            .await
    }

    /// Send `prompt` with no conversational context
    pub async fn send_standalone(&self, prompt: &str, cancel: Option<&CancellationToken>) -> Reply {
        self.run(Request::Text(&[], prompt), &self.options, cancel)
            .await
    }

    /// Send `prompt` with attached media and no conversational context.
    ///
    /// Output is capped at [`MEDIA_MAX_OUTPUT_TOKENS`].
    pub async fn send_media(
        &self,
        prompt: &str,
        media: &MediaPart,
        cancel: Option<&CancellationToken>,
    ) -> Reply {
        let options = self
            .options
            .clone()
            .with_max_output_tokens(MEDIA_MAX_OUTPUT_TOKENS);
        self.run(Request::Media(prompt, media), &options, cancel)
            .await
    }

    async fn run(
        &self,
        request: Request<'_>,
        options: &GenerateOptions,
        cancel: Option<&CancellationToken>,
    ) -> Reply {
        let max_attempts = self.config.max_attempts.max(1);
        let prompt = request.prompt();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let call = match request {
                Request::Text(context, prompt) => self.provider.generate(context, prompt, options),
                Request::Media(prompt, media) => {
                    self.provider.generate_with_media(prompt, media, options)
                }
            };
            let outcome = match cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => return cancelled(attempt),
                    outcome = call => outcome,
                },
                None => call.await,
            };

            let cause = match outcome {
                Ok(text) => {
                    return Reply {
                        kind: ReplyKind::Generated,
                        text,
                        attempts: attempt,
                    };
                }
                Err(CompletionError::Blocked(reason)) => {
                    let preview: String = prompt.chars().take(50).collect();
                    tracing::warn!(
                        reason = %reason,
                        "Content blocked by safety settings: {}...",
                        preview
                    );
                    return Reply {
                        kind: ReplyKind::Refused,
                        text: REFUSAL_TEXT.to_string(),
                        attempts: attempt,
                    };
                }
                Err(CompletionError::Transient(cause)) => cause,
            };

            let failure = GateError::TransientFailure {
                attempt,
                cause: cause.clone(),
            };
            tracing::error!(attempt, max_attempts, "{}", failure);

            if attempt >= max_attempts {
                return Reply {
                    kind: ReplyKind::Exhausted {
                        last_cause: cause.clone(),
                    },
                    text: format!("{} {}", EXHAUSTED_PREFIX, cause),
                    attempts: attempt,
                };
            }

            let delay = self.config.delay_for_attempt(attempt - 1);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");

            match cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => return cancelled(attempt),
                    _ = tokio::time::sleep(delay) => {}
                },
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// One provider call, replayed on each attempt
#[derive(Clone, Copy)]
enum Request<'a> {
    Text(&'a [ConversationTurn], &'a str),
    Media(&'a str, &'a MediaPart),
}

impl<'a> Request<'a> {
    fn prompt(&self) -> &'a str {
        match self {
            Request::Text(_, prompt) | Request::Media(prompt, _) => prompt,
        }
    }
}

fn cancelled(attempts: usize) -> Reply {
    tracing::debug!(attempts, "Completion request cancelled");
    Reply {
        kind: ReplyKind::Cancelled,
        text: "Request cancelled.".to_string(),
        attempts,
    }
}

impl std::fmt::Debug for RetryingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingClient")
            .field("model", &self.provider.model_info().model_name)
            .field("config", &self.config)
            .finish()
    }
}
