use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::ConversationTurn;

/// Options for a single generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Temperature for generation (0.0-2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<usize>,
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: usize) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }
}

/// Why the completion service did not return text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    /// Content-policy rejection. Never retried.
    #[error("content blocked: {0}")]
    Blocked(String),

    /// Anything else. Retried with backoff.
    #[error("{0}")]
    Transient(String),
}

/// Trait for completion service implementations.
///
/// Implementors receive the accumulated context (opening template plus prior
/// turns) and the new input, and classify failures as blocked or transient.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Generate a reply to `input` given the prior `context`.
    async fn generate(
        &self,
        context: &[ConversationTurn],
        input: &str,
        options: &GenerateOptions,
    ) -> std::result::Result<String, CompletionError>;

    /// Generate a reply to `input` about the attached `media`, with no prior
    /// context. Providers without multimodal support fail every call.
    async fn generate_with_media(
        &self,
        input: &str,
        media: &MediaPart,
        options: &GenerateOptions,
    ) -> std::result::Result<String, CompletionError> {
        let _ = (input, options);
        Err(CompletionError::Transient(format!(
            "{} input is not supported by this provider",
            media.mime_type
        )))
    }

    /// Get model information
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "unknown".to_string(),
            model_name: "unknown".to_string(),
        }
    }
}

/// Model information
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub provider: String,
    pub model_name: String,
}

/// Provider used when no completion service is configured; every call fails.
pub struct StubCompletionProvider;

#[async_trait]
impl CompletionProvider for StubCompletionProvider {
    async fn generate(
        &self,
        _context: &[ConversationTurn],
        _input: &str,
        _options: &GenerateOptions,
    ) -> std::result::Result<String, CompletionError> {
        Err(CompletionError::Transient(
            "Completion provider not configured".to_string(),
        ))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "stub".to_string(),
            model_name: "none".to_string(),
        }
    }
}

pub mod media;
pub mod providers;
pub mod retry;

pub use media::{MEDIA_MAX_OUTPUT_TOKENS, MediaKind, MediaPart, mime_for_path};
pub use retry::{EXHAUSTED_PREFIX, REFUSAL_TEXT, Reply, ReplyKind, RetryConfig, RetryingClient};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_options() {
        let options = GenerateOptions::new()
            .with_temperature(0.4)
            .with_max_output_tokens(2048);

        assert_eq!(options.temperature, Some(0.4));
        assert_eq!(options.max_output_tokens, Some(2048));
    }

    #[test]
    fn test_temperature_clamping() {
        let options = GenerateOptions::new().with_temperature(5.0);
        assert_eq!(options.temperature, Some(2.0));

        let options = GenerateOptions::new().with_temperature(-1.0);
        assert_eq!(options.temperature, Some(0.0));
    }

    #[tokio::test]
    async fn test_stub_provider() {
        let provider = StubCompletionProvider;
        let result = provider
            .generate(&[], "test", &GenerateOptions::default())
            .await;
        assert!(matches!(result, Err(CompletionError::Transient(_))));
        assert_eq!(provider.model_info().provider, "stub");
    }

    #[tokio::test]
    async fn test_media_unsupported_by_default() {
        let media = MediaPart::new("image/png", vec![0x89, 0x50]);
        let result = StubCompletionProvider
            .generate_with_media("describe", &media, &GenerateOptions::default())
            .await;
        match result {
            Err(CompletionError::Transient(cause)) => assert!(cause.contains("image/png")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
