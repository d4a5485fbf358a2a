//! Gemini completion provider

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::conversation::{ConversationTurn, TurnRole};
use crate::error::{GateError, Result};
use crate::llm::{CompletionError, CompletionProvider, GenerateOptions, MediaPart, ModelInfo};

const DEFAULT_MODEL: &str = "gemini-1.5-pro";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Finish reasons that mean the output was withheld for policy reasons
const BLOCKING_FINISH_REASONS: &[&str] = &["SAFETY", "BLOCKLIST", "PROHIBITED_CONTENT", "SPII"];

/// Google Gemini `generateContent` provider.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiProvider {
    /// Create a new Gemini provider.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Gemini API key
    /// * `model` - Model name (e.g., "gemini-1.5-pro")
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point at a different endpoint (proxies, test servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Create from environment variables.
    ///
    /// Reads from:
    /// - `GEMINI_API_KEY` - API key (required)
    /// - `GEMINI_MODEL` - Model name (optional, defaults to "gemini-1.5-pro")
    ///
    /// # Errors
    ///
    /// Returns an error if GEMINI_API_KEY is not set.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|_| {
            GateError::Configuration("GEMINI_API_KEY environment variable not set".to_string())
        })?;
        let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::new(api_key, model))
    }

    /// Create from configuration, falling back to `GEMINI_API_KEY` for the key.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = match &config.api_key {
            Some(key) => key.clone(),
            None => std::env::var("GEMINI_API_KEY").map_err(|_| {
                GateError::Configuration(
                    "No Gemini API key in configuration or GEMINI_API_KEY".to_string(),
                )
            })?,
        };

        let mut provider = Self::new(api_key, config.model.clone());
        if let Some(base_url) = &config.base_url {
            provider = provider.with_base_url(base_url.clone());
        }
        Ok(provider)
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiBlob>,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

/// Base64 payload sent inline with the request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

fn build_request(
    context: &[ConversationTurn],
    input: &str,
    options: &GenerateOptions,
) -> GeminiRequest {
    let mut contents: Vec<GeminiContent> = context
        .iter()
        .map(|turn| GeminiContent {
            role: match turn.role {
                TurnRole::User => "user".to_string(),
                TurnRole::Assistant => "model".to_string(),
            },
            parts: vec![GeminiPart::text(turn.content.as_str())],
        })
        .collect();
    contents.push(GeminiContent {
        role: "user".to_string(),
        parts: vec![GeminiPart::text(input)],
    });

    GeminiRequest {
        contents,
        generation_config: generation_config(options),
    }
}

/// Instruction and media travel together in a single user turn
fn build_media_request(input: &str, media: &MediaPart, options: &GenerateOptions) -> GeminiRequest {
    let blob = GeminiBlob {
        mime_type: media.mime_type.clone(),
        data: base64::engine::general_purpose::STANDARD.encode(&media.data),
    };
    GeminiRequest {
        contents: vec![GeminiContent {
            role: "user".to_string(),
            parts: vec![
                GeminiPart::text(input),
                GeminiPart {
                    text: None,
                    inline_data: Some(blob),
                },
            ],
        }],
        generation_config: generation_config(options),
    }
}

fn generation_config(options: &GenerateOptions) -> Option<GeminiGenerationConfig> {
    if options.temperature.is_none() && options.max_output_tokens.is_none() {
        return None;
    }
    Some(GeminiGenerationConfig {
        temperature: options.temperature,
        max_output_tokens: options.max_output_tokens,
    })
}

fn interpret_response(response: GeminiResponse) -> std::result::Result<String, CompletionError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(CompletionError::Blocked(reason));
    }

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| {
            CompletionError::Transient("Gemini API returned no candidates".to_string())
        })?;

    if let Some(reason) = candidate.finish_reason.as_deref() {
        if BLOCKING_FINISH_REASONS.contains(&reason) {
            return Err(CompletionError::Blocked(reason.to_string()));
        }
    }

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        return Err(CompletionError::Transient(
            "Gemini API returned an empty candidate".to_string(),
        ));
    }
    Ok(text)
}

impl GeminiProvider {
    async fn post(&self, request: &GeminiRequest) -> std::result::Result<String, CompletionError> {
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                CompletionError::Transient(format!("Failed to send request to Gemini: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CompletionError::Transient(format!(
                "Gemini API error ({}): {}",
                status, text
            )));
        }

        let parsed: GeminiResponse = response.json().await.map_err(|e| {
            CompletionError::Transient(format!("Failed to parse Gemini response: {}", e))
        })?;

        interpret_response(parsed)
    }
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    async fn generate(
        &self,
        context: &[ConversationTurn],
        input: &str,
        options: &GenerateOptions,
    ) -> std::result::Result<String, CompletionError> {
        self.post(&build_request(context, input, options)).await
    }

    async fn generate_with_media(
        &self,
        input: &str,
        media: &MediaPart,
        options: &GenerateOptions,
    ) -> std::result::Result<String, CompletionError> {
        tracing::debug!(
            mime_type = %media.mime_type,
            bytes = media.data.len(),
            "Sending inline media to Gemini"
        );
        self.post(&build_media_request(input, media, options)).await
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "gemini".to_string(),
            model_name: self.model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::default_opening;

    fn parse(json: &str) -> GeminiResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_request_maps_roles_and_appends_input() {
        let request = build_request(
            &default_opening(),
            "What's new?",
            &GenerateOptions::new().with_max_output_tokens(2048),
        );
        let json = serde_json::to_value(&request).unwrap();

        let contents = json["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 5);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[4]["parts"][0]["text"], "What's new?");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 2048);
        assert!(json["generationConfig"].get("temperature").is_none());
    }

    #[test]
    fn test_request_without_options_omits_config() {
        let request = build_request(&[], "hi", &GenerateOptions::default());
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("generationConfig").is_none());
    }

    #[test]
    fn test_media_request_inlines_base64() {
        let media = MediaPart::new("audio/ogg", b"OggS".to_vec());
        let request = build_media_request(
            "Transcribe this",
            &media,
            &GenerateOptions::new().with_max_output_tokens(1024),
        );
        let json = serde_json::to_value(&request).unwrap();

        let contents = json["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        let parts = contents[0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["text"], "Transcribe this");
        assert!(parts[0].get("inlineData").is_none());
        assert_eq!(parts[1]["inlineData"]["mimeType"], "audio/ogg");
        assert_eq!(parts[1]["inlineData"]["data"], "T2dnUw==");
        assert!(parts[1].get("text").is_none());
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn test_text_is_joined() {
        let response = parse(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello, "},{"text":"world"}]},"finishReason":"STOP"}]}"#,
        );
        assert_eq!(interpret_response(response).unwrap(), "Hello, world");
    }

    #[test]
    fn test_prompt_block_is_blocked() {
        let response = parse(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#);
        assert_eq!(
            interpret_response(response),
            Err(CompletionError::Blocked("SAFETY".into()))
        );
    }

    #[test]
    fn test_safety_finish_is_blocked() {
        let response = parse(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#);
        assert!(matches!(
            interpret_response(response),
            Err(CompletionError::Blocked(_))
        ));
    }

    #[test]
    fn test_no_candidates_is_transient() {
        let response = parse(r#"{"candidates":[]}"#);
        assert!(matches!(
            interpret_response(response),
            Err(CompletionError::Transient(_))
        ));
    }

    #[test]
    fn test_provider_creation() {
        let provider = GeminiProvider::new("key", "gemini-1.5-flash")
            .with_base_url("http://localhost:8080/v1beta/");
        assert_eq!(provider.model(), "gemini-1.5-flash");
        assert_eq!(
            provider.endpoint(),
            "http://localhost:8080/v1beta/models/gemini-1.5-flash:generateContent"
        );
        assert_eq!(provider.model_info().provider, "gemini");
    }
}
