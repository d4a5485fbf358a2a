//! SerpAPI search provider

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::SearchConfig;
use crate::error::{GateError, Result};

use super::{MISSING_SNIPPET, SearchProvider, SearchResult};

const DEFAULT_BASE_URL: &str = "https://serpapi.com";

/// Google results through SerpAPI's JSON endpoint.
pub struct SerpApiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    num_results: usize,
}

impl SerpApiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            num_results: 8,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_num_results(mut self, num_results: usize) -> Self {
        self.num_results = num_results.max(1);
        self
    }

    /// Create from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if SERPAPI_KEY is not set.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("SERPAPI_KEY").map_err(|_| {
            GateError::Configuration("Missing SerpAPI key in environment variables".to_string())
        })?;
        Ok(Self::new(api_key))
    }

    /// Create from configuration, falling back to `SERPAPI_KEY` for the key.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let provider = match &config.api_key {
            Some(key) => Self::new(key.clone()),
            None => Self::from_env()?,
        };
        Ok(provider
            .with_base_url(config.base_url.clone())
            .with_num_results(config.num_results))
    }

    fn url(&self, query: &str) -> String {
        format!(
            "{}/search.json?q={}&api_key={}&num={}",
            self.base_url,
            urlencoding::encode(query),
            urlencoding::encode(&self.api_key),
            self.num_results
        )
    }
}

#[derive(Debug, Deserialize)]
struct SerpApiResponse {
    organic_results: Option<Vec<OrganicResult>>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    snippet: Option<String>,
    thumbnail: Option<String>,
}

fn collect_results(response: SerpApiResponse, limit: usize) -> Vec<SearchResult> {
    response
        .organic_results
        .unwrap_or_default()
        .into_iter()
        .take(limit)
        .map(|item| SearchResult {
            title: item.title,
            link: item.link,
            snippet: item.snippet.unwrap_or_else(|| MISSING_SNIPPET.to_string()),
            thumbnail: item.thumbnail,
        })
        .collect()
}

#[async_trait]
impl SearchProvider for SerpApiProvider {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let response = self
            .client
            .get(self.url(query))
            .send()
            .await
            .map_err(|e| GateError::Search(format!("Failed to reach SerpAPI: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(status = %status, "SerpAPI error: {}", text);
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(GateError::Search(
                    "Search API authentication failed. Please check your SerpAPI key.".to_string(),
                ));
            }
            return Err(GateError::Search(format!(
                "Search API returned status {}",
                status.as_u16()
            )));
        }

        let parsed: SerpApiResponse = response
            .json()
            .await
            .map_err(|e| GateError::Search(format!("Failed to parse SerpAPI response: {}", e)))?;

        Ok(collect_results(parsed, self.num_results))
    }
}
