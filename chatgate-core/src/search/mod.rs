//! Web search collaborator
//!
//! Results are only used as input to a summarization call; presentation is
//! left to the transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::error::Result;

#[cfg(feature = "search-serpapi")]
pub mod serpapi;

#[cfg(feature = "search-serpapi")]
pub use serpapi::SerpApiProvider;

/// Snippet used when a result has none
pub const MISSING_SNIPPET: &str = "No description available.";

/// Number of results cited back to the requester
pub const CITED_SOURCES: usize = 5;

/// One organic search result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// Trait for web search implementations
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Results in ranking order. An empty vector means nothing was found.
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;
}

/// Render results as a numbered list for the summarizer.
pub fn format_results(results: &[SearchResult]) -> String {
    let mut formatted = String::new();
    for (i, result) in results.iter().enumerate() {
        let _ = write!(
            formatted,
            "[{}] {}\nURL: {}\nSnippet: {}\n\n",
            i + 1,
            result.title,
            result.link,
            result.snippet
        );
    }
    formatted
}

/// Build the prompt asking for a cited summary of `results`.
pub fn summary_prompt(query: &str, results: &[SearchResult]) -> String {
    format!(
        "I searched the web for: \"{query}\"\n\n\
         Here are the search results:\n\
         {results}\n\
         Please provide a comprehensive but concise summary based on these search results.\n\
         Answer the query \"{query}\" using the information from these sources.\n\
         Include the most relevant facts and cite your sources using [1], [2], etc.\n\
         Format your response in a way that's easy to read.",
        query = query,
        results = format_results(results),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(n: usize) -> SearchResult {
        SearchResult {
            title: format!("Title {}", n),
            link: format!("https://example.com/{}", n),
            snippet: format!("Snippet {}", n),
            thumbnail: None,
        }
    }

    #[test]
    fn test_format_results_numbers_from_one() {
        let formatted = format_results(&[result(1), result(2)]);
        assert!(formatted.starts_with(
            "[1] Title 1\nURL: https://example.com/1\nSnippet: Snippet 1\n\n[2] Title 2"
        ));
    }

    #[test]
    fn test_summary_prompt_mentions_query_and_citations() {
        let prompt = summary_prompt("rust async", &[result(1)]);
        assert!(prompt.contains("I searched the web for: \"rust async\""));
        assert!(prompt.contains("[1] Title 1"));
        assert!(prompt.contains("cite your sources using [1], [2]"));
    }

    #[test]
    fn test_empty_results_format_to_nothing() {
        assert_eq!(format_results(&[]), "");
    }
}
