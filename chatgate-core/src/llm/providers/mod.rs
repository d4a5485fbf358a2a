//! Completion provider implementations

#[cfg(feature = "llm-gemini")]
pub mod gemini;

#[cfg(feature = "llm-gemini")]
pub use gemini::GeminiProvider;
