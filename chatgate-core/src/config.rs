//! Configuration types for chatgate

use serde::{Deserialize, Serialize};

use crate::conversation::SessionConfig;
use crate::llm::{GenerateOptions, RetryConfig};
use crate::ratelimit::LimitsConfig;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GateConfig {
    /// Per-user and global call budgets
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Session lifetime and persona seed
    #[serde(default)]
    pub session: SessionConfig,

    /// Retry policy for the completion service
    #[serde(default)]
    pub retry: RetryConfig,

    /// Completion service configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Web search configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// User ids allowed to clear every conversation
    #[serde(default)]
    pub admins: Vec<String>,
}

/// Completion service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model name
    pub model: String,

    /// API key (if unset, providers read it from their env var)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL (for custom endpoints)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Generation options sent with every call
    #[serde(default)]
    pub options: GenerateOptions,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gemini-1.5-pro".to_string(),
            api_key: None,
            base_url: None,
            options: GenerateOptions::default(),
        }
    }
}

/// Web search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Enable the search command
    #[serde(default = "default_search_enabled")]
    pub enabled: bool,

    /// API key (if unset, read from `SERPAPI_KEY`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_search_base_url")]
    pub base_url: String,

    /// Results requested per query
    #[serde(default = "default_num_results")]
    pub num_results: usize,
}

fn default_search_enabled() -> bool {
    true
}

fn default_search_base_url() -> String {
    "https://serpapi.com".to_string()
}

fn default_num_results() -> usize {
    8
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: default_search_enabled(),
            api_key: None,
            base_url: default_search_base_url(),
            num_results: default_num_results(),
        }
    }
}

impl GateConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (chatgate.toml, then the path in CHATGATE_CONFIG_PATH)
    /// 3. Environment variable overrides (`CHATGATE_SECTION__KEY`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is invalid or a value fails validation.
    pub fn load() -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(GateConfig::default()))
            .merge(Toml::file("chatgate.toml"));

        if let Ok(path) = std::env::var("CHATGATE_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: GateConfig = figment
            .merge(Env::prefixed("CHATGATE_").ignore(&["CONFIG_PATH"]).split("__"))
            .extract()
            .map_err(|e| {
                crate::error::GateError::Configuration(format!(
                    "Failed to load configuration: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: GateConfig = Figment::from(Serialized::defaults(GateConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()
            .map_err(|e| {
                crate::error::GateError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Whether `user_id` may clear every conversation
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.iter().any(|admin| admin == user_id)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit, duration or attempt count is zero.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: &str| Err(crate::error::GateError::Configuration(msg.to_string()));

        for (name, limit) in [("user", &self.limits.user), ("global", &self.limits.global)] {
            if limit.max_calls == 0 {
                return invalid(&format!("limits.{}.max_calls must be positive", name));
            }
            if limit.window.is_zero() {
                return invalid(&format!("limits.{}.window must be positive", name));
            }
        }
        if self.session.ttl.is_zero() {
            return invalid("session.ttl must be positive");
        }
        if self.session.reap_interval.is_zero() {
            return invalid("session.reap_interval must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.search.num_results == 0 {
            return invalid("search.num_results must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = GateConfig::default();
        assert_eq!(config.limits.user.max_calls, 5);
        assert_eq!(config.limits.global.max_calls, 30);
        assert_eq!(config.session.ttl, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.session.reap_interval, Duration::from_secs(24 * 3600));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_overrides_some_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
admins = ["1001"]

[limits.user]
max_calls = 3
window = "10s"

[session]
ttl = "2days"
reap_interval = "1h"

[retry]
max_attempts = 5
base_delay = "500ms"
max_delay = "30s"
backoff_multiplier = 2.0
"#
        )
        .unwrap();

        let config = GateConfig::from_file(file.path()).unwrap();
        assert_eq!(config.limits.user.max_calls, 3);
        assert_eq!(config.limits.user.window, Duration::from_secs(10));
        assert_eq!(config.limits.global.max_calls, 30);
        assert_eq!(config.session.ttl, Duration::from_secs(2 * 24 * 3600));
        assert_eq!(config.session.opening.len(), 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.is_admin("1001"));
        assert!(!config.is_admin("1002"));
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let mut config = GateConfig::default();
        config.limits.global.max_calls = 0;
        assert!(config.validate().is_err());

        let mut config = GateConfig::default();
        config.session.ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = GateConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_file_is_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[limits.user]\nmax_calls = \"lots\"").unwrap();

        let err = GateConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, crate::error::GateError::Configuration(_)));
    }
}
