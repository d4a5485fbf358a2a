//! Call budgets
//!
//! Sliding-window admission control keyed by user identity or by a single
//! global sentinel. A request handler holds two independent limiters (one
//! per user, one global) and a request must pass both.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use chatgate_core::ratelimit::{RateLimitConfig, RateLimitKey, SlidingWindowLimiter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = SlidingWindowLimiter::new(RateLimitConfig::new(2, Duration::from_secs(60)));
//! let key = RateLimitKey::user("42");
//!
//! assert!(limiter.try_admit(&key));
//! assert!(limiter.try_admit(&key));
//! assert!(!limiter.try_admit(&key));
//! assert!(limiter.retry_after(&key) > Duration::ZERO);
//! # }
//! ```

mod window;

pub use window::SlidingWindowLimiter;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifies whose budget a call is charged against
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitKey {
    /// A specific user identity
    User(String),
    /// The reserved sentinel shared by every caller
    Global,
}

impl RateLimitKey {
    pub fn user(id: impl Into<String>) -> Self {
        RateLimitKey::User(id.into())
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::User(id) => write!(f, "user:{}", id),
            RateLimitKey::Global => f.write_str("global"),
        }
    }
}

/// Which limiter rejected a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    User,
    Global,
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitScope::User => f.write_str("user"),
            RateLimitScope::Global => f.write_str("global"),
        }
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum admitted calls per window
    pub max_calls: usize,

    /// Window duration
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self { max_calls, window }
    }

    /// 5 calls per minute for each user
    pub fn per_user() -> Self {
        Self::new(5, Duration::from_secs(60))
    }

    /// 30 calls per minute across all users
    pub fn global() -> Self {
        Self::new(30, Duration::from_secs(60))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_user()
    }
}

/// Limits for both scopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "RateLimitConfig::per_user")]
    pub user: RateLimitConfig,

    #[serde(default = "RateLimitConfig::global")]
    pub global: RateLimitConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            user: RateLimitConfig::per_user(),
            global: RateLimitConfig::global(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(RateLimitKey::user("7").to_string(), "user:7");
        assert_eq!(RateLimitKey::Global.to_string(), "global");
    }

    #[test]
    fn test_default_limits() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.user.max_calls, 5);
        assert_eq!(limits.user.window, Duration::from_secs(60));
        assert_eq!(limits.global.max_calls, 30);
        assert_eq!(limits.global.window, Duration::from_secs(60));
    }

    #[test]
    fn test_config_deserializes_humantime() {
        let config: RateLimitConfig =
            serde_json::from_str(r#"{"max_calls": 3, "window": "10s"}"#).unwrap();
        assert_eq!(config, RateLimitConfig::new(3, Duration::from_secs(10)));
    }
}
