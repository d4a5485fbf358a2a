//! Request orchestration
//!
//! [`RequestHandler`] ties the limiters, the conversation store and the
//! retrying client together for each inbound request. It is transport
//! agnostic: a chat platform adapter or the bundled console calls it and
//! renders the results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::GateConfig;
use crate::conversation::{ConversationSession, ConversationStore, Reaper, SessionConfig};
use crate::error::{GateError, Result};
use crate::llm::{
    CompletionProvider, GenerateOptions, MediaKind, MediaPart, Reply, RetryConfig, RetryingClient,
};
use crate::ratelimit::{LimitsConfig, RateLimitKey, RateLimitScope, SlidingWindowLimiter};
use crate::search::{CITED_SOURCES, SearchProvider, SearchResult, summary_prompt};

/// Which conversations a forget request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForgetScope {
    /// The caller's own conversation
    #[serde(rename = "user")]
    Own,
    /// Every conversation (admin only)
    All,
}

impl std::str::FromStr for ForgetScope {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "user" | "self" | "me" => Ok(ForgetScope::Own),
            "all" => Ok(ForgetScope::All),
            other => Err(GateError::Other(format!(
                "Unknown forget target '{}', expected 'user' or 'all'",
                other
            ))),
        }
    }
}

/// When a user's conversation resets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExpiry {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Zero once the session is overdue for eviction
    #[serde(with = "humantime_serde")]
    pub remaining: Duration,
}

impl SessionExpiry {
    fn of(session: &ConversationSession, ttl: Duration, now: DateTime<Utc>) -> Self {
        let expires_at = session.expires_at(ttl);
        let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
        Self {
            user_id: session.user_id().to_string(),
            created_at: session.created_at(),
            expires_at,
            remaining,
        }
    }

    /// Whole days and leftover whole hours until reset
    pub fn days_and_hours(&self) -> (u64, u64) {
        let secs = self.remaining.as_secs();
        (secs / 86_400, (secs % 86_400) / 3_600)
    }
}

/// Result of a probe generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub reachable: bool,
    /// First 100 characters of the probe reply or the failure text
    pub sample: String,
}

/// Snapshot of the gateway's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub active_sessions: usize,
    pub sessions: Vec<SessionExpiry>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeResult>,
}

impl StatusReport {
    pub fn expiry_for(&self, user_id: &str) -> Option<&SessionExpiry> {
        self.sessions.iter().find(|s| s.user_id == user_id)
    }
}

/// Outcome of a search-and-summarize request
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// The search returned nothing; no summarization call was made
    NoResults,
    Summary {
        reply: Reply,
        /// Top results, for citation
        sources: Vec<SearchResult>,
        /// Thumbnail of the first result, if it has one
        thumbnail: Option<String>,
    },
}

/// Orchestrates admission, session lookup, completion and history updates.
pub struct RequestHandler {
    user_limiter: Arc<SlidingWindowLimiter>,
    global_limiter: Arc<SlidingWindowLimiter>,
    store: Arc<ConversationStore>,
    client: RetryingClient,
    search: Option<Arc<dyn SearchProvider>>,
    session_config: SessionConfig,
}

impl RequestHandler {
    pub fn builder() -> RequestHandlerBuilder {
        RequestHandlerBuilder::default()
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn user_limiter(&self) -> &Arc<SlidingWindowLimiter> {
        &self.user_limiter
    }

    pub fn global_limiter(&self) -> &Arc<SlidingWindowLimiter> {
        &self.global_limiter
    }

    /// A reaper over this handler's store and limiters
    pub fn reaper(&self) -> Reaper {
        Reaper::from_config(self.store.clone(), &self.session_config)
            .with_limiter(self.user_limiter.clone())
            .with_limiter(self.global_limiter.clone())
    }

    /// Charge one call to the user's budget and to the global budget.
    ///
    /// Both limiters are consulted on every call. A user-scope rejection is
    /// reported ahead of a global one.
    pub fn admit(&self, user_id: &str) -> Result<()> {
        let user_key = RateLimitKey::user(user_id);
        let user_ok = self.user_limiter.try_admit(&user_key);
        let global_ok = self.global_limiter.try_admit(&RateLimitKey::Global);

        if !user_ok {
            let retry_after = self.user_limiter.retry_after(&user_key);
            tracing::info!(
                user_id,
                retry_after_ms = retry_after.as_millis() as u64,
                "User rate limited"
            );
            return Err(GateError::RateLimited {
                scope: RateLimitScope::User,
                retry_after,
            });
        }
        if !global_ok {
            let retry_after = self.global_limiter.retry_after(&RateLimitKey::Global);
            tracing::warn!(
                retry_after_ms = retry_after.as_millis() as u64,
                "Global rate limit reached"
            );
            return Err(GateError::RateLimited {
                scope: RateLimitScope::Global,
                retry_after,
            });
        }
        Ok(())
    }

    /// Like [`admit`](Self::admit), but a rejection reports the longer of
    /// the two waits so one retry clears both budgets.
    pub fn admit_strictest(&self, user_id: &str) -> Result<()> {
        let user_key = RateLimitKey::user(user_id);
        let user_ok = self.user_limiter.try_admit(&user_key);
        let global_ok = self.global_limiter.try_admit(&RateLimitKey::Global);
        if user_ok && global_ok {
            return Ok(());
        }

        let retry_after = self
            .user_limiter
            .retry_after(&user_key)
            .max(self.global_limiter.retry_after(&RateLimitKey::Global));
        let scope = if user_ok {
            RateLimitScope::Global
        } else {
            RateLimitScope::User
        };
        tracing::info!(
            user_id,
            %scope,
            retry_after_ms = retry_after.as_millis() as u64,
            "Media request rate limited"
        );
        Err(GateError::RateLimited { scope, retry_after })
    }

    /// Answer `text` within the user's conversation.
    ///
    /// # Errors
    ///
    /// Only [`GateError::RateLimited`]. Completion failures come back as a
    /// non-generated [`Reply`].
    pub async fn ask(&self, user_id: &str, text: &str) -> Result<Reply> {
        self.ask_inner(user_id, text, None).await
    }

    /// Like [`ask`](Self::ask), abandoning the call when `cancel` fires.
    pub async fn ask_with_cancel(
        &self,
        user_id: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Reply> {
        self.ask_inner(user_id, text, Some(cancel)).await
    }

    async fn ask_inner(
        &self,
        user_id: &str,
        text: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Reply> {
        self.admit(user_id)?;

        let session = self.store.get_or_create(user_id);
        let reply = match cancel {
            Some(token) => self.client.send_with_cancel(&session, text, token).await,
            None => self.client.send(&session, text).await,
        };

        if reply.is_generated() {
            if let Err(e) = self.store.append_exchange(user_id, text, reply.text()) {
                // The session was cleared while the call was in flight
                tracing::warn!(user_id, error = %e, "Reply not recorded");
            }
        } else if let Some(failure) = reply.failure() {
            tracing::warn!(user_id, "{}", failure);
        }

        Ok(reply)
    }

    /// Clear conversations and return how many were removed.
    ///
    /// # Errors
    ///
    /// [`GateError::Unauthorized`] when an unauthorized caller asks for
    /// [`ForgetScope::All`]. Nothing is removed in that case.
    pub fn forget(&self, user_id: &str, scope: ForgetScope, is_authorized: bool) -> Result<usize> {
        match scope {
            ForgetScope::Own => {
                let removed = usize::from(self.store.delete(user_id));
                tracing::info!(user_id, removed, "Conversation reset");
                Ok(removed)
            }
            ForgetScope::All if is_authorized => {
                let removed = self.store.delete_all();
                tracing::info!(user_id, removed, "All conversations reset");
                Ok(removed)
            }
            ForgetScope::All => {
                tracing::warn!(user_id, "Unauthorized request to clear all conversations");
                Err(GateError::Unauthorized)
            }
        }
    }

    /// Active session count and per-user expiry
    pub fn status(&self) -> StatusReport {
        let now = self.store.now();
        let ttl = self.session_config.ttl;
        let sessions: Vec<SessionExpiry> = self
            .store
            .snapshot()
            .into_iter()
            .filter_map(|(user_id, _)| self.store.get(&user_id))
            .map(|session| SessionExpiry::of(&session, ttl, now))
            .collect();

        StatusReport {
            active_sessions: sessions.len(),
            sessions,
            model: self.client.provider().model_info().model_name,
            probe: None,
        }
    }

    /// [`status`](Self::status) plus a live probe of the completion service.
    ///
    /// The probe bypasses the rate limiters and the retry loop.
    pub async fn status_with_probe(&self) -> StatusReport {
        let mut report = self.status();
        let provider = self.client.provider();
        let probe = match provider
            .generate(&[], "Hello", &GenerateOptions::default())
            .await
        {
            Ok(text) => ProbeResult {
                reachable: true,
                sample: text.chars().take(100).collect(),
            },
            Err(e) => {
                tracing::error!(error = %e, "Status check failed");
                ProbeResult {
                    reachable: false,
                    sample: e.to_string(),
                }
            }
        };
        report.probe = Some(probe);
        report
    }

    /// When the user's conversation resets, if they have one
    pub fn expiry(&self, user_id: &str) -> Option<SessionExpiry> {
        let session = self.store.get(user_id)?;
        Some(SessionExpiry::of(
            &session,
            self.session_config.ttl,
            self.store.now(),
        ))
    }

    /// Search the web and summarize the results.
    ///
    /// Charged against the same budgets as [`ask`](Self::ask). The summary is
    /// a one-off call and does not touch the user's conversation.
    pub async fn search(&self, user_id: &str, query: &str) -> Result<SearchOutcome> {
        self.search_inner(user_id, query, None).await
    }

    pub async fn search_with_cancel(
        &self,
        user_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome> {
        self.search_inner(user_id, query, Some(cancel)).await
    }

    async fn search_inner(
        &self,
        user_id: &str,
        query: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<SearchOutcome> {
        let provider = self
            .search
            .as_ref()
            .ok_or_else(|| GateError::Configuration("Web search is not configured".to_string()))?;

        self.admit(user_id)?;

        let results = provider.search(query).await?;
        if results.is_empty() {
            tracing::info!(user_id, query, "Search returned no results");
            return Ok(SearchOutcome::NoResults);
        }

        let prompt = summary_prompt(query, &results);
        let reply = self.client.send_standalone(&prompt, cancel).await;
        let thumbnail = results.first().and_then(|r| r.thumbnail.clone());
        let sources = results.into_iter().take(CITED_SOURCES).collect();

        Ok(SearchOutcome::Summary {
            reply,
            sources,
            thumbnail,
        })
    }

    /// Describe an uploaded image, video or audio clip.
    ///
    /// The upload is checked before any budget is charged. The call is a
    /// one-off and does not touch the user's conversation.
    ///
    /// # Errors
    ///
    /// [`GateError::UnsupportedMedia`] when `mime_type` does not belong to
    /// `kind`, or [`GateError::RateLimited`].
    pub async fn analyze(
        &self,
        user_id: &str,
        kind: MediaKind,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<Reply> {
        self.analyze_inner(user_id, kind, MediaPart::new(mime_type, data), None)
            .await
    }

    pub async fn analyze_with_cancel(
        &self,
        user_id: &str,
        kind: MediaKind,
        mime_type: &str,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Reply> {
        self.analyze_inner(user_id, kind, MediaPart::new(mime_type, data), Some(cancel))
            .await
    }

    async fn analyze_inner(
        &self,
        user_id: &str,
        kind: MediaKind,
        media: MediaPart,
        cancel: Option<&CancellationToken>,
    ) -> Result<Reply> {
        if media.data.is_empty() || !kind.accepts(&media.mime_type) {
            return Err(GateError::UnsupportedMedia {
                kind,
                mime_type: media.mime_type,
            });
        }

        self.admit_strictest(user_id)?;

        let reply = self
            .client
            .send_media(kind.instruction(), &media, cancel)
            .await;
        if reply.is_generated() {
            tracing::info!(user_id, %kind, bytes = media.data.len(), "Media analyzed");
        } else if let Some(failure) = reply.failure() {
            tracing::error!(user_id, %kind, "Error processing {}: {}", kind, failure);
        }
        Ok(reply)
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("store", &self.store)
            .field("client", &self.client)
            .field("search", &self.search.is_some())
            .finish()
    }
}

/// Builder for [`RequestHandler`]
#[derive(Default)]
pub struct RequestHandlerBuilder {
    limits: LimitsConfig,
    session: SessionConfig,
    retry: RetryConfig,
    options: GenerateOptions,
    provider: Option<Arc<dyn CompletionProvider>>,
    search: Option<Arc<dyn SearchProvider>>,
    clock: Option<Arc<dyn Clock>>,
}

impl RequestHandlerBuilder {
    /// Take limits, session, retry and generation settings from `config`
    pub fn config(mut self, config: &GateConfig) -> Self {
        self.limits = config.limits.clone();
        self.session = config.session.clone();
        self.retry = config.retry.clone();
        self.options = config.llm.options.clone();
        self
    }

    pub fn limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn search_provider(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// # Errors
    ///
    /// Returns an error if no completion provider was set.
    pub fn build(self) -> Result<RequestHandler> {
        let provider = self.provider.ok_or_else(|| {
            GateError::Configuration("A completion provider is required".to_string())
        })?;

        let mut store = ConversationStore::with_opening(self.session.opening.clone());
        if let Some(clock) = self.clock {
            store = store.with_clock(clock);
        }

        Ok(RequestHandler {
            user_limiter: Arc::new(SlidingWindowLimiter::new(self.limits.user)),
            global_limiter: Arc::new(SlidingWindowLimiter::new(self.limits.global)),
            store: Arc::new(store),
            client: RetryingClient::new(provider, self.retry).with_options(self.options),
            search: self.search,
            session_config: self.session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubCompletionProvider;

    #[test]
    fn test_forget_scope_parsing() {
        assert_eq!("user".parse::<ForgetScope>().unwrap(), ForgetScope::Own);
        assert_eq!("".parse::<ForgetScope>().unwrap(), ForgetScope::Own);
        assert_eq!("ALL".parse::<ForgetScope>().unwrap(), ForgetScope::All);
        assert!("everyone".parse::<ForgetScope>().is_err());
    }

    #[test]
    fn test_builder_requires_provider() {
        let err = RequestHandler::builder().build().unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
    }

    #[test]
    fn test_unauthorized_forget_all_changes_nothing() {
        let handler = RequestHandler::builder()
            .provider(Arc::new(StubCompletionProvider))
            .build()
            .unwrap();
        handler.store().get_or_create("a");
        handler.store().get_or_create("b");

        let err = handler.forget("a", ForgetScope::All, false).unwrap_err();
        assert!(matches!(err, GateError::Unauthorized));
        assert_eq!(handler.store().len(), 2);

        assert_eq!(handler.forget("a", ForgetScope::Own, false).unwrap(), 1);
        assert_eq!(handler.forget("a", ForgetScope::Own, false).unwrap(), 0);
        assert_eq!(handler.forget("root", ForgetScope::All, true).unwrap(), 1);
        assert!(handler.store().is_empty());
    }

    #[test]
    fn test_days_and_hours() {
        let now = Utc::now();
        let expiry = SessionExpiry {
            user_id: "u".into(),
            created_at: now,
            expires_at: now,
            remaining: Duration::from_secs(3 * 86_400 + 5 * 3_600 + 59),
        };
        assert_eq!(expiry.days_and_hours(), (3, 5));
    }
}
