//! In-memory session store

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{GateError, Result};

use super::session::{ConversationSession, ConversationTurn, default_opening, is_past_ttl};

/// Maps each user identity to at most one [`ConversationSession`].
///
/// Every operation takes the table lock once and never awaits under it, so
/// check-then-insert and check-then-delete are atomic. Readers get cloned
/// snapshots, never references into the table.
pub struct ConversationStore {
    sessions: RwLock<HashMap<String, ConversationSession>>,
    opening: Vec<ConversationTurn>,
    clock: Arc<dyn Clock>,
}

impl ConversationStore {
    /// Create an empty store using the default persona seed
    pub fn new() -> Self {
        Self::with_opening(default_opening())
    }

    /// Create an empty store seeding new sessions with `opening`
    pub fn with_opening(opening: Vec<ConversationTurn>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            opening,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ConversationSession>> {
        self.sessions.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ConversationSession>> {
        self.sessions.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Return the user's session, creating it on first use.
    ///
    /// An existing session is returned unchanged; `created_at` is never refreshed.
    pub fn get_or_create(&self, user_id: &str) -> ConversationSession {
        if let Some(session) = self.read().get(user_id) {
            return session.clone();
        }

        let mut sessions = self.write();
        sessions
            .entry(user_id.to_string())
            .or_insert_with(|| {
                tracing::info!(user_id, "Created new conversation");
                ConversationSession::new(user_id, self.opening.clone(), self.clock.now())
            })
            .clone()
    }

    pub fn get(&self, user_id: &str) -> Option<ConversationSession> {
        self.read().get(user_id).cloned()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.read().contains_key(user_id)
    }

    /// Remove one user's session
    pub fn delete(&self, user_id: &str) -> bool {
        self.write().remove(user_id).is_some()
    }

    /// Remove every session and return how many there were.
    ///
    /// Performs no authorization; callers gate it.
    pub fn delete_all(&self) -> usize {
        let mut sessions = self.write();
        let count = sessions.len();
        sessions.clear();
        count
    }

    /// Remove the user's session only if it is past `ttl` at `now`.
    ///
    /// A session recreated after a snapshot was taken is left alone.
    pub fn delete_expired(&self, user_id: &str, now: DateTime<Utc>, ttl: Duration) -> bool {
        let mut sessions = self.write();
        match sessions.get(user_id) {
            Some(session) if session.is_expired(now, ttl) => {
                sessions.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Append one turn to an existing session
    pub fn append_turn(&self, user_id: &str, turn: ConversationTurn) -> Result<()> {
        let now = self.clock.now();
        let mut sessions = self.write();
        let session = sessions
            .get_mut(user_id)
            .ok_or_else(|| GateError::SessionNotFound {
                user_id: user_id.to_string(),
            })?;
        session.push(turn, now);
        Ok(())
    }

    /// Append a prompt and its reply as one unit, so concurrent requests
    /// from the same user never interleave inside an exchange.
    pub fn append_exchange(
        &self,
        user_id: &str,
        prompt: impl Into<String>,
        reply: impl Into<String>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut sessions = self.write();
        let session = sessions
            .get_mut(user_id)
            .ok_or_else(|| GateError::SessionNotFound {
                user_id: user_id.to_string(),
            })?;
        session.push(ConversationTurn::user(prompt), now);
        session.push(ConversationTurn::assistant(reply), now);
        Ok(())
    }

    /// `(user_id, created_at)` for every session, sorted by creation time
    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut entries: Vec<_> = self
            .read()
            .iter()
            .map(|(user_id, session)| (user_id.clone(), session.created_at()))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    /// Users whose sessions are past `ttl` at `now`
    pub fn expired(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|(_, created_at)| is_past_ttl(*created_at, now, ttl))
            .map(|(user_id, _)| user_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("sessions", &self.len())
            .field("opening_turns", &self.opening.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::conversation::TurnRole;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn store_with_clock() -> (ConversationStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = ConversationStore::new().with_clock(clock.clone());
        (store, clock)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (store, clock) = store_with_clock();

        let first = store.get_or_create("alice");
        clock.advance(Duration::from_secs(3600));
        let second = store.get_or_create("alice");

        assert_eq!(first.created_at(), second.created_at());
        assert_eq!(store.len(), 1);
        assert_eq!(second.opening(), default_opening().as_slice());
    }

    #[test]
    fn test_delete_is_scoped_to_one_user() {
        let store = ConversationStore::new();
        store.get_or_create("alice");
        store.get_or_create("bob");
        store.append_turn("bob", ConversationTurn::user("keep me")).unwrap();

        assert!(store.delete("alice"));
        assert!(!store.delete("alice"));

        assert!(!store.contains("alice"));
        let bob = store.get("bob").unwrap();
        assert_eq!(bob.turns(), &[ConversationTurn::user("keep me")]);
    }

    #[test]
    fn test_delete_all_counts() {
        let store = ConversationStore::new();
        assert_eq!(store.delete_all(), 0);

        for user in ["a", "b", "c"] {
            store.get_or_create(user);
        }
        assert_eq!(store.delete_all(), 3);
        assert!(store.is_empty());
    }

    #[test]
    fn test_append_requires_session() {
        let store = ConversationStore::new();
        let err = store
            .append_turn("ghost", ConversationTurn::user("hello"))
            .unwrap_err();
        assert!(matches!(err, GateError::SessionNotFound { ref user_id } if user_id == "ghost"));

        let err = store.append_exchange("ghost", "q", "a").unwrap_err();
        assert!(matches!(err, GateError::SessionNotFound { .. }));
    }

    #[test]
    fn test_append_exchange_keeps_order() {
        let store = ConversationStore::new();
        store.get_or_create("alice");
        store.append_exchange("alice", "one", "1").unwrap();
        store.append_exchange("alice", "two", "2").unwrap();

        let session = store.get("alice").unwrap();
        let roles: Vec<_> = session.turns().iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![TurnRole::User, TurnRole::Assistant, TurnRole::User, TurnRole::Assistant]
        );
        assert_eq!(session.turns()[2].content, "two");
    }

    #[test]
    fn test_snapshot_and_expired() {
        let (store, clock) = store_with_clock();
        store.get_or_create("old");
        clock.advance(DAY * 2);
        store.get_or_create("young");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "old");

        clock.advance(DAY * 6);
        assert_eq!(store.expired(clock.now(), DAY * 7), vec!["old".to_string()]);
    }

    #[test]
    fn test_delete_expired_skips_recreated_session() {
        let (store, clock) = store_with_clock();
        store.get_or_create("alice");
        clock.advance(DAY * 8);
        let stale = store.expired(clock.now(), DAY * 7);
        assert_eq!(stale, vec!["alice".to_string()]);

        // User clears and starts over before the sweep reaches them
        store.delete("alice");
        store.get_or_create("alice");

        assert!(!store.delete_expired("alice", clock.now(), DAY * 7));
        assert!(store.contains("alice"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_share_one_session() {
        let store = Arc::new(ConversationStore::new());
        let mut handles = Vec::new();

        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.get_or_create("alice").created_at() }));
        }

        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.await.unwrap());
        }

        assert_eq!(store.len(), 1);
        assert!(stamps.windows(2).all(|w| w[0] == w[1]));
    }
}
