//! Session registry — the single source of truth for which sessions are live.
//!
//! Sessions are ephemeral and held only in memory, guarded by a single
//! reader-writer lock (no persistence through the barrier — unlike
//! credentials, a session carries no secret and does not need to survive a
//! daemon restart). Other components (budget tracker, call manager) hold
//! sessions by id and always go through this registry for the current state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::SessionError;

/// Upper bound on session TTL, regardless of what the caller requests.
pub const MAX_TTL_SECS: i64 = 60 * 60;

/// Lifecycle state of a [`Session`].
///
/// Transitions are monotonic in the order declared here: `Active` →
/// `Expiring` → `Expired` → `Ended`. No transition may move backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// The session is live and admits operations.
    Active,
    /// The session is nearing expiry; a one-shot warning has been emitted.
    Expiring,
    /// The TTL enforcer has transitioned the session past its deadline.
    Expired,
    /// The session has been explicitly or terminally ended.
    Ended,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Expiring => 1,
            Self::Expired => 2,
            Self::Ended => 3,
        }
    }

    /// Whether moving from `self` to `next` is a monotonic transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        next.rank() >= self.rank()
    }
}

/// A live session binding a container (agent) to a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque, unguessable session id.
    pub id: String,
    /// The container or agent id this session authorizes.
    pub container_id: String,
    /// External scope identifier (e.g. a Matrix room id).
    pub room_id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// `created_at + ttl`, clamped to [`MAX_TTL_SECS`].
    pub expires_at: DateTime<Utc>,
    /// Last time an operation touched this session.
    pub last_activity_at: DateTime<Utc>,
    /// Whether the one-shot near-expiry warning has already fired.
    pub warned: bool,
}

impl Session {
    /// Remaining time until expiry, as a fraction of the original TTL window
    /// starting from `created_at`. Returns `0.0` once past `expires_at`.
    #[must_use]
    pub fn remaining_fraction(&self, now: DateTime<Utc>) -> f64 {
        let total = (self.expires_at - self.created_at).num_milliseconds().max(1) as f64;
        let remaining = (self.expires_at - now).num_milliseconds().max(0) as f64;
        remaining / total
    }
}

/// In-memory registry of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a new session, clamping `requested_ttl_secs` to [`MAX_TTL_SECS`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTtl`] if `requested_ttl_secs` is not
    /// greater than zero.
    pub async fn create(
        &self,
        container_id: &str,
        room_id: &str,
        requested_ttl_secs: i64,
    ) -> Result<Session, SessionError> {
        if requested_ttl_secs <= 0 {
            return Err(SessionError::InvalidTtl);
        }

        let ttl_secs = requested_ttl_secs.min(MAX_TTL_SECS);
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: container_id.to_owned(),
            room_id: room_id.to_owned(),
            state: SessionState::Active,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            last_activity_at: now,
            warned: false,
        };

        let mut guard = self.sessions.write().await;
        guard.insert(session.id.clone(), session.clone());

        info!(session_id = %session.id, container_id, room_id, ttl_secs, "session created");
        Ok(session)
    }

    /// Look up a session by id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no such session exists.
    pub async fn get(&self, id: &str) -> Result<Session, SessionError> {
        let guard = self.sessions.read().await;
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound { id: id.to_owned() })
    }

    /// Transition a session to a new state.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] if no such session exists.
    /// - [`SessionError::InvalidTransition`] if the transition is not monotonic.
    pub async fn update_state(&self, id: &str, next: SessionState) -> Result<Session, SessionError> {
        let mut guard = self.sessions.write().await;
        let session = guard
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_owned() })?;

        if !session.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                id: id.to_owned(),
                from: session.state,
                to: next,
            });
        }

        session.state = next;
        session.last_activity_at = Utc::now();
        Ok(session.clone())
    }

    /// Mark the one-shot near-expiry warning as fired for a session.
    ///
    /// Returns `true` if this call is the one that set the flag (i.e. the
    /// warning should be emitted), `false` if it had already fired.
    pub async fn mark_warned(&self, id: &str) -> Result<bool, SessionError> {
        let mut guard = self.sessions.write().await;
        let session = guard
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_owned() })?;

        if session.warned {
            Ok(false)
        } else {
            session.warned = true;
            Ok(true)
        }
    }

    /// Snapshot every live session.
    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// End a session: transitions it to `Ended` regardless of its current
    /// state (as long as the transition is monotonic — `Ended` is terminal,
    /// so this only fails if the session has already moved past `Ended`,
    /// which cannot happen).
    ///
    /// Idempotent: ending an already-`Ended` session succeeds and returns the
    /// same terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no such session exists.
    pub async fn end(&self, id: &str) -> Result<Session, SessionError> {
        let mut guard = self.sessions.write().await;
        let session = guard
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_owned() })?;

        session.state = SessionState::Ended;
        session.last_activity_at = Utc::now();
        Ok(session.clone())
    }

    /// Remove a session's record entirely (garbage collection, one grace
    /// period after it reached `Ended`).
    pub async fn remove(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

/// Shared handle alias used throughout the daemon.
pub type SharedSessionRegistry = Arc<SessionRegistry>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_clamps_ttl_to_max() {
        let registry = SessionRegistry::new();
        let session = registry.create("c1", "!r:h", MAX_TTL_SECS * 10).await.unwrap();

        let ttl = (session.expires_at - session.created_at).num_seconds();
        assert_eq!(ttl, MAX_TTL_SECS);
    }

    #[tokio::test]
    async fn create_rejects_zero_ttl() {
        let registry = SessionRegistry::new();
        let result = registry.create("c1", "!r:h", 0).await;
        assert!(matches!(result, Err(SessionError::InvalidTtl)));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let registry = SessionRegistry::new();
        let result = registry.get("missing").await;
        assert!(matches!(result, Err(SessionError::NotFound { .. })));
    }

    #[tokio::test]
    async fn state_transitions_are_monotonic() {
        let registry = SessionRegistry::new();
        let session = registry.create("c1", "!r:h", 60).await.unwrap();

        registry
            .update_state(&session.id, SessionState::Expiring)
            .await
            .unwrap();
        registry
            .update_state(&session.id, SessionState::Expired)
            .await
            .unwrap();

        let result = registry.update_state(&session.id, SessionState::Active).await;
        assert!(matches!(result, Err(SessionError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = registry.create("c1", "!r:h", 60).await.unwrap();

        let first = registry.end(&session.id).await.unwrap();
        let second = registry.end(&session.id).await.unwrap();
        assert_eq!(first.state, SessionState::Ended);
        assert_eq!(second.state, SessionState::Ended);
    }

    #[tokio::test]
    async fn mark_warned_fires_once() {
        let registry = SessionRegistry::new();
        let session = registry.create("c1", "!r:h", 60).await.unwrap();

        assert!(registry.mark_warned(&session.id).await.unwrap());
        assert!(!registry.mark_warned(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn list_returns_all_sessions() {
        let registry = SessionRegistry::new();
        registry.create("c1", "!r:h", 60).await.unwrap();
        registry.create("c2", "!r:h", 60).await.unwrap();

        let sessions = registry.list().await;
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn remove_deletes_the_record() {
        let registry = SessionRegistry::new();
        let session = registry.create("c1", "!r:h", 60).await.unwrap();
        registry.end(&session.id).await.unwrap();
        registry.remove(&session.id).await;

        let result = registry.get(&session.id).await;
        assert!(matches!(result, Err(SessionError::NotFound { .. })));
    }
}
