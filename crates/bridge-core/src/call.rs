//! Call state machine for real-time media signalling.
//!
//! Calls are kept in memory, keyed by call id, guarded by a single
//! reader-writer lock — the same ownership shape as [`crate::session`].
//! Answers are only accepted from the original callee; ICE candidates only
//! from the original caller.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::CallError;

/// Lifecycle state of a [`Call`].
///
/// `Invite` is the initial state. `Ended`, `Rejected`, `Failed`, and
/// `Expired` are terminal — no further transition is accepted once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// The caller has placed an invite; no answer yet.
    Invite,
    /// The bridge has observed the invite and is alerting the callee.
    Ringing,
    /// An answer has been exchanged; media may flow.
    Connected,
    /// The call ended normally (hangup).
    Ended,
    /// The callee declined.
    Rejected,
    /// An internal error terminated the call.
    Failed,
    /// The call's TTL elapsed before reaching a terminal outcome.
    Expired,
}

impl CallState {
    /// Whether this state is terminal — no further transition is accepted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::Failed | Self::Expired)
    }
}

/// A real-time call between two principals within a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Unique call id.
    pub id: String,
    /// Room (external scope) the call belongs to.
    pub room_id: String,
    /// Principal who placed the call.
    pub caller: String,
    /// Principal the call is directed to.
    pub callee: String,
    /// Current lifecycle state.
    pub state: CallState,
    /// When the call was created.
    pub created_at: DateTime<Utc>,
    /// Last time the call record changed.
    pub updated_at: DateTime<Utc>,
    /// When the answer was exchanged, if any.
    pub answered_at: Option<DateTime<Utc>>,
    /// TTL deadline for reaching a terminal outcome from `Invite`.
    pub expires_at: DateTime<Utc>,
    /// The caller's SDP offer.
    pub offer_sdp: String,
    /// The callee's SDP answer, once exchanged.
    pub answer_sdp: Option<String>,
    /// Accumulated ICE candidates from the caller.
    pub candidates: Vec<String>,
    /// Optional linked budget session id.
    pub budget_session_id: Option<String>,
}

/// Default time a call may remain in a non-terminal state before the TTL
/// enforcer expires it.
pub const DEFAULT_CALL_TTL_SECS: i64 = 120;

/// In-memory call registry.
pub struct CallManager {
    calls: RwLock<HashMap<String, Call>>,
}

impl Default for CallManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CallManager {
    /// Construct an empty call manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
        }
    }

    /// Start a new call in the `Invite` state.
    pub async fn start(&self, room_id: &str, caller: &str, callee: &str, offer_sdp: &str) -> Call {
        let now = Utc::now();
        let call = Call {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.to_owned(),
            caller: caller.to_owned(),
            callee: callee.to_owned(),
            state: CallState::Invite,
            created_at: now,
            updated_at: now,
            answered_at: None,
            expires_at: now + Duration::seconds(DEFAULT_CALL_TTL_SECS),
            offer_sdp: offer_sdp.to_owned(),
            answer_sdp: None,
            candidates: Vec::new(),
            budget_session_id: None,
        };

        let mut guard = self.calls.write().await;
        guard.insert(call.id.clone(), call.clone());

        info!(call_id = %call.id, room_id, caller, callee, "call started");
        call
    }

    /// Look up a call by id.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotFound`] if no such call exists.
    pub async fn get(&self, id: &str) -> Result<Call, CallError> {
        self.calls
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CallError::NotFound { id: id.to_owned() })
    }

    /// Transition an in-flight call to `Ringing`, once the bridge observes
    /// the invite. A no-op if the call is already past `Invite`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotFound`] if no such call exists, or
    /// [`CallError::Terminal`] if the call already reached a terminal state.
    pub async fn ring(&self, id: &str) -> Result<Call, CallError> {
        let mut guard = self.calls.write().await;
        let call = guard.get_mut(id).ok_or_else(|| CallError::NotFound { id: id.to_owned() })?;

        if call.state.is_terminal() {
            return Err(CallError::Terminal { id: id.to_owned(), state: call.state });
        }
        if call.state == CallState::Invite {
            call.state = CallState::Ringing;
            call.updated_at = Utc::now();
        }
        Ok(call.clone())
    }

    /// Record the callee's answer, transitioning the call to `Connected`.
    ///
    /// # Errors
    ///
    /// - [`CallError::NotFound`] if no such call exists.
    /// - [`CallError::Terminal`] if the call already reached a terminal state.
    /// - [`CallError::UnauthorizedParticipant`] if `answerer` is not the
    ///   original callee.
    /// - [`CallError::AlreadyAnswered`] if an answer was already recorded.
    pub async fn answer(&self, id: &str, answerer: &str, answer_sdp: &str) -> Result<Call, CallError> {
        let mut guard = self.calls.write().await;
        let call = guard.get_mut(id).ok_or_else(|| CallError::NotFound { id: id.to_owned() })?;

        if call.state.is_terminal() {
            return Err(CallError::Terminal { id: id.to_owned(), state: call.state });
        }
        if call.callee != answerer {
            return Err(CallError::UnauthorizedParticipant { id: id.to_owned() });
        }
        if call.answer_sdp.is_some() {
            return Err(CallError::AlreadyAnswered { id: id.to_owned() });
        }

        let now = Utc::now();
        call.answer_sdp = Some(answer_sdp.to_owned());
        call.answered_at = Some(now);
        call.state = CallState::Connected;
        call.updated_at = now;
        Ok(call.clone())
    }

    /// Append ICE candidates from the original caller.
    ///
    /// # Errors
    ///
    /// - [`CallError::NotFound`] if no such call exists.
    /// - [`CallError::Terminal`] if the call already reached a terminal state.
    /// - [`CallError::UnauthorizedParticipant`] if `sender` is not the
    ///   original caller.
    pub async fn add_candidates(&self, id: &str, sender: &str, candidates: Vec<String>) -> Result<Call, CallError> {
        let mut guard = self.calls.write().await;
        let call = guard.get_mut(id).ok_or_else(|| CallError::NotFound { id: id.to_owned() })?;

        if call.state.is_terminal() {
            return Err(CallError::Terminal { id: id.to_owned(), state: call.state });
        }
        if call.caller != sender {
            return Err(CallError::UnauthorizedParticipant { id: id.to_owned() });
        }

        call.candidates.extend(candidates);
        call.updated_at = Utc::now();
        Ok(call.clone())
    }

    /// Reject a call (callee declines). Terminal.
    ///
    /// # Errors
    ///
    /// - [`CallError::NotFound`] if no such call exists.
    /// - [`CallError::Terminal`] if the call already reached a terminal state.
    pub async fn reject(&self, id: &str) -> Result<Call, CallError> {
        self.transition_to_terminal(id, CallState::Rejected).await
    }

    /// End a call (hangup). Terminal. Idempotent if already `Ended`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotFound`] if no such call exists. Calling `end`
    /// on a call that is already terminal for a different reason (e.g.
    /// `Rejected`) returns [`CallError::Terminal`] — only an already-`Ended`
    /// call is treated as idempotent.
    pub async fn end(&self, id: &str) -> Result<Call, CallError> {
        let mut guard = self.calls.write().await;
        let call = guard.get_mut(id).ok_or_else(|| CallError::NotFound { id: id.to_owned() })?;

        if call.state == CallState::Ended {
            return Ok(call.clone());
        }
        if call.state.is_terminal() {
            return Err(CallError::Terminal { id: id.to_owned(), state: call.state });
        }

        call.state = CallState::Ended;
        call.updated_at = Utc::now();
        Ok(call.clone())
    }

    /// Mark a call as `Failed` due to an internal error.
    pub async fn fail(&self, id: &str) -> Result<Call, CallError> {
        self.transition_to_terminal(id, CallState::Failed).await
    }

    /// Mark a call as `Expired` (invoked by the TTL enforcer).
    pub async fn expire(&self, id: &str) -> Result<Call, CallError> {
        self.transition_to_terminal(id, CallState::Expired).await
    }

    async fn transition_to_terminal(&self, id: &str, state: CallState) -> Result<Call, CallError> {
        let mut guard = self.calls.write().await;
        let call = guard.get_mut(id).ok_or_else(|| CallError::NotFound { id: id.to_owned() })?;

        if call.state.is_terminal() {
            return Err(CallError::Terminal { id: id.to_owned(), state: call.state });
        }

        call.state = state;
        call.updated_at = Utc::now();
        Ok(call.clone())
    }

    /// Snapshot every call currently tracked (including terminal ones not
    /// yet garbage-collected).
    pub async fn list(&self) -> Vec<Call> {
        self.calls.read().await.values().cloned().collect()
    }

    /// Remove a call's record entirely.
    pub async fn remove(&self, id: &str) {
        self.calls.write().await.remove(id);
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager").finish_non_exhaustive()
    }
}

/// Shared handle alias used throughout the daemon.
pub type SharedCallManager = Arc<CallManager>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_creates_invite_state() {
        let mgr = CallManager::new();
        let call = mgr.start("!r:h", "alice", "bob", "v=0...").await;
        assert_eq!(call.state, CallState::Invite);
    }

    #[tokio::test]
    async fn answer_requires_original_callee() {
        let mgr = CallManager::new();
        let call = mgr.start("!r:h", "alice", "bob", "v=0...").await;

        let result = mgr.answer(&call.id, "eve", "v=0...answer").await;
        assert!(matches!(result, Err(CallError::UnauthorizedParticipant { .. })));

        let ok = mgr.answer(&call.id, "bob", "v=0...answer").await.unwrap();
        assert_eq!(ok.state, CallState::Connected);
    }

    #[tokio::test]
    async fn second_answer_is_rejected() {
        let mgr = CallManager::new();
        let call = mgr.start("!r:h", "alice", "bob", "v=0...").await;
        mgr.answer(&call.id, "bob", "first").await.unwrap();

        let result = mgr.answer(&call.id, "bob", "second").await;
        assert!(matches!(result, Err(CallError::AlreadyAnswered { .. })));
    }

    #[tokio::test]
    async fn candidates_require_original_caller() {
        let mgr = CallManager::new();
        let call = mgr.start("!r:h", "alice", "bob", "v=0...").await;

        let result = mgr.add_candidates(&call.id, "bob", vec!["cand1".to_owned()]).await;
        assert!(matches!(result, Err(CallError::UnauthorizedParticipant { .. })));

        let ok = mgr
            .add_candidates(&call.id, "alice", vec!["cand1".to_owned()])
            .await
            .unwrap();
        assert_eq!(ok.candidates, vec!["cand1"]);
    }

    #[tokio::test]
    async fn terminal_states_reject_further_transitions() {
        let mgr = CallManager::new();
        let call = mgr.start("!r:h", "alice", "bob", "v=0...").await;
        mgr.reject(&call.id).await.unwrap();

        let result = mgr.answer(&call.id, "bob", "late").await;
        assert!(matches!(result, Err(CallError::Terminal { .. })));
    }

    #[tokio::test]
    async fn end_is_idempotent_only_when_already_ended() {
        let mgr = CallManager::new();
        let call = mgr.start("!r:h", "alice", "bob", "v=0...").await;
        mgr.end(&call.id).await.unwrap();
        let second = mgr.end(&call.id).await.unwrap();
        assert_eq!(second.state, CallState::Ended);

        let call2 = mgr.start("!r:h", "alice", "bob", "v=0...").await;
        mgr.reject(&call2.id).await.unwrap();
        let result = mgr.end(&call2.id).await;
        assert!(matches!(result, Err(CallError::Terminal { .. })));
    }

    #[tokio::test]
    async fn ring_transitions_from_invite_only() {
        let mgr = CallManager::new();
        let call = mgr.start("!r:h", "alice", "bob", "v=0...").await;
        let ringing = mgr.ring(&call.id).await.unwrap();
        assert_eq!(ringing.state, CallState::Ringing);
    }
}
