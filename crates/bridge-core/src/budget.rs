//! Per-session token and wall-clock budget accounting.
//!
//! Each [`BudgetSession`] has its own small critical section inside a
//! concurrent map keyed by session id — this matches the session registry's
//! ownership shape rather than sharing a single lock across the whole
//! tracker, so `record` calls for different sessions never contend.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::BudgetError;

/// Per-session token and time budget, with warn/stop thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSession {
    /// Session this budget belongs to.
    pub session_id: String,
    /// Linked call id, if any.
    pub call_id: Option<String>,
    /// Room id, copied for convenience.
    pub room_id: String,
    /// Hard token limit (input + output).
    pub token_limit: u64,
    /// Hard wall-clock duration limit, in seconds.
    pub duration_limit_secs: i64,
    /// Cumulative input tokens recorded.
    pub input_tokens: u64,
    /// Cumulative output tokens recorded.
    pub output_tokens: u64,
    /// Number of `record` calls.
    pub request_count: u64,
    /// Model tag of the most recent `record` call.
    pub model: String,
    /// Whether this budget session has been closed.
    pub closed: bool,
    /// Whether the warning threshold has already fired.
    pub warned: bool,
    /// When the budget session started.
    pub start_time: DateTime<Utc>,
    /// When the budget session ended, if it has.
    pub end_time: Option<DateTime<Utc>>,
}

impl BudgetSession {
    fn used(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Policy parameters for the budget tracker, configured process-wide.
#[derive(Debug, Clone, Copy)]
pub struct BudgetPolicy {
    /// Fraction of the limit at which a one-shot warning fires, in `[0, 1]`.
    pub warning_threshold: f64,
    /// Whether crossing the hard limit closes the budget session and
    /// returns [`BudgetError::BudgetExceeded`] / [`BudgetError::DurationExceeded`].
    pub hard_stop: bool,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            warning_threshold: 0.8,
            hard_stop: true,
        }
    }
}

/// Tracks token and duration budgets for every active session.
pub struct BudgetTracker {
    sessions: RwLock<HashMap<String, BudgetSession>>,
    policy: BudgetPolicy,
}

impl BudgetTracker {
    /// Construct a tracker with the given enforcement policy.
    #[must_use]
    pub fn new(policy: BudgetPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Register a new budget session and start its clock.
    pub async fn start_session(
        &self,
        session_id: &str,
        call_id: Option<String>,
        room_id: &str,
        token_limit: u64,
        duration_limit_secs: i64,
    ) -> BudgetSession {
        let budget = BudgetSession {
            session_id: session_id.to_owned(),
            call_id,
            room_id: room_id.to_owned(),
            token_limit,
            duration_limit_secs,
            input_tokens: 0,
            output_tokens: 0,
            request_count: 0,
            model: String::new(),
            closed: false,
            warned: false,
            start_time: Utc::now(),
            end_time: None,
        };

        let mut guard = self.sessions.write().await;
        guard.insert(session_id.to_owned(), budget.clone());

        info!(session_id, token_limit, duration_limit_secs, "budget session started");
        budget
    }

    /// Record usage against a budget session, atomically adding counters and
    /// checking thresholds.
    ///
    /// # Errors
    ///
    /// - [`BudgetError::NotFound`] if no budget session is registered.
    /// - [`BudgetError::Closed`] if the budget session was already closed.
    /// - [`BudgetError::BudgetExceeded`] if usage crosses the hard token
    ///   limit under `hard_stop` policy — the session is closed as part of
    ///   this call.
    pub async fn record(
        &self,
        session_id: &str,
        input: u64,
        output: u64,
        model: &str,
    ) -> Result<(), BudgetError> {
        let mut guard = self.sessions.write().await;
        let budget = guard
            .get_mut(session_id)
            .ok_or_else(|| BudgetError::NotFound {
                session_id: session_id.to_owned(),
            })?;

        if budget.closed {
            return Err(BudgetError::Closed {
                session_id: session_id.to_owned(),
            });
        }

        budget.input_tokens = budget.input_tokens.saturating_add(input);
        budget.output_tokens = budget.output_tokens.saturating_add(output);
        budget.request_count = budget.request_count.saturating_add(1);
        budget.model = model.to_owned();

        let used = budget.used();
        let warning_mark = (budget.token_limit as f64 * self.policy.warning_threshold) as u64;

        if !budget.warned && budget.token_limit > 0 && used >= warning_mark {
            budget.warned = true;
            warn!(session_id, used, limit = budget.token_limit, "budget nearing limit");
        }

        if budget.token_limit > 0 && used >= budget.token_limit {
            if self.policy.hard_stop {
                budget.closed = true;
                budget.end_time = Some(Utc::now());
                return Err(BudgetError::BudgetExceeded {
                    session_id: session_id.to_owned(),
                    used,
                    limit: budget.token_limit,
                });
            }
        }

        Ok(())
    }

    /// Check whether a budget session has exceeded its wall-clock duration limit.
    ///
    /// # Errors
    ///
    /// - [`BudgetError::NotFound`] if no budget session is registered.
    /// - [`BudgetError::Closed`] if the budget session was already closed.
    /// - [`BudgetError::DurationExceeded`] if the elapsed time exceeds the limit.
    pub async fn check_duration(&self, session_id: &str) -> Result<(), BudgetError> {
        let mut guard = self.sessions.write().await;
        let budget = guard
            .get_mut(session_id)
            .ok_or_else(|| BudgetError::NotFound {
                session_id: session_id.to_owned(),
            })?;

        if budget.closed {
            return Err(BudgetError::Closed {
                session_id: session_id.to_owned(),
            });
        }

        let elapsed = (Utc::now() - budget.start_time).num_seconds();
        if budget.duration_limit_secs > 0 && elapsed >= budget.duration_limit_secs {
            if self.policy.hard_stop {
                budget.closed = true;
                budget.end_time = Some(Utc::now());
            }
            return Err(BudgetError::DurationExceeded {
                session_id: session_id.to_owned(),
                elapsed_secs: elapsed,
                limit_secs: budget.duration_limit_secs,
            });
        }

        Ok(())
    }

    /// End a budget session, finalizing its counters. Idempotent.
    pub async fn end_session(&self, session_id: &str) {
        let mut guard = self.sessions.write().await;
        if let Some(budget) = guard.get_mut(session_id) {
            if !budget.closed {
                budget.closed = true;
                budget.end_time = Some(Utc::now());
                info!(session_id, used = budget.used(), "budget session ended");
            }
        }
    }

    /// Look up a budget session's current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::NotFound`] if no budget session is registered.
    pub async fn get(&self, session_id: &str) -> Result<BudgetSession, BudgetError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| BudgetError::NotFound {
                session_id: session_id.to_owned(),
            })
    }

    /// Remove a budget session's record entirely, so a later `record` or
    /// `checkDuration` call against the same id reports `NotFound` rather
    /// than `Closed`.
    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Snapshot every non-closed budget session, for the periodic
    /// enforcement sweep.
    pub async fn list_open(&self) -> Vec<BudgetSession> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|b| !b.closed)
            .cloned()
            .collect()
    }

    /// Run the same checks `record`/`checkDuration` perform, for sessions
    /// whose callers forgot to invoke them directly. Called by the periodic
    /// enforcement loop.
    pub async fn enforce_all(&self) {
        let session_ids: Vec<String> = self.list_open().await.into_iter().map(|b| b.session_id).collect();
        for session_id in session_ids {
            if let Err(e) = self.check_duration(&session_id).await {
                warn!(session_id = %session_id, error = %e, "budget enforcement sweep closed session");
            }
        }
    }
}

impl std::fmt::Debug for BudgetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetTracker").finish_non_exhaustive()
    }
}

/// Shared handle alias used throughout the daemon.
pub type SharedBudgetTracker = Arc<BudgetTracker>;
