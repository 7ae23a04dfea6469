//! Background TTL enforcement for sessions and calls.
//!
//! Mirrors the periodic scan-and-act shape of a lease expiry worker: a
//! `tokio::time::interval` ticks, each tick walks the live sessions and calls
//! once, and a `watch::Receiver<bool>` lets the daemon stop the worker
//! cleanly during shutdown. Unlike a storage-backed scan, walking the
//! in-memory registries cannot fail, so there is no retry/backoff path here.
//!
//! Each session gets a one-shot near-expiry warning (audited, not just
//! logged) before it is transitioned to `Expired` once its deadline passes.
//! Calls have no separate warning step — the invariant only requires reaching
//! a terminal state before their TTL elapses.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use crate::audit::{AuditAction, AuditManager, AuditOutcome};
use crate::budget::BudgetTracker;
use crate::call::CallManager;
use crate::session::{SessionRegistry, SessionState};

/// Default interval between TTL enforcement sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Fraction of a session's TTL window remaining at which the one-shot
/// near-expiry warning fires.
pub const WARN_REMAINING_FRACTION: f64 = 0.1;

/// Summary of one sweep, returned for logging/testing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions that crossed into the near-expiry warning window this sweep.
    pub sessions_warned: usize,
    /// Sessions transitioned to `Expired`.
    pub sessions_expired: usize,
    /// Calls transitioned to `Expired`.
    pub calls_expired: usize,
}

/// Periodic enforcer that expires sessions and calls once their TTL elapses.
pub struct TtlEnforcer {
    sessions: Arc<SessionRegistry>,
    calls: Arc<CallManager>,
    budget: Arc<BudgetTracker>,
    audit: Arc<AuditManager>,
}

impl TtlEnforcer {
    /// Construct an enforcer over the given registries. A session transitioning
    /// to `Expired` also ends its linked budget session, if one is open.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionRegistry>,
        calls: Arc<CallManager>,
        budget: Arc<BudgetTracker>,
        audit: Arc<AuditManager>,
    ) -> Self {
        Self { sessions, calls, budget, audit }
    }

    /// Run a single sweep: warn sessions nearing expiry, expire sessions and
    /// calls past their deadline.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        for session in self.sessions.list().await {
            if session.state != SessionState::Active && session.state != SessionState::Expiring {
                continue;
            }

            if now >= session.expires_at {
                if let Ok(expired) = self.sessions.update_state(&session.id, SessionState::Expired).await {
                    report.sessions_expired = report.sessions_expired.saturating_add(1);
                    self.budget.end_session(&expired.id).await;
                    self.audit
                        .emit(
                            "ttl-enforcer",
                            AuditAction::Expired,
                            &expired.id,
                            AuditOutcome::Expired,
                            json!({ "room_id": expired.room_id }).as_object().cloned().unwrap_or_default(),
                        )
                        .await;
                }
                continue;
            }

            if session.remaining_fraction(now) <= WARN_REMAINING_FRACTION {
                if let Ok(true) = self.sessions.mark_warned(&session.id).await {
                    let _ = self.sessions.update_state(&session.id, SessionState::Expiring).await;
                    report.sessions_warned = report.sessions_warned.saturating_add(1);
                    self.audit
                        .emit(
                            "ttl-enforcer",
                            AuditAction::Expired,
                            &session.id,
                            AuditOutcome::Granted,
                            json!({ "room_id": session.room_id, "event": "near_expiry_warning" })
                                .as_object()
                                .cloned()
                                .unwrap_or_default(),
                        )
                        .await;
                }
            }
        }

        for call in self.calls.list().await {
            if call.state.is_terminal() {
                continue;
            }
            if now >= call.expires_at {
                if self.calls.expire(&call.id).await.is_ok() {
                    report.calls_expired = report.calls_expired.saturating_add(1);
                    self.audit
                        .emit(
                            "ttl-enforcer",
                            AuditAction::Expired,
                            &call.id,
                            AuditOutcome::Expired,
                            json!({ "room_id": call.room_id }).as_object().cloned().unwrap_or_default(),
                        )
                        .await;
                }
            }
        }

        report
    }

    /// Run the sweep loop until `shutdown` fires, ticking every
    /// `interval_secs` seconds.
    pub async fn run(&self, shutdown: &mut watch::Receiver<bool>, interval_secs: u64) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(interval_secs));
        info!(interval_secs, "ttl enforcer started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep_once().await;
                    if report.sessions_warned > 0 || report.sessions_expired > 0 || report.calls_expired > 0 {
                        info!(
                            sessions_warned = report.sessions_warned,
                            sessions_expired = report.sessions_expired,
                            calls_expired = report.calls_expired,
                            "ttl enforcement sweep complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("ttl enforcer shutting down");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for TtlEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlEnforcer").finish_non_exhaustive()
    }
}
