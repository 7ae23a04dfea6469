//! Health/Failure Sink.
//!
//! The container runtime and the call/session layer have no direct
//! dependency on the notification path — they report failures here, and this
//! module is the only thing that knows a failure becomes one audit record
//! plus (subject to the [`ErrorRouter`]'s duplicate suppression) one admin
//! event.

use std::sync::Arc;

use serde_json::json;

use crate::audit::{AuditAction, AuditManager, AuditOutcome};
use crate::router::{AdminNotice, ErrorRouter};

/// Accepts failure reports from the container runtime and call layer and
/// republishes them as audit records and admin notices.
pub struct HealthSink {
    audit: Arc<AuditManager>,
    router: Arc<ErrorRouter>,
}

impl HealthSink {
    /// Construct a health sink writing to `audit` and routing through `router`.
    #[must_use]
    pub fn new(audit: Arc<AuditManager>, router: Arc<ErrorRouter>) -> Self {
        Self { audit, router }
    }

    /// Report that an agent container failed unexpectedly (crash, OOM kill,
    /// runtime-reported exit with a non-zero status outside a requested
    /// `remove`). Always produces an audit record; the admin notice is
    /// subject to the router's back-off.
    pub async fn report_container_failure(&self, container_id: &str, reason: &str) {
        self.audit
            .emit(
                "health-sink",
                AuditAction::AgentStop,
                container_id,
                AuditOutcome::Violated,
                json!({ "reason": reason }).as_object().cloned().unwrap_or_default(),
            )
            .await;

        self.router
            .route(AdminNotice {
                kind: "container_failure".to_owned(),
                resource_id: container_id.to_owned(),
                message: reason.to_owned(),
            })
            .await;
    }

    /// Report that a call ended in the `Failed` state.
    pub async fn report_call_failure(&self, call_id: &str, reason: &str) {
        self.audit
            .emit(
                "health-sink",
                AuditAction::CallEnd,
                call_id,
                AuditOutcome::Violated,
                json!({ "reason": reason }).as_object().cloned().unwrap_or_default(),
            )
            .await;

        self.router
            .route(AdminNotice {
                kind: "call_failure".to_owned(),
                resource_id: call_id.to_owned(),
                message: reason.to_owned(),
            })
            .await;
    }
}

impl std::fmt::Debug for HealthSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthSink").finish_non_exhaustive()
    }
}

/// Shared handle alias used throughout the daemon.
pub type SharedHealthSink = Arc<HealthSink>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event_sink::{EventSink, InMemoryEventSink};
    use crate::router::BackoffPolicy;

    #[tokio::test]
    async fn container_failure_emits_audit_and_event() {
        let audit = Arc::new(AuditManager::new(10));
        let sink = Arc::new(InMemoryEventSink::new());
        let router = Arc::new(ErrorRouter::new(Arc::clone(&sink) as Arc<dyn EventSink>, BackoffPolicy::default()));
        let health = HealthSink::new(Arc::clone(&audit), router);

        health.report_container_failure("container-1", "oom killed").await;

        assert_eq!(audit.len().await, 1);
        assert_eq!(sink.events().await.len(), 1);
    }

    #[tokio::test]
    async fn repeated_failures_for_same_container_are_rate_limited_to_admin() {
        let audit = Arc::new(AuditManager::new(10));
        let sink = Arc::new(InMemoryEventSink::new());
        let router = Arc::new(ErrorRouter::new(Arc::clone(&sink) as Arc<dyn EventSink>, BackoffPolicy::default()));
        let health = HealthSink::new(Arc::clone(&audit), router);

        health.report_container_failure("container-1", "crash 1").await;
        health.report_container_failure("container-1", "crash 2").await;

        assert_eq!(audit.len().await, 2, "every failure is audited");
        assert_eq!(sink.events().await.len(), 1, "duplicate admin notices are suppressed");
    }
}
