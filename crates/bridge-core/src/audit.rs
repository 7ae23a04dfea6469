//! Append-only audit log with an in-memory ring and optional encrypted
//! file spill.
//!
//! Every record is retained in a bounded in-memory ring (oldest records
//! drop first once the ring is full) and, if a backend is registered,
//! forwarded for durable storage. A backend failure is logged and does not
//! block the caller — the ring is always the source of truth for recent
//! history, and the daemon stays available even if the disk backend is
//! unreachable.
//!
//! Detail maps must never carry raw secrets or tokens — only identifiers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::AuditError;

/// The kind of event an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Admission control granted a session or call.
    AdmissionGranted,
    /// Admission control denied a session or call.
    AdmissionDenied,
    /// A session or call was transitioned to expired by the TTL enforcer.
    Expired,
    /// A budget session crossed its warning threshold.
    BudgetWarn,
    /// A budget session was closed by the hard-stop policy.
    BudgetStop,
    /// A credential was read from the keystore.
    CredentialAccess,
    /// An agent/container was started.
    AgentStart,
    /// An agent/container was stopped.
    AgentStop,
    /// A call was started.
    CallStart,
    /// A call ended.
    CallEnd,
}

/// The outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The operation was permitted.
    Granted,
    /// The operation was refused by policy.
    Denied,
    /// The referenced resource had already expired.
    Expired,
    /// An invariant was violated (used for internal/defensive records).
    Violated,
}

/// A single audit log entry.
///
/// `detail` must contain only identifiers and counters — never raw secrets,
/// tokens, or other PII.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record id.
    pub id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Principal that performed or triggered the action.
    pub actor: String,
    /// The kind of event.
    pub action: AuditAction,
    /// The resource the action concerns (session id, credential id, call id, ...).
    pub resource: String,
    /// The result of the audited operation.
    pub outcome: AuditOutcome,
    /// Structured, PII-free detail (e.g. rule name, window counters).
    pub detail: serde_json::Map<String, serde_json::Value>,
}

/// Trait for durable audit spill backends.
///
/// Implementations must be safe to share across async tasks.
#[async_trait::async_trait]
pub trait AuditBackend: Send + Sync {
    /// The backend's name, for diagnostics.
    fn name(&self) -> &str;

    /// Persist a record. Must not silently drop it.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be persisted.
    async fn log(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Default retention: how many records the in-memory ring keeps.
pub const DEFAULT_RING_CAPACITY: usize = 10_000;

/// Append-only audit log: a bounded in-memory ring plus an optional durable backend.
pub struct AuditManager {
    ring: RwLock<VecDeque<AuditRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    backend: RwLock<Option<Arc<dyn AuditBackend>>>,
}

impl AuditManager {
    /// Construct an audit manager with the given ring capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
            backend: RwLock::new(None),
        }
    }

    /// Register (or replace) the durable spill backend.
    pub async fn set_backend(&self, backend: Arc<dyn AuditBackend>) {
        *self.backend.write().await = Some(backend);
    }

    /// Append a record to the ring, then forward it to the durable backend if
    /// one is registered.
    ///
    /// At capacity, the oldest non-`Violated` record is evicted to make room.
    /// If every record currently in the ring is a `Violated` record, an
    /// incoming non-`Violated` record is dropped instead (and `dropped_count`
    /// incremented) so violation history is never silently lost to routine
    /// traffic; an incoming `Violated` record still evicts the oldest one.
    pub async fn record(&self, record: AuditRecord) {
        {
            let mut ring = self.ring.write().await;
            if ring.len() >= self.capacity {
                match ring.iter().position(|r| r.outcome != AuditOutcome::Violated) {
                    Some(pos) => {
                        ring.remove(pos);
                    }
                    None if record.outcome != AuditOutcome::Violated => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    None => {
                        ring.pop_front();
                    }
                }
            }
            ring.push_back(record.clone());
        }

        let backend = self.backend.read().await.clone();
        if let Some(backend) = backend {
            if let Err(e) = backend.log(&record).await {
                warn!(backend = backend.name(), error = %e, record_id = %record.id, "audit backend spill failed");
            }
        }
    }

    /// Convenience constructor for a record with the current timestamp and a
    /// fresh id.
    pub async fn emit(
        &self,
        actor: &str,
        action: AuditAction,
        resource: &str,
        outcome: AuditOutcome,
        detail: serde_json::Map<String, serde_json::Value>,
    ) {
        self.record(AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.to_owned(),
            action,
            resource: resource.to_owned(),
            outcome,
            detail,
        })
        .await;
    }

    /// Snapshot the most recent `limit` records, newest last.
    pub async fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let ring = self.ring.read().await;
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Number of records currently retained in the ring.
    pub async fn len(&self) -> usize {
        self.ring.read().await.len()
    }

    /// Whether the ring is empty.
    pub async fn is_empty(&self) -> bool {
        self.ring.read().await.is_empty()
    }

    /// Number of records dropped for backpressure since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for AuditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditManager").finish_non_exhaustive()
    }
}

/// Shared handle alias used throughout the daemon.
pub type SharedAuditManager = Arc<AuditManager>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn detail() -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    #[tokio::test]
    async fn emit_appends_to_ring() {
        let manager = AuditManager::new(10);
        manager
            .emit("alice", AuditAction::AdmissionGranted, "session-1", AuditOutcome::Granted, detail())
            .await;

        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn ring_drops_oldest_at_capacity() {
        let manager = AuditManager::new(2);
        for i in 0..3 {
            manager
                .emit(
                    "alice",
                    AuditAction::AdmissionGranted,
                    &format!("session-{i}"),
                    AuditOutcome::Granted,
                    detail(),
                )
                .await;
        }

        assert_eq!(manager.len().await, 2);
        let recent = manager.recent(10).await;
        assert_eq!(recent[0].resource, "session-1");
        assert_eq!(recent[1].resource, "session-2");
    }

    #[tokio::test]
    async fn recent_respects_limit() {
        let manager = AuditManager::new(10);
        for i in 0..5 {
            manager
                .emit(
                    "alice",
                    AuditAction::AdmissionGranted,
                    &format!("session-{i}"),
                    AuditOutcome::Granted,
                    detail(),
                )
                .await;
        }

        let recent = manager.recent(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].resource, "session-4");
    }

    #[tokio::test]
    async fn violations_survive_eviction_in_favor_of_routine_records() {
        let manager = AuditManager::new(2);
        manager
            .emit("alice", AuditAction::AdmissionDenied, "bad-1", AuditOutcome::Violated, detail())
            .await;
        manager
            .emit("alice", AuditAction::AdmissionGranted, "ok-1", AuditOutcome::Granted, detail())
            .await;
        manager
            .emit("alice", AuditAction::AdmissionGranted, "ok-2", AuditOutcome::Granted, detail())
            .await;

        let recent = manager.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].resource, "bad-1");
        assert_eq!(recent[1].resource, "ok-2");
    }

    #[tokio::test]
    async fn routine_record_dropped_when_ring_is_all_violations() {
        let manager = AuditManager::new(1);
        manager
            .emit("alice", AuditAction::AdmissionDenied, "bad-1", AuditOutcome::Violated, detail())
            .await;
        manager
            .emit("alice", AuditAction::AdmissionGranted, "ok-1", AuditOutcome::Granted, detail())
            .await;

        assert_eq!(manager.len().await, 1);
        assert_eq!(manager.recent(10).await[0].resource, "bad-1");
        assert_eq!(manager.dropped_count(), 1);
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl AuditBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn log(&self, _record: &AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::Io {
                reason: "disk full".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn backend_failure_does_not_lose_ring_entry() {
        let manager = AuditManager::new(10);
        manager.set_backend(Arc::new(FailingBackend)).await;

        manager
            .emit("alice", AuditAction::AdmissionDenied, "session-1", AuditOutcome::Denied, detail())
            .await;

        assert_eq!(manager.len().await, 1);
    }
}
