//! Outbound event publishing — the capability the daemon uses to push
//! asynchronous notifications (near-expiry warnings, budget stops, container
//! failures, admin-tagged errors) to whatever is on the other side: a Matrix
//! room, a local UI, or nothing at all in tests.
//!
//! Mirrors [`crate::audit::AuditBackend`]: a trait object behind an `Arc` so
//! callers never know whether the sink is in-process or a network adapter,
//! plus a concurrency-safe default implementation for bring-up and tests.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::EventSinkError;

/// A single outbound notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event category (e.g. `"session.expiring"`, `"budget.stop"`, `"container.failed"`).
    pub kind: String,
    /// The resource the event concerns (session id, call id, container id, ...).
    pub resource_id: String,
    /// Structured, PII-free payload.
    pub payload: serde_json::Value,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Construct an event stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>, resource_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            resource_id: resource_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Capability for publishing events to an external channel.
///
/// Implementations must be safe to share across async tasks. `publish`
/// returning [`EventSinkError::BackpressureDropped`] signals the caller that
/// the event did not reach its destination but the daemon should keep
/// running — the audit ring remains the durable record of what happened.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// The sink's name, for diagnostics.
    fn name(&self) -> &str;

    /// Publish an event.
    ///
    /// # Errors
    ///
    /// Returns [`EventSinkError`] if the event could not be delivered.
    async fn publish(&self, event: &Event) -> Result<(), EventSinkError>;
}

/// A sink that discards every event. Used when no external notification
/// channel is configured.
#[derive(Debug, Default)]
pub struct NoopEventSink;

#[async_trait::async_trait]
impl EventSink for NoopEventSink {
    fn name(&self) -> &str {
        "noop"
    }

    async fn publish(&self, _event: &Event) -> Result<(), EventSinkError> {
        Ok(())
    }
}

/// Default retention for the in-memory sink's ring buffer.
const DEFAULT_MEMORY_SINK_CAPACITY: usize = 1_000;

/// A sink that retains recent events in memory, for local development and
/// integration tests that need to assert on what would have been published.
pub struct InMemoryEventSink {
    events: RwLock<VecDeque<Event>>,
    capacity: usize,
}

impl InMemoryEventSink {
    /// Construct an in-memory sink with the default ring capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(DEFAULT_MEMORY_SINK_CAPACITY.min(256))),
            capacity: DEFAULT_MEMORY_SINK_CAPACITY,
        }
    }

    /// Snapshot every retained event, oldest first.
    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.iter().cloned().collect()
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventSink for InMemoryEventSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, event: &Event) -> Result<(), EventSinkError> {
        let mut guard = self.events.write().await;
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(event.clone());
        Ok(())
    }
}

/// Shared handle alias used throughout the daemon.
pub type SharedEventSink = Arc<dyn EventSink>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_sink_always_succeeds() {
        let sink = NoopEventSink;
        let event = Event::new("session.expiring", "s1", serde_json::json!({}));
        assert!(sink.publish(&event).await.is_ok());
    }

    #[tokio::test]
    async fn memory_sink_retains_published_events() {
        let sink = InMemoryEventSink::new();
        sink.publish(&Event::new("budget.stop", "s1", serde_json::json!({})))
            .await
            .unwrap();
        sink.publish(&Event::new("container.failed", "c1", serde_json::json!({})))
            .await
            .unwrap();

        let events = sink.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "budget.stop");
        assert_eq!(events[1].resource_id, "c1");
    }

    #[tokio::test]
    async fn memory_sink_drops_oldest_at_capacity() {
        let mut sink = InMemoryEventSink::new();
        sink.capacity = 1;

        sink.publish(&Event::new("a", "r1", serde_json::json!({}))).await.unwrap();
        sink.publish(&Event::new("b", "r2", serde_json::json!({}))).await.unwrap();

        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "b");
    }
}
