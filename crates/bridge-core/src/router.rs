//! Policy/Error Router.
//!
//! Subsystems that want an operator paged reach here, not the event sink
//! directly: `route` applies exponential back-off and `(kind, resourceId)`
//! duplicate suppression before calling [`EventSink::publish`], so a
//! misbehaving client or a flapping container cannot flood the notification
//! channel. The suppression bucket is the same shape as
//! [`crate::security::SecurityEnforcer`]'s rate-limit buckets — a small
//! per-key critical section inside a concurrent map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::warn;

use crate::event_sink::{Event, EventSink};

/// An admin-tagged notice a subsystem wants surfaced to an operator.
#[derive(Debug, Clone)]
pub struct AdminNotice {
    /// Short machine-readable category, e.g. `"policy_violation"`, `"storage_io"`.
    pub kind: String,
    /// The resource the notice concerns (session id, container id, ...).
    pub resource_id: String,
    /// Human-readable detail. Must never contain secret material.
    pub message: String,
}

/// Back-off and suppression policy for the router.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Minimum suppression window for a (kind, resourceId) pair seen once.
    pub base_window: ChronoDuration,
    /// Ceiling the back-off window grows to under repeated notices.
    pub max_window: ChronoDuration,
    /// Idle period after which a suppression bucket is forgotten.
    pub bucket_idle_eviction: ChronoDuration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_window: ChronoDuration::seconds(60),
            max_window: ChronoDuration::minutes(30),
            bucket_idle_eviction: ChronoDuration::hours(1),
        }
    }
}

struct RouteState {
    last_sent: DateTime<Utc>,
    suppressed_since: DateTime<Utc>,
    attempt: u32,
}

/// Classifies and routes admin notices to an [`EventSink`], with back-off and
/// duplicate suppression.
pub struct ErrorRouter {
    sink: Arc<dyn EventSink>,
    policy: BackoffPolicy,
    buckets: RwLock<HashMap<(String, String), RouteState>>,
}

impl ErrorRouter {
    /// Construct a router publishing through `sink` under `policy`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, policy: BackoffPolicy) -> Self {
        Self {
            sink,
            policy,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Route an admin notice. Publishes immediately the first time a
    /// `(kind, resourceId)` pair is seen; subsequent notices for the same key
    /// are suppressed until an exponentially growing window (capped at
    /// `max_window`) elapses since the last publish.
    pub async fn route(&self, notice: AdminNotice) {
        let key = (notice.kind.clone(), notice.resource_id.clone());
        let now = Utc::now();

        let should_send = {
            let mut buckets = self.buckets.write().await;
            match buckets.get_mut(&key) {
                None => {
                    buckets.insert(
                        key.clone(),
                        RouteState {
                            last_sent: now,
                            suppressed_since: now,
                            attempt: 0,
                        },
                    );
                    true
                }
                Some(state) => {
                    let window = self.backoff_window(state.attempt);
                    if now - state.last_sent >= window {
                        state.last_sent = now;
                        state.suppressed_since = now;
                        state.attempt = state.attempt.saturating_add(1);
                        true
                    } else {
                        state.attempt = state.attempt.saturating_add(1);
                        false
                    }
                }
            }
        };

        if !should_send {
            return;
        }

        let event = Event::new(
            format!("admin.{}", notice.kind),
            notice.resource_id.clone(),
            json!({ "message": notice.message }),
        );

        if let Err(e) = self.sink.publish(&event).await {
            warn!(kind = %notice.kind, resource_id = %notice.resource_id, error = %e, "admin notice publish failed");
        }
    }

    fn backoff_window(&self, attempt: u32) -> ChronoDuration {
        let doubled = self.policy.base_window.num_seconds().saturating_mul(1i64 << attempt.min(20));
        ChronoDuration::seconds(doubled.min(self.policy.max_window.num_seconds()))
    }

    /// Forget suppression buckets idle past the policy's eviction window.
    /// Intended to be called from the same periodic sweep that evicts the
    /// security enforcer's rate-limit buckets.
    pub async fn evict_idle_buckets(&self) {
        let now = Utc::now();
        let idle = self.policy.bucket_idle_eviction;
        let mut buckets = self.buckets.write().await;
        buckets.retain(|_, state| now - state.suppressed_since < idle);
    }
}

impl std::fmt::Debug for ErrorRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRouter").finish_non_exhaustive()
    }
}

/// Shared handle alias used throughout the daemon.
pub type SharedErrorRouter = Arc<ErrorRouter>;

/// Convert a [`BackoffPolicy`] duration into a `std::time::Duration`, for
/// callers that need to arm a `tokio::time::sleep` rather than compare
/// wall-clock timestamps.
#[must_use]
pub fn as_std_duration(duration: ChronoDuration) -> StdDuration {
    duration.to_std().unwrap_or(StdDuration::from_secs(0))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event_sink::InMemoryEventSink;

    fn notice(kind: &str, resource: &str) -> AdminNotice {
        AdminNotice {
            kind: kind.to_owned(),
            resource_id: resource.to_owned(),
            message: "boom".to_owned(),
        }
    }

    #[tokio::test]
    async fn first_notice_for_a_key_is_always_published() {
        let sink = Arc::new(InMemoryEventSink::new());
        let router = ErrorRouter::new(Arc::clone(&sink) as Arc<dyn EventSink>, BackoffPolicy::default());

        router.route(notice("storage_io", "session-1")).await;

        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "admin.storage_io");
    }

    #[tokio::test]
    async fn duplicate_within_window_is_suppressed() {
        let sink = Arc::new(InMemoryEventSink::new());
        let router = ErrorRouter::new(Arc::clone(&sink) as Arc<dyn EventSink>, BackoffPolicy::default());

        router.route(notice("storage_io", "session-1")).await;
        router.route(notice("storage_io", "session-1")).await;
        router.route(notice("storage_io", "session-1")).await;

        assert_eq!(sink.events().await.len(), 1);
    }

    #[tokio::test]
    async fn distinct_resource_ids_are_independent() {
        let sink = Arc::new(InMemoryEventSink::new());
        let router = ErrorRouter::new(Arc::clone(&sink) as Arc<dyn EventSink>, BackoffPolicy::default());

        router.route(notice("storage_io", "session-1")).await;
        router.route(notice("storage_io", "session-2")).await;

        assert_eq!(sink.events().await.len(), 2);
    }

    #[tokio::test]
    async fn backoff_window_grows_with_repeated_attempts() {
        let policy = BackoffPolicy {
            base_window: ChronoDuration::seconds(1),
            max_window: ChronoDuration::seconds(4),
            bucket_idle_eviction: ChronoDuration::hours(1),
        };
        let router = ErrorRouter::new(Arc::new(InMemoryEventSink::new()), policy);

        assert_eq!(router.backoff_window(0), ChronoDuration::seconds(1));
        assert_eq!(router.backoff_window(1), ChronoDuration::seconds(2));
        assert_eq!(router.backoff_window(2), ChronoDuration::seconds(4));
        assert_eq!(router.backoff_window(5), ChronoDuration::seconds(4));
    }
}
