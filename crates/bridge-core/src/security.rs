//! Admission control for every new session or call.
//!
//! `check_start` consults, in order: concurrency limit, blocklists,
//! per-principal rate limit, then allowlists. The rate limiter uses a
//! tumbling window (reset once the window elapses) rather than a sliding
//! log, matching the low-overhead per-connection limiter pattern used
//! elsewhere in this codebase's RPC transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::SecurityError;

/// Policy constants governing admission control.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    /// Maximum number of concurrently active calls.
    pub max_concurrent_calls: u64,
    /// Principals denied admission outright.
    pub blocked_principals: HashSet<String>,
    /// Rooms denied admission outright.
    pub blocked_rooms: HashSet<String>,
    /// If non-empty, only these principals are admitted.
    pub allowed_principals: HashSet<String>,
    /// If non-empty, only these rooms are admitted.
    pub allowed_rooms: HashSet<String>,
    /// Rate-limit window duration.
    pub rate_limit_window: Duration,
    /// Maximum admissions per principal per window.
    pub rate_limit_max: u64,
    /// Idle period after which a principal's rate-limit bucket is evicted.
    pub bucket_idle_eviction: Duration,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 100,
            blocked_principals: HashSet::new(),
            blocked_rooms: HashSet::new(),
            allowed_principals: HashSet::new(),
            allowed_rooms: HashSet::new(),
            rate_limit_window: Duration::seconds(60),
            rate_limit_max: 30,
            bucket_idle_eviction: Duration::minutes(10),
        }
    }
}

/// Per-principal tumbling-window rate-limit bucket.
#[derive(Debug, Clone)]
struct RateLimitBucket {
    count: u64,
    window_start: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl RateLimitBucket {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_seen: now,
        }
    }

    /// Increment the bucket's count, resetting first if the window elapsed.
    /// The caller compares the returned count against the policy max.
    fn check_and_record(&mut self, now: DateTime<Utc>, window: Duration) -> u64 {
        if now - self.window_start >= window {
            self.count = 0;
            self.window_start = now;
        }
        self.count = self.count.saturating_add(1);
        self.last_seen = now;
        self.count
    }
}

/// Admission controller maintaining the active-calls map and rate-limit buckets.
pub struct SecurityEnforcer {
    policy: SecurityPolicy,
    active_calls: RwLock<HashMap<String, String>>,
    buckets: RwLock<HashMap<String, RateLimitBucket>>,
}

impl SecurityEnforcer {
    /// Construct an enforcer with the given policy.
    #[must_use]
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy,
            active_calls: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Run admission control for a new session or call from `principal` in `room`.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::ConcurrencyLimit`] if the active-call count is at
    ///   capacity.
    /// - [`SecurityError::Blocked`] if the principal or room is blocklisted.
    /// - [`SecurityError::RateLimited`] if the principal's bucket is over
    ///   the policy window count.
    /// - [`SecurityError::NotAllowed`] if a non-empty allowlist excludes the
    ///   principal or room.
    pub async fn check_start(&self, principal: &str, room: &str) -> Result<(), SecurityError> {
        let active_count = self.active_calls.read().await.len() as u64;
        if active_count >= self.policy.max_concurrent_calls {
            return Err(SecurityError::ConcurrencyLimit {
                limit: self.policy.max_concurrent_calls,
            });
        }

        if self.policy.blocked_principals.contains(principal) {
            return Err(SecurityError::Blocked {
                rule: format!("principal:{principal}"),
            });
        }
        if self.policy.blocked_rooms.contains(room) {
            return Err(SecurityError::Blocked {
                rule: format!("room:{room}"),
            });
        }

        let now = Utc::now();
        let count = {
            let mut buckets = self.buckets.write().await;
            let bucket = buckets
                .entry(principal.to_owned())
                .or_insert_with(|| RateLimitBucket::new(now));
            bucket.check_and_record(now, self.policy.rate_limit_window)
        };
        if count > self.policy.rate_limit_max {
            return Err(SecurityError::RateLimited {
                count,
                limit: self.policy.rate_limit_max,
            });
        }

        if !self.policy.allowed_principals.is_empty() && !self.policy.allowed_principals.contains(principal) {
            return Err(SecurityError::NotAllowed {
                rule: format!("principal:{principal}"),
            });
        }
        if !self.policy.allowed_rooms.is_empty() && !self.policy.allowed_rooms.contains(room) {
            return Err(SecurityError::NotAllowed {
                rule: format!("room:{room}"),
            });
        }

        Ok(())
    }

    /// Register a newly admitted call in the active-calls map.
    pub async fn register_call(&self, call_id: &str, principal: &str) {
        self.active_calls
            .write()
            .await
            .insert(call_id.to_owned(), principal.to_owned());
    }

    /// Remove a call from the active-calls map once it terminates.
    pub async fn unregister_call(&self, call_id: &str) {
        self.active_calls.write().await.remove(call_id);
    }

    /// Evict rate-limit buckets that have been idle past the policy's
    /// eviction window. Called by the periodic enforcement sweep.
    pub async fn evict_idle_buckets(&self) {
        let now = Utc::now();
        let idle = self.policy.bucket_idle_eviction;
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| now - bucket.last_seen < idle);
        let evicted = before - buckets.len();
        if evicted > 0 {
            info!(evicted, "rate-limit buckets evicted for idle principals");
        }
    }
}

impl std::fmt::Debug for SecurityEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityEnforcer").finish_non_exhaustive()
    }
}

/// Shared handle alias used throughout the daemon.
pub type SharedSecurityEnforcer = Arc<SecurityEnforcer>;
