//! Shared application state.
//!
//! One [`AppState`] is built at startup and handed to every connection task
//! as an `Arc` clone — every RPC handler reaches its subsystems through this
//! struct rather than any ambient global.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use bridge_core::audit::SharedAuditManager;
use bridge_core::budget::SharedBudgetTracker;
use bridge_core::call::SharedCallManager;
use bridge_core::container::SharedContainerRuntime;
use bridge_core::event_sink::SharedEventSink;
use bridge_core::health::SharedHealthSink;
use bridge_core::keystore::Keystore;
use bridge_core::router::SharedErrorRouter;
use bridge_core::security::SharedSecurityEnforcer;
use bridge_core::session::SharedSessionRegistry;
use bridge_core::token::TokenManager;
use bridge_core::turn::TurnCredentialMinter;

use crate::config::Config;

/// Every subsystem a connection handler may need, bundled behind `Arc`.
pub struct AppState {
    pub keystore: Arc<Keystore>,
    pub sessions: SharedSessionRegistry,
    pub tokens: Arc<TokenManager>,
    pub turn: Arc<TurnCredentialMinter>,
    pub calls: SharedCallManager,
    pub budget: SharedBudgetTracker,
    pub security: SharedSecurityEnforcer,
    pub audit: SharedAuditManager,
    pub router: SharedErrorRouter,
    pub health: SharedHealthSink,
    pub runtime: SharedContainerRuntime,
    pub events: SharedEventSink,
    pub config: Config,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keystore: Arc<Keystore>,
        sessions: SharedSessionRegistry,
        tokens: Arc<TokenManager>,
        turn: Arc<TurnCredentialMinter>,
        calls: SharedCallManager,
        budget: SharedBudgetTracker,
        security: SharedSecurityEnforcer,
        audit: SharedAuditManager,
        router: SharedErrorRouter,
        health: SharedHealthSink,
        runtime: SharedContainerRuntime,
        events: SharedEventSink,
        config: Config,
    ) -> Self {
        Self {
            keystore,
            sessions,
            tokens,
            turn,
            calls,
            budget,
            security,
            audit,
            router,
            health,
            runtime,
            events,
            config,
            started_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Shared handle alias used throughout the daemon.
pub type SharedAppState = Arc<AppState>;
