//! Startup sequence: build the storage backend, wire every subsystem into an
//! [`AppState`], and auto-import a credential from the environment.
//!
//! Mirrors `zvault_server::main::build_app_state` — one function assembling
//! the whole object graph from a loaded [`Config`], called once before the
//! listener binds.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bridge_core::audit::AuditManager;
use bridge_core::barrier::Barrier;
use bridge_core::budget::{BudgetPolicy, BudgetTracker};
use bridge_core::call::CallManager;
use bridge_core::container::LocalStubRuntime;
use bridge_core::event_sink::{EventSink, InMemoryEventSink, NoopEventSink};
use bridge_core::health::HealthSink;
use bridge_core::keystore::{Credential, Keystore, Provider};
use bridge_core::router::{BackoffPolicy, ErrorRouter};
use bridge_core::security::{SecurityEnforcer, SecurityPolicy};
use bridge_core::session::SessionRegistry;
use bridge_core::token::TokenManager;
use bridge_core::turn::TurnCredentialMinter;
use bridge_storage::{MemoryBackend, StorageBackend};
use chrono::Duration as ChronoDuration;
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

/// Name under which a `BRIDGE_API_KEY`-imported credential is stored when its
/// provider is recognized.
fn env_credential_id(provider: &Provider) -> String {
    format!("{provider}-default")
}

/// One-shot import of `BRIDGE_API_KEY` into the keystore at startup.
///
/// The provider is inferred from the token's prefix. An unrecognized prefix
/// is not an error — the key is skipped with a warning, per the daemon's
/// "else rejected with a warning" contract for this variable.
pub async fn import_env_credential(keystore: &Keystore) -> anyhow::Result<()> {
    let Ok(token) = std::env::var("BRIDGE_API_KEY") else {
        return Ok(());
    };

    let Some(provider) = Provider::infer_from_token(&token) else {
        warn!("BRIDGE_API_KEY set but its prefix doesn't match a known provider; skipping import");
        return Ok(());
    };

    let id = env_credential_id(&provider);
    let credential = Credential {
        id: id.clone(),
        provider: provider.clone(),
        token,
        display_name: format!("{provider} (imported from BRIDGE_API_KEY)"),
        tags: vec!["env-import".to_owned()],
    };

    keystore.store(&credential).await.context("failed to import BRIDGE_API_KEY into the keystore")?;
    info!(id = %id, provider = %provider, "imported credential from BRIDGE_API_KEY");
    Ok(())
}

/// Open the configured storage backend.
///
/// `RocksDbBackend::open` is synchronous — opening a DB file is brief enough
/// to run inline during startup rather than via `spawn_blocking`.
pub fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.keystore.backend.as_str() {
        "memory" => {
            info!("using in-memory keystore storage (data will not persist)");
            Ok(Arc::new(MemoryBackend::new()))
        }
        "rocksdb" => {
            #[cfg(feature = "rocksdb-backend")]
            {
                info!(path = %config.keystore.db_path.display(), "using RocksDB keystore storage");
                let backend = bridge_storage::RocksDbBackend::open(&config.keystore.db_path)
                    .context("failed to open RocksDB keystore storage")?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "rocksdb-backend"))]
            {
                anyhow::bail!("rocksdb backend requested but the 'rocksdb-backend' feature is not enabled")
            }
        }
        other => anyhow::bail!("unknown keystore.backend '{other}' (expected 'memory' or 'rocksdb')"),
    }
}

/// Assemble the shared application state and the TTL enforcer that sweeps it.
pub async fn build_app_state(
    config: &Config,
) -> anyhow::Result<(Arc<AppState>, Arc<bridge_core::ttl::TtlEnforcer>)> {
    let storage = build_storage(config)?;
    let barrier = Arc::new(Barrier::new(storage));

    let seed_path = config
        .keystore
        .seed_path
        .as_ref()
        .map(|p| config.resolve_runtime_path(p))
        .unwrap_or_else(|| bridge_core::seed::default_seed_path(&config.server.runtime_dir));

    let keystore = Arc::new(Keystore::with_key_derivation_context(
        Arc::clone(&barrier),
        seed_path,
        config.keystore.key_derivation_context.clone(),
    ));
    keystore.open().await.context("failed to open keystore")?;
    import_env_credential(&keystore).await?;

    let sessions = Arc::new(SessionRegistry::new());
    let calls = Arc::new(CallManager::new());

    let tokens = Arc::new(TokenManager::with_random_secret(
        ChronoDuration::hours(1).num_seconds(),
    ));

    let turn_secret = if config.webrtc.turn_shared_secret.is_empty() {
        warn!("webrtc.turn_shared_secret not configured; using a random per-process secret (TURN credentials won't survive a restart)");
        random_secret()
    } else {
        config.webrtc.turn_shared_secret.as_bytes().to_vec()
    };
    let turn = Arc::new(TurnCredentialMinter::new(turn_secret, config.webrtc.turn_servers.clone()));

    let budget = Arc::new(BudgetTracker::new(BudgetPolicy {
        warning_threshold: config.budget.warning_threshold,
        hard_stop: config.budget.hard_stop,
    }));

    let security = Arc::new(SecurityEnforcer::new(SecurityPolicy {
        max_concurrent_calls: config.security.max_concurrent_calls,
        blocked_principals: config.security.block_principals.iter().cloned().collect(),
        blocked_rooms: config.security.block_rooms.iter().cloned().collect(),
        allowed_principals: config.security.allow_principals.iter().cloned().collect(),
        allowed_rooms: config.security.allow_rooms.iter().cloned().collect(),
        rate_limit_window: ChronoDuration::seconds(config.security.rate_limit_window_secs),
        rate_limit_max: config.security.rate_limit_calls,
        bucket_idle_eviction: ChronoDuration::seconds(config.security.bucket_idle_eviction_secs),
    }));

    let audit = Arc::new(AuditManager::new(bridge_core::audit::DEFAULT_RING_CAPACITY));

    let events: Arc<dyn EventSink> = if config.matrix.enabled {
        // The Matrix homeserver client is an external collaborator (see
        // Non-goals); only its contract is implemented here, so a configured
        // Matrix section still lands on the in-memory sink rather than a
        // real connection.
        warn!("matrix.enabled is set but no Matrix client is built into this daemon; falling back to the in-memory event sink");
        Arc::new(InMemoryEventSink::new())
    } else {
        Arc::new(NoopEventSink)
    };

    let router = Arc::new(ErrorRouter::new(Arc::clone(&events), BackoffPolicy::default()));
    let health = Arc::new(HealthSink::new(Arc::clone(&audit), Arc::clone(&router)));
    let runtime: Arc<dyn bridge_core::container::ContainerRuntime> = Arc::new(LocalStubRuntime::new());

    let ttl_enforcer = Arc::new(bridge_core::ttl::TtlEnforcer::new(
        Arc::clone(&sessions),
        Arc::clone(&calls),
        Arc::clone(&budget),
        Arc::clone(&audit),
    ));

    let state = Arc::new(AppState::new(
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
        config.clone(),
    ));

    Ok((state, ttl_enforcer))
}

fn random_secret() -> Vec<u8> {
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();
    let mut secret = Vec::with_capacity(32);
    secret.extend_from_slice(a.as_bytes());
    secret.extend_from_slice(b.as_bytes());
    secret
}

/// Ensure `path`'s parent directory exists, creating it (and setting mode
/// `0750` on Unix) if necessary.
pub fn ensure_parent_dir(path: &std::path::Path) -> anyhow::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).with_context(|| format!("failed to create directory '{}'", parent.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o750);
        std::fs::set_permissions(parent, perms)
            .with_context(|| format!("failed to set permissions on '{}'", parent.display()))?;
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_builds_cleanly() {
        let mut config = Config::default();
        config.keystore.backend = "memory".to_owned();
        let storage = build_storage(&config).unwrap();
        storage.put("k", b"v").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut config = Config::default();
        config.keystore.backend = "sqlite".to_owned();
        assert!(build_storage(&config).is_err());
    }

    #[tokio::test]
    async fn build_app_state_wires_every_subsystem() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.keystore.backend = "memory".to_owned();
        config.server.runtime_dir = dir.path().to_path_buf();

        let (state, _enforcer) = build_app_state(&config).await.unwrap();
        assert!(state.sessions.list().await.is_empty());
        assert!(state.calls.list().await.is_empty());
    }

    #[tokio::test]
    async fn unrecognized_env_key_prefix_is_skipped_not_errored() {
        // SAFETY: test runs single-threaded w.r.t. this env var; no other
        // test in this module touches BRIDGE_API_KEY.
        std::env::set_var("BRIDGE_API_KEY", "not-a-known-prefix");
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        let keystore = Keystore::new(barrier, dir.path().join("seed"));
        keystore.open().await.unwrap();

        import_env_credential(&keystore).await.unwrap();
        assert!(keystore.list(None).await.unwrap().is_empty());
        std::env::remove_var("BRIDGE_API_KEY");
    }
}
