//! Bridge daemon entry point.
//!
//! Bootstraps configuration, hardening, and every subsystem, then serves the
//! Unix-socket JSON-RPC API with graceful shutdown. Mirrors the shape of the
//! teacher's `zvault-server` binary: a background sweep worker runs
//! alongside the listener and is cancelled on shutdown via a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{info, warn};

use bridge_daemon::config::Config;
use bridge_daemon::hardening;
use bridge_daemon::rpc::serve_connection;
use bridge_daemon::startup::{build_app_state, ensure_parent_dir};
use bridge_daemon::state::SharedAppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    apply_hardening();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .json()
        .init();

    info!(backend = %config.keystore.backend, "bridge-daemon starting");

    let (state, ttl_enforcer) = build_app_state(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep_handle = {
        let enforcer = Arc::clone(&ttl_enforcer);
        let mut rx = shutdown_rx.clone();
        let interval_secs = config.server.sweep_interval_secs;
        tokio::spawn(async move {
            enforcer.run(&mut rx, interval_secs).await;
        })
    };

    let maintenance_handle = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            bucket_eviction_worker(state, &mut rx).await;
        })
    };

    let socket_path = config.resolve_runtime_path(&config.server.socket_path);
    ensure_parent_dir(&socket_path)?;
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed to remove stale socket '{}'", socket_path.display()))?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind control socket '{}'", socket_path.display()))?;
    set_socket_permissions(&socket_path)?;

    info!(socket = %socket_path.display(), "control socket listening");

    let signal_handle = tokio::spawn(wait_for_shutdown_signal(shutdown_tx.clone()));

    accept_loop(listener, Arc::clone(&state), shutdown_rx).await;
    let _ = shutdown_tx.send(true);
    signal_handle.abort();

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(5), sweep_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), maintenance_handle).await;

    shutdown_active_sessions(&state).await;
    state.keystore.close().await;

    info!("bridge-daemon stopped");
    Ok(())
}

/// Accept connections until a shutdown signal arrives, spawning one task per
/// connection per the daemon's per-connection sequential-ordering contract.
async fn accept_loop(listener: UnixListener, state: SharedAppState, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            serve_connection(state, stream).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept control socket connection");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("shutdown signal received, no longer accepting connections");
                return;
            }
        }
    }
}

/// Waits for SIGINT or SIGTERM and flips the shutdown watch channel, which
/// unblocks `accept_loop` and every background worker's `select!`.
async fn wait_for_shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
    }
    let _ = shutdown_tx.send(true);
}

/// Periodically evict idle rate-limit and back-off buckets from the security
/// enforcer and error router, on the same cadence as the TTL sweep.
async fn bucket_eviction_worker(state: SharedAppState, shutdown: &mut watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(state.config.server.sweep_interval_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                state.security.evict_idle_buckets().await;
                state.router.evict_idle_buckets().await;
            }
            _ = shutdown.changed() => {
                return;
            }
        }
    }
}

/// End every still-active session on shutdown so no client is left holding a
/// session the daemon no longer tracks.
async fn shutdown_active_sessions(state: &SharedAppState) {
    for session in state.sessions.list().await {
        if session.state == bridge_core::session::SessionState::Active
            || session.state == bridge_core::session::SessionState::Expiring
        {
            if let Err(e) = state.sessions.end(&session.id).await {
                warn!(session_id = %session.id, error = %e, "failed to end session during shutdown");
            }
            state.budget.end_session(&session.id).await;
        }
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o640);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("failed to set permissions on '{}'", path.display()))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &std::path::Path) -> anyhow::Result<()> {
    Ok(())
}

/// Apply production hardening before logging is initialized.
#[allow(clippy::print_stderr)]
fn apply_hardening() {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }
    if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: failed to lock memory: {e}");
    }
}
