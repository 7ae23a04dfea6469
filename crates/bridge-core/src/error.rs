//! Error types for `bridge-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto and credential errors never include key material or
//! secret bytes — only identifiers or operation descriptions.

use bridge_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, tampered tag, or mismatched AAD).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },
}

/// Errors from the encryption barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The keystore is closed — no operations are possible until `open()`.
    #[error("keystore is closed")]
    Closed,

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the hardware-rooted seed / master key lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    /// Failed to read or create the seed file.
    #[error("seed file error at '{path}': {reason}")]
    Io { path: String, reason: String },

    /// The seed file exists but has the wrong length or an invalid header.
    #[error("seed file '{path}' is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    /// The seed file's permissions are broader than 0600 — refuse to trust it.
    #[error("seed file '{path}' has insecure permissions {mode:o}, expected 0600")]
    InsecurePermissions { path: String, mode: u32 },
}

/// Errors from keystore operations (credential CRUD).
#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    /// The requested credential does not exist.
    #[error("credential not found: {id}")]
    NotFound { id: String },

    /// A `store` without `overwrite` targeted an id that already exists.
    #[error("credential already exists: {id}")]
    AlreadyExists { id: String },

    /// Decryption of a stored record failed — fatal for that record, never
    /// silently falls back to a stale value.
    #[error("failed to decrypt credential '{id}': {0}")]
    DecryptionFailure(String, #[source] CryptoError),

    /// The provider tag did not match any known prefix and no explicit
    /// provider was supplied.
    #[error("could not infer provider for credential '{id}'")]
    UnknownProvider { id: String },

    /// The barrier / underlying storage returned an error.
    #[error("keystore barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from session registry operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The requested session does not exist.
    #[error("session not found: {id}")]
    NotFound { id: String },

    /// `ttl` was zero.
    #[error("ttl must be greater than zero")]
    InvalidTtl,

    /// The requested state transition is not monotonic (e.g. Ended → Active).
    #[error("invalid session state transition for '{id}': {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },

    /// The session exists but is not `Active`, so the requested operation is refused.
    #[error("session '{id}' is not active (state: {state:?})")]
    NotActive {
        id: String,
        state: crate::session::SessionState,
    },
}

/// Errors from capability-token mint/validate.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The HMAC signature over the claims did not verify.
    #[error("token signature mismatch")]
    SignatureMismatch,

    /// The token's `exp` claim is in the past.
    #[error("token expired at {expired_at}")]
    Expired { expired_at: String },

    /// The token's wire format could not be parsed.
    #[error("malformed token: {reason}")]
    Malformed { reason: String },

    /// The token references a session that no longer exists.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// The token references a session that is no longer active.
    #[error("session not active: {session_id}")]
    SessionNotActive { session_id: String },
}

/// Errors from TURN credential minting.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// The referenced session does not exist or is not active.
    #[error("session not found or not active: {session_id}")]
    SessionUnavailable { session_id: String },
}

/// Errors from budget tracking.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    /// No budget session is registered for this session id.
    #[error("budget session not found: {session_id}")]
    NotFound { session_id: String },

    /// Usage crossed the hard token limit.
    #[error("budget exceeded for session {session_id}: used {used}, limit {limit}")]
    BudgetExceeded {
        session_id: String,
        used: u64,
        limit: u64,
    },

    /// Wall-clock duration limit exceeded.
    #[error("duration exceeded for session {session_id}: elapsed {elapsed_secs}s, limit {limit_secs}s")]
    DurationExceeded {
        session_id: String,
        elapsed_secs: i64,
        limit_secs: i64,
    },

    /// `record` or `checkDuration` called after `endSession`.
    #[error("budget session {session_id} is closed")]
    Closed { session_id: String },
}

/// Errors from the security/admission enforcer.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// Too many concurrent calls in flight.
    #[error("max concurrent calls reached ({limit})")]
    ConcurrencyLimit { limit: u64 },

    /// Principal or room is on the blocklist.
    #[error("blocked by policy: {rule}")]
    Blocked { rule: String },

    /// Principal exceeded its rate-limit window.
    #[error("rate limited: {count}/{limit} in current window")]
    RateLimited { count: u64, limit: u64 },

    /// A non-empty allowlist is configured and the principal/room isn't in it.
    #[error("not allow-listed: {rule}")]
    NotAllowed { rule: String },
}

/// Errors from the audit log.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The bounded audit channel is full and the record had to be dropped.
    #[error("audit channel backpressure — record dropped")]
    Dropped,

    /// Serialization of the audit entry failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },

    /// The file-backed audit sink failed to write.
    #[error("audit file write failed: {reason}")]
    Io { reason: String },
}

/// Errors from call state-machine operations.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The requested call does not exist.
    #[error("call not found: {id}")]
    NotFound { id: String },

    /// The call is in a terminal state and cannot be mutated further.
    #[error("call '{id}' is already terminal ({state:?})")]
    Terminal {
        id: String,
        state: crate::call::CallState,
    },

    /// An answer/candidate arrived from a principal other than the one
    /// authorized to send it.
    #[error("unauthorized participant for call {id}")]
    UnauthorizedParticipant { id: String },

    /// The call already has an answer; a second one was rejected.
    #[error("call '{id}' already answered")]
    AlreadyAnswered { id: String },
}

/// Errors from publishing to an event sink.
#[derive(Debug, thiserror::Error)]
pub enum EventSinkError {
    /// The sink's outbound queue is full; the event was dropped rather than
    /// blocking the caller.
    #[error("event sink backpressure — event dropped")]
    BackpressureDropped,

    /// The sink adapter itself failed (e.g. the upstream connection is down).
    #[error("event sink '{name}' failed: {reason}")]
    SinkFailure { name: String, reason: String },
}

/// Errors from container runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The referenced container does not exist.
    #[error("container not found: {id}")]
    NotFound { id: String },

    /// The runtime refused or failed the operation.
    #[error("container runtime operation '{op}' failed for '{id}': {reason}")]
    OperationFailed {
        op: String,
        id: String,
        reason: String,
    },
}
