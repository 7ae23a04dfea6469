//! JSON-RPC error mapping.
//!
//! Maps every domain error from `bridge-core` onto the closed numeric error
//! code taxonomy the control socket exposes. Only the typed code and a short
//! message ever cross the wire — no stack traces, no secret material, no
//! internal variant names.

use bridge_core::error::{
    BarrierError, BudgetError, CallError, ContainerError, KeystoreError, SecurityError, SeedError,
    SessionError, TokenError, TurnError,
};

/// Malformed JSON that couldn't even be parsed as a request envelope.
pub const MALFORMED_REQUEST: i32 = -32700;
/// The requested method isn't in the dispatch table.
pub const UNKNOWN_METHOD: i32 = -32601;
/// Request params failed to deserialize into the method's expected shape.
pub const INVALID_PARAMS: i32 = -32602;
/// The referenced resource does not exist.
pub const NOT_FOUND: i32 = -32010;
/// The operation conflicts with an existing resource.
pub const ALREADY_EXISTS: i32 = -32011;
/// The caller is not authorized for this operation.
pub const UNAUTHORIZED: i32 = -32020;
/// The caller exceeded a rate limit.
pub const RATE_LIMITED: i32 = -32021;
/// A token/usage budget was exceeded.
pub const BUDGET_EXCEEDED: i32 = -32030;
/// A wall-clock duration budget was exceeded.
pub const DURATION_EXCEEDED: i32 = -32031;
/// The referenced resource has expired or is no longer active.
pub const EXPIRED: i32 = -32032;
/// A policy rule denied the operation.
pub const POLICY_VIOLATION: i32 = -32040;
/// Local storage I/O failed.
pub const INTERNAL_STORAGE_IO: i32 = -32500;
/// Decryption of a stored record failed.
pub const DECRYPTION_FAILURE: i32 = -32501;
/// A required upstream dependency (TURN server, container runtime, Matrix) is unavailable.
pub const UPSTREAM_UNAVAILABLE: i32 = -32510;

/// A JSON-RPC error: a closed numeric code plus a short, safe-to-display message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    #[must_use]
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, reason.into())
    }

    #[must_use]
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(NOT_FOUND, reason.into())
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

fn barrier_code(err: &BarrierError) -> i32 {
    match err {
        BarrierError::Closed => UPSTREAM_UNAVAILABLE,
        BarrierError::Crypto(_) | BarrierError::Storage(_) => INTERNAL_STORAGE_IO,
    }
}

impl From<KeystoreError> for RpcError {
    fn from(err: KeystoreError) -> Self {
        let code = match &err {
            KeystoreError::NotFound { .. } => NOT_FOUND,
            KeystoreError::AlreadyExists { .. } => ALREADY_EXISTS,
            KeystoreError::DecryptionFailure(..) => DECRYPTION_FAILURE,
            KeystoreError::UnknownProvider { .. } => INVALID_PARAMS,
            KeystoreError::Barrier(inner) => barrier_code(inner),
        };
        Self::new(code, err.to_string())
    }
}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        let code = match &err {
            SessionError::NotFound { .. } => NOT_FOUND,
            SessionError::InvalidTtl => INVALID_PARAMS,
            SessionError::InvalidTransition { .. } => POLICY_VIOLATION,
            // Not-Active means the session has already left the live window
            // the caller expected to operate in — surfaced the same way an
            // outright-expired session would be.
            SessionError::NotActive { .. } => EXPIRED,
        };
        Self::new(code, err.to_string())
    }
}

impl From<TokenError> for RpcError {
    fn from(err: TokenError) -> Self {
        let code = match &err {
            TokenError::SignatureMismatch => UNAUTHORIZED,
            TokenError::Expired { .. } => EXPIRED,
            TokenError::Malformed { .. } => INVALID_PARAMS,
            TokenError::SessionNotFound { .. } => NOT_FOUND,
            // A session that has ended or expired renders every outstanding
            // token for it expired, not merely unauthorized.
            TokenError::SessionNotActive { .. } => EXPIRED,
        };
        Self::new(code, err.to_string())
    }
}

impl From<TurnError> for RpcError {
    fn from(err: TurnError) -> Self {
        // Mirrors the SessionNotActive -> Expired mapping above: the only
        // variant this error has covers both "never existed" and "no longer
        // active", and the latter is the case operators actually need to
        // distinguish from a hard NotFound, so it is reported as Expired.
        Self::new(EXPIRED, err.to_string())
    }
}

impl From<BudgetError> for RpcError {
    fn from(err: BudgetError) -> Self {
        let code = match &err {
            BudgetError::NotFound { .. } => NOT_FOUND,
            BudgetError::BudgetExceeded { .. } => BUDGET_EXCEEDED,
            BudgetError::DurationExceeded { .. } => DURATION_EXCEEDED,
            BudgetError::Closed { .. } => POLICY_VIOLATION,
        };
        Self::new(code, err.to_string())
    }
}

impl From<SecurityError> for RpcError {
    fn from(err: SecurityError) -> Self {
        let code = match &err {
            SecurityError::RateLimited { .. } => RATE_LIMITED,
            SecurityError::ConcurrencyLimit { .. } | SecurityError::Blocked { .. } | SecurityError::NotAllowed { .. } => {
                POLICY_VIOLATION
            }
        };
        Self::new(code, err.to_string())
    }
}

impl From<CallError> for RpcError {
    fn from(err: CallError) -> Self {
        let code = match &err {
            CallError::NotFound { .. } => NOT_FOUND,
            CallError::Terminal { .. } => POLICY_VIOLATION,
            CallError::UnauthorizedParticipant { .. } => UNAUTHORIZED,
            CallError::AlreadyAnswered { .. } => ALREADY_EXISTS,
        };
        Self::new(code, err.to_string())
    }
}

impl From<ContainerError> for RpcError {
    fn from(err: ContainerError) -> Self {
        let code = match &err {
            ContainerError::NotFound { .. } => NOT_FOUND,
            ContainerError::OperationFailed { .. } => UPSTREAM_UNAVAILABLE,
        };
        Self::new(code, err.to_string())
    }
}

impl From<SeedError> for RpcError {
    fn from(err: SeedError) -> Self {
        Self::new(INTERNAL_STORAGE_IO, err.to_string())
    }
}
