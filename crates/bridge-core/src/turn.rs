//! TURN REST API time-limited credential minting.
//!
//! Implements the time-limited-credential scheme common to TURN REST APIs:
//! `username = "<exp>:<sessionId>"`, `password =
//! base64(HMAC-SHA1(username, sharedSecret))`. The downstream TURN server
//! validates credentials using the same shared secret without holding any
//! per-user state.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::TurnError;
use crate::session::{SessionRegistry, SessionState};

type HmacSha1 = Hmac<Sha1>;

/// Default TTL for minted TURN credentials when the caller doesn't specify one.
pub const DEFAULT_TURN_TTL_SECS: i64 = 600;

/// A minted TURN credential, ready to hand to a WebRTC client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TurnCredential {
    /// Time-limited username, `"<exp>:<sessionId>"`.
    pub username: String,
    /// Base64-encoded HMAC-SHA1 password.
    pub password: String,
    /// Seconds until this credential expires.
    pub ttl: i64,
    /// TURN/STUN server URIs the client should use.
    pub turn_servers: Vec<String>,
}

/// Mints time-limited TURN credentials bound to a session.
pub struct TurnCredentialMinter {
    shared_secret: Vec<u8>,
    turn_servers: Vec<String>,
}

impl TurnCredentialMinter {
    /// Construct a minter with an explicit shared secret and server list.
    #[must_use]
    pub fn new(shared_secret: Vec<u8>, turn_servers: Vec<String>) -> Self {
        Self {
            shared_secret,
            turn_servers,
        }
    }

    /// Mint a credential for `session_id`, valid for `ttl_secs` (defaults to
    /// [`DEFAULT_TURN_TTL_SECS`] if `None`).
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::SessionUnavailable`] if the session does not
    /// exist or is not currently `Active`.
    pub async fn mint(
        &self,
        registry: &SessionRegistry,
        session_id: &str,
        ttl_secs: Option<i64>,
    ) -> Result<TurnCredential, TurnError> {
        let session = registry
            .get(session_id)
            .await
            .map_err(|_| TurnError::SessionUnavailable {
                session_id: session_id.to_owned(),
            })?;

        if session.state != SessionState::Active {
            return Err(TurnError::SessionUnavailable {
                session_id: session_id.to_owned(),
            });
        }

        let ttl = ttl_secs.unwrap_or(DEFAULT_TURN_TTL_SECS).max(1);
        let expiry = Utc::now() + Duration::seconds(ttl);
        let username = format!("{}:{}", expiry.timestamp(), session_id);
        let password = self.sign(&username);

        Ok(TurnCredential {
            username,
            password,
            ttl,
            turn_servers: self.turn_servers.clone(),
        })
    }

    #[allow(clippy::unwrap_used)]
    fn sign(&self, username: &str) -> String {
        // HMAC-SHA1 accepts any key length per RFC 2104, so new_from_slice
        // never fails here.
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.shared_secret).unwrap();
        mac.update(username.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for TurnCredentialMinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCredentialMinter").finish_non_exhaustive()
    }
}
