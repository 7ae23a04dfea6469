//! Stateless capability-token minting and verification.
//!
//! Unlike the persisted, hashed tokens used for local API authentication,
//! capability tokens here are never stored. A token is a base64-encoded
//! claims blob plus an HMAC-SHA256 signature over those claims, validated
//! purely from its own contents and a session-registry lookup. Rotating the
//! process-wide signing secret invalidates every outstanding token — that is
//! deliberate, not a bug.
//!
//! # Security model
//!
//! - Signing key: 256-bit, either supplied via config or drawn fresh from the
//!   OS CSPRNG at process start.
//! - Signature verification uses constant-time comparison (`subtle`) to
//!   avoid timing side-channels.
//! - Wire format: `base64(claims_json).base64(hmac_sha256(claims_json))`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::TokenError;
use crate::session::{SessionRegistry, SessionState};

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on a token's lifetime, regardless of session expiry or the
/// configured default.
const MAX_TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// The claims embedded in a capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// The session this token authorizes.
    pub session_id: String,
    /// Room id, copied from the session for convenience.
    pub room_id: String,
    /// Issued-at timestamp.
    pub iat: DateTime<Utc>,
    /// Expiry timestamp — `min(session.expiresAt, iat + defaultTokenLifetime, iat + 24h)`.
    pub exp: DateTime<Utc>,
}

/// A minted capability token: claims plus their signature, already encoded
/// for wire transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Base64-encoded JSON claims.
    pub claims: String,
    /// Base64-encoded HMAC-SHA256 signature over the claims bytes.
    pub signature: String,
}

impl Token {
    /// Render this token as the single-string wire format
    /// `claims.signature`, dot-separated.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}.{}", self.claims, self.signature)
    }

    /// Parse a token from the wire format produced by [`encode`](Token::encode).
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Malformed`] if the string does not have exactly
    /// one `.` separator.
    pub fn decode(wire: &str) -> Result<Self, TokenError> {
        let mut parts = wire.splitn(2, '.');
        let (Some(claims), Some(signature)) = (parts.next(), parts.next()) else {
            return Err(TokenError::Malformed {
                reason: "expected '<claims>.<signature>'".to_owned(),
            });
        };
        Ok(Self {
            claims: claims.to_owned(),
            signature: signature.to_owned(),
        })
    }
}

/// Mints and validates capability tokens against a shared signing secret.
pub struct TokenManager {
    secret: Vec<u8>,
    default_lifetime_secs: i64,
}

impl TokenManager {
    /// Construct a token manager with an explicit signing secret.
    #[must_use]
    pub fn new(secret: Vec<u8>, default_lifetime_secs: i64) -> Self {
        Self {
            secret,
            default_lifetime_secs,
        }
    }

    /// Construct a token manager with a fresh, process-random 256-bit secret.
    ///
    /// The secret is never logged or persisted — restarting the process
    /// invalidates every token minted under the previous secret.
    #[must_use]
    pub fn with_random_secret(default_lifetime_secs: i64) -> Self {
        use rand::RngCore;
        let mut secret = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self::new(secret, default_lifetime_secs)
    }

    /// Mint a capability token for the given session.
    ///
    /// `exp` is clamped to the earliest of: the session's own expiry, `iat +
    /// defaultTokenLifetime`, and `iat + 24h`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::SessionNotFound`] if the session does not exist,
    /// or [`TokenError::SessionNotActive`] if it is not currently `Active`.
    pub async fn generate(&self, registry: &SessionRegistry, session_id: &str) -> Result<Token, TokenError> {
        let session = registry
            .get(session_id)
            .await
            .map_err(|_| TokenError::SessionNotFound {
                session_id: session_id.to_owned(),
            })?;

        if session.state != SessionState::Active {
            return Err(TokenError::SessionNotActive {
                session_id: session_id.to_owned(),
            });
        }

        let iat = Utc::now();
        let default_exp = iat + Duration::seconds(self.default_lifetime_secs);
        let max_exp = iat + Duration::seconds(MAX_TOKEN_LIFETIME_SECS);
        let exp = session.expires_at.min(default_exp).min(max_exp);

        let claims = Claims {
            session_id: session.id.clone(),
            room_id: session.room_id.clone(),
            iat,
            exp,
        };

        self.sign(&claims)
    }

    /// Validate a token: signature, expiry, and the referenced session's
    /// current state.
    ///
    /// # Errors
    ///
    /// - [`TokenError::Malformed`] if the wire format or claims JSON is invalid.
    /// - [`TokenError::SignatureMismatch`] if the HMAC does not verify.
    /// - [`TokenError::Expired`] if `now >= exp`.
    /// - [`TokenError::SessionNotFound`] if the referenced session no longer exists.
    /// - [`TokenError::SessionNotActive`] if the referenced session is not `Active`.
    pub async fn validate(&self, registry: &SessionRegistry, wire: &str) -> Result<Claims, TokenError> {
        let token = Token::decode(wire)?;
        let claims_bytes = BASE64.decode(&token.claims).map_err(|e| TokenError::Malformed {
            reason: format!("invalid base64 claims: {e}"),
        })?;
        let signature_bytes = BASE64.decode(&token.signature).map_err(|e| TokenError::Malformed {
            reason: format!("invalid base64 signature: {e}"),
        })?;

        let expected = self.hmac(&claims_bytes);
        if expected.ct_eq(&signature_bytes).unwrap_u8() != 1 {
            return Err(TokenError::SignatureMismatch);
        }

        let claims: Claims = serde_json::from_slice(&claims_bytes).map_err(|e| TokenError::Malformed {
            reason: format!("invalid claims json: {e}"),
        })?;

        if Utc::now() >= claims.exp {
            return Err(TokenError::Expired {
                expired_at: claims.exp.to_rfc3339(),
            });
        }

        let session = registry
            .get(&claims.session_id)
            .await
            .map_err(|_| TokenError::SessionNotFound {
                session_id: claims.session_id.clone(),
            })?;

        if session.state != SessionState::Active {
            return Err(TokenError::SessionNotActive {
                session_id: claims.session_id.clone(),
            });
        }

        Ok(claims)
    }

    fn sign(&self, claims: &Claims) -> Result<Token, TokenError> {
        let claims_bytes = serde_json::to_vec(claims).map_err(|e| TokenError::Malformed {
            reason: format!("claims serialization failed: {e}"),
        })?;
        let signature = self.hmac(&claims_bytes);

        Ok(Token {
            claims: BASE64.encode(&claims_bytes),
            signature: BASE64.encode(signature),
        })
    }

    #[allow(clippy::unwrap_used)]
    fn hmac(&self, data: &[u8]) -> Vec<u8> {
        // HMAC-SHA256 accepts any key length per RFC 2104, so new_from_slice
        // never fails here.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret).unwrap();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn active_session(registry: &SessionRegistry) -> String {
        registry.create("c1", "!r:h", 3600).await.unwrap().id
    }

    #[tokio::test]
    async fn generate_then_validate_roundtrip() {
        let registry = SessionRegistry::new();
        let session_id = active_session(&registry).await;
        let manager = TokenManager::with_random_secret(300);

        let token = manager.generate(&registry, &session_id).await.unwrap();
        let claims = manager.validate(&registry, &token.encode()).await.unwrap();
        assert_eq!(claims.session_id, session_id);
    }

    #[tokio::test]
    async fn validate_rejects_tampered_signature() {
        let registry = SessionRegistry::new();
        let session_id = active_session(&registry).await;
        let manager = TokenManager::with_random_secret(300);

        let token = manager.generate(&registry, &session_id).await.unwrap();
        let wire = token.encode();
        let mut tampered = wire.clone();
        tampered.push('x');

        let result = manager.validate(&registry, &tampered).await;
        assert!(matches!(result, Err(TokenError::SignatureMismatch)));
    }

    #[tokio::test]
    async fn validate_rejects_expired_token() {
        let registry = SessionRegistry::new();
        let session_id = active_session(&registry).await;
        let manager = TokenManager::with_random_secret(-1);

        let token = manager.generate(&registry, &session_id).await.unwrap();
        let result = manager.validate(&registry, &token.encode()).await;
        assert!(matches!(result, Err(TokenError::Expired { .. })));
    }

    #[tokio::test]
    async fn validate_rejects_session_not_active() {
        let registry = SessionRegistry::new();
        let session_id = active_session(&registry).await;
        let manager = TokenManager::with_random_secret(300);

        let token = manager.generate(&registry, &session_id).await.unwrap();
        registry.end(&session_id).await.unwrap();

        let result = manager.validate(&registry, &token.encode()).await;
        assert!(matches!(result, Err(TokenError::SessionNotActive { .. })));
    }

    #[tokio::test]
    async fn generate_rejects_inactive_session() {
        let registry = SessionRegistry::new();
        let session_id = active_session(&registry).await;
        registry.end(&session_id).await.unwrap();
        let manager = TokenManager::with_random_secret(300);

        let result = manager.generate(&registry, &session_id).await;
        assert!(matches!(result, Err(TokenError::SessionNotActive { .. })));
    }

    #[tokio::test]
    async fn different_secrets_reject_each_others_tokens() {
        let registry = SessionRegistry::new();
        let session_id = active_session(&registry).await;
        let manager_a = TokenManager::with_random_secret(300);
        let manager_b = TokenManager::with_random_secret(300);

        let token = manager_a.generate(&registry, &session_id).await.unwrap();
        let result = manager_b.validate(&registry, &token.encode()).await;
        assert!(matches!(result, Err(TokenError::SignatureMismatch)));
    }

    #[test]
    fn decode_rejects_malformed_wire_format() {
        let result = Token::decode("no-dot-separator");
        assert!(matches!(result, Err(TokenError::Malformed { .. })));
    }
}
