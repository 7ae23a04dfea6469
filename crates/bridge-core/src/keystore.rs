//! Encrypted credential keystore.
//!
//! Credential secrets are encrypted at rest through the [`Barrier`], with
//! AEAD additional data binding each ciphertext to its id and provider,
//! so a ciphertext copied to a different record key fails to decrypt.
//! Secrets are never logged, never included in error messages, and never
//! returned from [`Keystore::list`].

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::barrier::Barrier;
use crate::error::KeystoreError;
use crate::seed;

/// Storage prefix for credential records.
const CREDENTIAL_PREFIX: &str = "credentials/";

/// Closed set of upstream providers a credential may be scoped to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI.
    Openai,
    /// Anthropic.
    Anthropic,
    /// OpenRouter.
    Openrouter,
    /// Google.
    Google,
    /// xAI.
    Xai,
    /// A provider outside the closed set above.
    Other(String),
}

impl Provider {
    /// Infer a provider from a well-known secret-token prefix.
    ///
    /// Recognizes common vendor token prefixes: `sk-ant-` → anthropic,
    /// `sk-`/`sk-proj-` → openai.
    /// Returns `None` if no known prefix matches.
    #[must_use]
    pub fn infer_from_token(token: &str) -> Option<Self> {
        if token.starts_with("sk-ant-") {
            Some(Self::Anthropic)
        } else if token.starts_with("sk-proj-") || token.starts_with("sk-") {
            Some(Self::Openai)
        } else {
            None
        }
    }

    fn tag(&self) -> String {
        match self {
            Self::Openai => "openai".to_owned(),
            Self::Anthropic => "anthropic".to_owned(),
            Self::Openrouter => "openrouter".to_owned(),
            Self::Google => "google".to_owned(),
            Self::Xai => "xai".to_owned(),
            Self::Other(tag) => tag.clone(),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl PartialEq for Provider {
    fn eq(&self, other: &Self) -> bool {
        self.tag() == other.tag()
    }
}
impl Eq for Provider {}

/// A stored credential record, including the decrypted secret.
///
/// Returned only from [`Keystore::retrieve`] and [`Keystore::store`] — never
/// from [`Keystore::list`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Unique identifier, caller-supplied or `<provider>-default`.
    pub id: String,
    /// Upstream provider tag.
    pub provider: Provider,
    /// The secret token in plaintext (only populated here, never in `CredentialInfo`).
    pub token: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Free-form tags.
    pub tags: Vec<String>,
}

/// Metadata about a stored credential, with the secret bytes omitted.
///
/// This is the only shape [`Keystore::list`] returns — secrets are never
/// returned on a list call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialInfo {
    /// Unique identifier.
    pub id: String,
    /// Upstream provider tag.
    pub provider: Provider,
    /// Human-readable display name.
    pub display_name: String,
    /// Free-form tags.
    pub tags: Vec<String>,
}

impl From<&Credential> for CredentialInfo {
    fn from(cred: &Credential) -> Self {
        Self {
            id: cred.id.clone(),
            provider: cred.provider.clone(),
            display_name: cred.display_name.clone(),
            tags: cred.tags.clone(),
        }
    }
}

/// On-disk record shape (same fields as [`Credential`] — separated only so a
/// future schema migration doesn't have to touch the public API type).
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    provider: Provider,
    token: String,
    display_name: String,
    tags: Vec<String>,
}

/// Encrypted credential store: persists and retrieves [`Credential`] records
/// through the [`Barrier`].
pub struct Keystore {
    barrier: Arc<Barrier>,
    seed_path: PathBuf,
    key_derivation_context: Option<Vec<u8>>,
}

impl Keystore {
    /// Construct a keystore bound to the given barrier and seed file path.
    ///
    /// The keystore starts closed — call [`open`](Keystore::open) before use.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, seed_path: PathBuf) -> Self {
        Self { barrier, seed_path, key_derivation_context: None }
    }

    /// Construct a keystore with an operator-supplied extra context salt
    /// mixed into master-key derivation, beyond the application-fixed
    /// context string (`[keystore].key_derivation_context`).
    #[must_use]
    pub fn with_key_derivation_context(barrier: Arc<Barrier>, seed_path: PathBuf, context: Option<String>) -> Self {
        Self {
            barrier,
            seed_path,
            key_derivation_context: context.map(String::into_bytes),
        }
    }

    /// Load (or create) the hardware-rooted seed, derive the master key, and
    /// open the barrier.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed file cannot be read, created, or has
    /// insecure permissions — surfaced to the caller as a fatal startup error.
    pub async fn open(&self) -> Result<(), crate::error::SeedError> {
        let context_salt = self.key_derivation_context.as_deref();
        let master_key = seed::load_or_create(&self.seed_path, context_salt).await?;
        self.barrier.open(master_key).await;
        info!("keystore opened");
        Ok(())
    }

    /// Close the keystore, zeroizing the master key from memory.
    pub async fn close(&self) {
        self.barrier.close().await;
        info!("keystore closed");
    }

    /// Store (insert or overwrite) a credential.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::Barrier`] if encryption or storage fails.
    pub async fn store(&self, cred: &Credential) -> Result<(), KeystoreError> {
        let record = StoredRecord {
            id: cred.id.clone(),
            provider: cred.provider.clone(),
            token: cred.token.clone(),
            display_name: cred.display_name.clone(),
            tags: cred.tags.clone(),
        };

        let bytes = serde_json::to_vec(&record).map_err(|e| {
            KeystoreError::Barrier(crate::error::BarrierError::Crypto(
                crate::error::CryptoError::Encryption {
                    reason: format!("credential serialization failed: {e}"),
                },
            ))
        })?;

        let key = format!("{CREDENTIAL_PREFIX}{}", cred.id);
        let aad = aad_for_id(&cred.id);
        self.barrier.put_aad(&key, &bytes, &aad).await?;

        info!(id = %cred.id, provider = %cred.provider, "credential stored");
        Ok(())
    }

    /// Retrieve a credential by id, including its decrypted secret.
    ///
    /// # Errors
    ///
    /// - [`KeystoreError::NotFound`] if no credential has this id.
    /// - [`KeystoreError::DecryptionFailure`] if the stored record can't be
    ///   decrypted — never falls back to a stale or partial value.
    /// - [`KeystoreError::Barrier`] if the underlying storage fails.
    pub async fn retrieve(&self, id: &str) -> Result<Credential, KeystoreError> {
        // AAD is bound to id alone (not provider — the provider lives in the
        // encrypted record content, so binding on it too would be redundant
        // and would force the caller to know it ahead of decryption).
        let key = format!("{CREDENTIAL_PREFIX}{id}");
        let aad = aad_for_id(id);
        let data = self
            .barrier
            .get_aad(&key, &aad)
            .await
            .map_err(|e| match e {
                crate::error::BarrierError::Crypto(inner) => {
                    KeystoreError::DecryptionFailure(id.to_owned(), inner)
                }
                other => KeystoreError::Barrier(other),
            })?
            .ok_or_else(|| KeystoreError::NotFound { id: id.to_owned() })?;

        let record: StoredRecord = serde_json::from_slice(&data).map_err(|e| {
            KeystoreError::DecryptionFailure(
                id.to_owned(),
                crate::error::CryptoError::Decryption {
                    reason: format!("credential deserialization failed: {e}"),
                },
            )
        })?;

        Ok(Credential {
            id: record.id,
            provider: record.provider,
            token: record.token,
            display_name: record.display_name,
            tags: record.tags,
        })
    }

    /// List credential metadata, optionally filtered by provider.
    ///
    /// Never includes secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::Barrier`] if storage fails. Individual
    /// records that fail to decrypt are skipped with a warning rather than
    /// failing the whole listing, since `list` is a best-effort metadata view.
    pub async fn list(&self, provider_filter: Option<Provider>) -> Result<Vec<CredentialInfo>, KeystoreError> {
        let keys = self.barrier.list(CREDENTIAL_PREFIX).await?;
        let mut infos = Vec::with_capacity(keys.len());

        for key in &keys {
            let Some(id) = key.strip_prefix(CREDENTIAL_PREFIX) else {
                continue;
            };
            match self.retrieve(id).await {
                Ok(cred) => {
                    if let Some(ref want) = provider_filter {
                        if tag_of(&cred.provider) != tag_of(want) {
                            continue;
                        }
                    }
                    infos.push(CredentialInfo::from(&cred));
                }
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "skipping unreadable credential during list");
                }
            }
        }

        Ok(infos)
    }

    /// Delete a credential by id.
    ///
    /// # Errors
    ///
    /// - [`KeystoreError::NotFound`] if no credential has this id.
    /// - [`KeystoreError::Barrier`] if storage fails.
    pub async fn delete(&self, id: &str) -> Result<(), KeystoreError> {
        let key = format!("{CREDENTIAL_PREFIX}{id}");
        // Confirm existence first (ciphertext presence only, ignoring any
        // decryption outcome) so delete on an unknown id is NotFound, not a
        // silent no-op (storage deletes are idempotent by design).
        if !self.barrier.exists(&key).await? {
            return Err(KeystoreError::NotFound { id: id.to_owned() });
        }
        self.barrier.delete(&key).await?;
        info!(id = %id, "credential deleted");
        Ok(())
    }
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore").finish_non_exhaustive()
    }
}

fn tag_of(provider: &Provider) -> String {
    provider.tag()
}

/// AAD used for storing a record — id-only, so retrieval doesn't need to
/// know the provider up front. Provider consistency is a content-level
/// concern once decrypted, not a ciphertext-binding one.
fn aad_for_id(id: &str) -> Vec<u8> {
    format!("cred|{id}").into_bytes()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bridge_storage::MemoryBackend;

    async fn open_keystore() -> (Keystore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        let keystore = Keystore::new(barrier, dir.path().join("keystore.seed"));
        keystore.open().await.unwrap();
        (keystore, dir)
    }

    fn sample(id: &str) -> Credential {
        Credential {
            id: id.to_owned(),
            provider: Provider::Openai,
            token: "sk-AAA".to_owned(),
            display_name: "X".to_owned(),
            tags: vec!["prod".to_owned()],
        }
    }

    #[tokio::test]
    async fn store_then_retrieve_roundtrip() {
        let (ks, _dir) = open_keystore().await;
        ks.store(&sample("openai-default")).await.unwrap();

        let cred = ks.retrieve("openai-default").await.unwrap();
        assert_eq!(cred.token, "sk-AAA");
        assert_eq!(cred.id, "openai-default");
    }

    #[tokio::test]
    async fn list_never_contains_token() {
        let (ks, _dir) = open_keystore().await;
        ks.store(&sample("openai-default")).await.unwrap();

        let infos = ks.list(None).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, "openai-default");
        // CredentialInfo has no `token` field at all — this is a compile-time
        // guarantee, not just a runtime check.
    }

    #[tokio::test]
    async fn retrieve_missing_is_not_found() {
        let (ks, _dir) = open_keystore().await;
        let result = ks.retrieve("missing").await;
        assert!(matches!(result, Err(KeystoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let (ks, _dir) = open_keystore().await;
        let result = ks.delete("missing").await;
        assert!(matches!(result, Err(KeystoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn store_overwrite_replaces_record() {
        let (ks, _dir) = open_keystore().await;
        ks.store(&sample("openai-default")).await.unwrap();

        let mut updated = sample("openai-default");
        updated.token = "sk-BBB".to_owned();
        ks.store(&updated).await.unwrap();

        let cred = ks.retrieve("openai-default").await.unwrap();
        assert_eq!(cred.token, "sk-BBB");
    }

    #[tokio::test]
    async fn list_filters_by_provider() {
        let (ks, _dir) = open_keystore().await;
        ks.store(&sample("openai-default")).await.unwrap();

        let mut anthropic = sample("anthropic-default");
        anthropic.provider = Provider::Anthropic;
        ks.store(&anthropic).await.unwrap();

        let infos = ks.list(Some(Provider::Anthropic)).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, "anthropic-default");
    }

    #[tokio::test]
    async fn key_derivation_context_changes_the_derived_key() {
        let dir = tempfile::tempdir().unwrap();
        let seed_path = dir.path().join("keystore.seed");
        let storage: Arc<dyn bridge_storage::StorageBackend> = Arc::new(MemoryBackend::new());

        let barrier_a = Arc::new(Barrier::new(Arc::clone(&storage)));
        let ks_a =
            Keystore::with_key_derivation_context(barrier_a, seed_path.clone(), Some("tenant-a".to_owned()));
        ks_a.open().await.unwrap();
        ks_a.store(&sample("openai-default")).await.unwrap();

        let barrier_b = Arc::new(Barrier::new(Arc::clone(&storage)));
        let ks_b = Keystore::with_key_derivation_context(barrier_b, seed_path, Some("tenant-b".to_owned()));
        ks_b.open().await.unwrap();

        let err = ks_b.retrieve("openai-default").await.unwrap_err();
        assert!(matches!(err, KeystoreError::DecryptionFailure(..)));
    }

    #[tokio::test]
    async fn provider_inferred_from_token_prefix() {
        assert_eq!(Provider::infer_from_token("sk-ant-xyz"), Some(Provider::Anthropic));
        assert_eq!(Provider::infer_from_token("sk-proj-xyz"), Some(Provider::Openai));
        assert_eq!(Provider::infer_from_token("sk-xyz"), Some(Provider::Openai));
        assert_eq!(Provider::infer_from_token("xyz"), None);
    }
}
