//! Encryption barrier for the bridge daemon keystore.
//!
//! The barrier is the core security invariant of the keystore: every byte
//! that touches the storage backend passes through the barrier's
//! encrypt/decrypt. The storage layer only ever sees ciphertext.
//!
//! While closed, the barrier rejects all operations with
//! [`BarrierError::Closed`].
//!
//! # Security model
//!
//! - The master key lives only in process memory, never on disk in plaintext.
//! - All values are encrypted with AES-256-GCM (fresh nonce per write).
//! - Keys (storage paths) are stored in plaintext to support prefix listing.
//! - `close()` zeroizes the master key from memory immediately.

use std::sync::Arc;

use tokio::sync::RwLock;

use bridge_storage::StorageBackend;

use crate::crypto::{self, EncryptionKey};
use crate::error::BarrierError;

/// The encryption barrier wrapping a storage backend.
///
/// All reads decrypt, all writes encrypt. When closed, all operations return
/// [`BarrierError::Closed`].
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    key: RwLock<Option<EncryptionKey>>,
}

impl Barrier {
    /// Create a new closed barrier wrapping the given storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            key: RwLock::new(None),
        }
    }

    /// Open the barrier by providing the master encryption key.
    pub async fn open(&self, key: EncryptionKey) {
        let mut guard = self.key.write().await;
        *guard = Some(key);
    }

    /// Close the barrier, zeroizing the master key from memory.
    ///
    /// After this call, all operations return [`BarrierError::Closed`]. The
    /// key is zeroized via its `ZeroizeOnDrop` implementation when the old
    /// `Option<EncryptionKey>` is replaced with `None`.
    pub async fn close(&self) {
        let mut guard = self.key.write().await;
        *guard = None;
    }

    /// Check whether the barrier is currently open.
    pub async fn is_open(&self) -> bool {
        self.key.read().await.is_some()
    }

    /// Read a value from storage, decrypting it through the barrier with the
    /// given additional authenticated data.
    ///
    /// Returns `Ok(None)` if the key does not exist in storage.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Closed`] if the keystore is closed.
    /// - [`BarrierError::Crypto`] if decryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn get_aad(&self, key: &str, aad: &[u8]) -> Result<Option<Vec<u8>>, BarrierError> {
        let root_key = self.root_key().await?;

        let encrypted = self.storage.get(key).await?;
        match encrypted {
            None => Ok(None),
            Some(ciphertext) => {
                let plaintext = crypto::decrypt_with_aad(&root_key, &ciphertext, aad)?;
                Ok(Some(plaintext))
            }
        }
    }

    /// Write a value to storage, encrypting it through the barrier with the
    /// given additional authenticated data.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Closed`] if the keystore is closed.
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn put_aad(&self, key: &str, value: &[u8], aad: &[u8]) -> Result<(), BarrierError> {
        let root_key = self.root_key().await?;

        let ciphertext = crypto::encrypt_with_aad(&root_key, value, aad)?;
        self.storage.put(key, &ciphertext).await?;
        Ok(())
    }

    /// Read a value with no AAD binding.
    ///
    /// # Errors
    ///
    /// See [`get_aad`](Barrier::get_aad).
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        self.get_aad(key, b"").await
    }

    /// Write a value with no AAD binding.
    ///
    /// # Errors
    ///
    /// See [`put_aad`](Barrier::put_aad).
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        self.put_aad(key, value, b"").await
    }

    /// Check whether a key exists in storage, without attempting to decrypt
    /// its value.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Closed`] if the keystore is closed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn exists(&self, key: &str) -> Result<bool, BarrierError> {
        let _root_key = self.root_key().await?;
        let found = self.storage.exists(key).await?;
        Ok(found)
    }

    /// Delete a key from storage.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Closed`] if the keystore is closed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        let _root_key = self.root_key().await?;
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List keys with the given prefix.
    ///
    /// Keys (paths) are not encrypted — only values are. This allows prefix
    /// listing to work without a separate index.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Closed`] if the keystore is closed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        let _root_key = self.root_key().await?;
        let keys = self.storage.list(prefix).await?;
        Ok(keys)
    }

    /// Clone the current master key (if open).
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Closed`] if the keystore is closed.
    async fn root_key(&self) -> Result<EncryptionKey, BarrierError> {
        let guard = self.key.read().await;
        guard.clone().ok_or(BarrierError::Closed)
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("open", &"<check with is_open()>")
            .finish_non_exhaustive()
    }
}
