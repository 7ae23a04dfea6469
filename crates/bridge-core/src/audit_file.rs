//! File-based audit backend with at-rest encryption.
//!
//! Appends one encrypted line per audit record: the record is serialized to
//! JSON, encrypted with AES-256-GCM, then base64-encoded so the ciphertext
//! (which may contain arbitrary bytes, including newlines) stays safely
//! newline-delimited on disk. The file is opened append-only — no update or
//! delete operation is ever performed.
//!
//! # Thread safety
//!
//! A `tokio::sync::Mutex` around the file handle serializes writes. This is
//! acceptable because audit writes are infrequent relative to request
//! throughput and the critical section is tiny (one `write_all`).

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::{AuditBackend, AuditRecord};
use crate::crypto::{self, EncryptionKey};
use crate::error::AuditError;

/// Audit backend that writes base64(AES-256-GCM(JSON)) lines to a file.
pub struct FileAuditBackend {
    path: PathBuf,
    key: EncryptionKey,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl FileAuditBackend {
    /// Create a new file audit backend writing to `path`, encrypting every
    /// record with `key`.
    ///
    /// The file is created (or opened for append) lazily on the first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>, key: EncryptionKey) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            key,
            writer: Mutex::new(None),
        }
    }

    async fn get_writer(&self) -> Result<tokio::sync::MutexGuard<'_, Option<tokio::fs::File>>, AuditError> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| AuditError::Io {
                    reason: format!("failed to open audit file '{}': {e}", self.path.display()),
                })?;
            *guard = Some(file);
        }
        Ok(guard)
    }
}

#[async_trait::async_trait]
impl AuditBackend for FileAuditBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn log(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let plaintext = serde_json::to_vec(record).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;

        let ciphertext = crypto::encrypt(&self.key, &plaintext).map_err(|e| AuditError::Serialization {
            reason: format!("audit record encryption failed: {e}"),
        })?;

        let mut line = BASE64.encode(ciphertext).into_bytes();
        line.push(b'\n');

        let mut guard = self.get_writer().await?;
        let file = guard.as_mut().ok_or_else(|| AuditError::Io {
            reason: "file handle unexpectedly None after open".to_owned(),
        })?;

        file.write_all(&line).await.map_err(|e| AuditError::Io {
            reason: format!("write failed: {e}"),
        })?;

        file.flush().await.map_err(|e| AuditError::Io {
            reason: format!("flush failed: {e}"),
        })?;

        Ok(())
    }
}

impl std::fmt::Debug for FileAuditBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Decrypt and parse every record currently in an audit file, in order.
///
/// Intended for operator tooling / tests, not the hot write path.
///
/// # Errors
///
/// Returns [`AuditError::Io`] if the file cannot be read, or
/// [`AuditError::Serialization`] if a line fails to decode, decrypt, or parse.
pub async fn read_all(path: impl AsRef<Path>, key: &EncryptionKey) -> Result<Vec<AuditRecord>, AuditError> {
    let contents = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| AuditError::Io {
        reason: format!("failed to read audit file '{}': {e}", path.as_ref().display()),
    })?;

    let mut records = Vec::new();
    for line in contents.lines().filter(|l| !l.is_empty()) {
        let ciphertext = BASE64.decode(line).map_err(|e| AuditError::Serialization {
            reason: format!("invalid base64 audit line: {e}"),
        })?;
        let plaintext = crypto::decrypt(key, &ciphertext).map_err(|e| AuditError::Serialization {
            reason: format!("audit record decryption failed: {e}"),
        })?;
        let record: AuditRecord = serde_json::from_slice(&plaintext).map_err(|e| AuditError::Serialization {
            reason: format!("invalid audit record json: {e}"),
        })?;
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditOutcome};

    fn sample(resource: &str) -> AuditRecord {
        AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            actor: "alice".to_owned(),
            action: AuditAction::AdmissionGranted,
            resource: resource.to_owned(),
            outcome: AuditOutcome::Granted,
            detail: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn write_then_read_all_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let key = EncryptionKey::generate();
        let backend = FileAuditBackend::new(&path, key.clone());

        backend.log(&sample("session-1")).await.unwrap();
        backend.log(&sample("session-2")).await.unwrap();

        let records = read_all(&path, &key).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].resource, "session-1");
        assert_eq!(records[1].resource, "session-2");
    }

    #[tokio::test]
    async fn wrong_key_fails_to_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let key = EncryptionKey::generate();
        let backend = FileAuditBackend::new(&path, key);

        backend.log(&sample("session-1")).await.unwrap();

        let wrong_key = EncryptionKey::generate();
        let result = read_all(&path, &wrong_key).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn file_is_append_only_across_backends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let key = EncryptionKey::generate();

        {
            let backend = FileAuditBackend::new(&path, key.clone());
            backend.log(&sample("session-1")).await.unwrap();
        }
        {
            let backend = FileAuditBackend::new(&path, key.clone());
            backend.log(&sample("session-2")).await.unwrap();
        }

        let records = read_all(&path, &key).await.unwrap();
        assert_eq!(records.len(), 2);
    }
}
