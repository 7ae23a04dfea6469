//! Hardware-rooted seed and master-key derivation for the keystore.
//!
//! Resolves the seed source as a file with restricted permissions: a
//! 32-byte file generated from the OS CSPRNG on first run, at
//! `[keystore].seed_path` (default `<runtime>/keystore.seed`), created with
//! mode `0600`. On every subsequent `open()`, the file's permission bits are
//! re-checked before the seed is trusted — a seed file readable by anyone
//! other than its owner is refused rather than silently used.
//!
//! The master key is derived from the seed via HKDF-SHA256 with a fixed,
//! application-specific context string, never the seed itself.

use std::path::{Path, PathBuf};

use rand::RngCore;
use tokio::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::crypto::{self, EncryptionKey};
use crate::error::SeedError;

/// HKDF `info` string binding derived keys to this application and version.
const MASTER_KEY_CONTEXT: &[u8] = b"agentbridge-keystore-master-v1";

/// Required seed file length in bytes.
const SEED_LEN: usize = 32;

/// Owner-only file mode for the seed file.
#[cfg(unix)]
const SEED_MODE: u32 = 0o600;

/// Load the hardware-rooted seed from `path`, generating one on first run.
///
/// Returns the derived master key. The raw seed never leaves this function.
///
/// # Errors
///
/// - [`SeedError::Io`] if the file or its parent directory can't be created
///   or read.
/// - [`SeedError::Corrupt`] if an existing seed file isn't exactly 32 bytes.
/// - [`SeedError::InsecurePermissions`] if an existing seed file is readable
///   by group or other.
pub async fn load_or_create(path: &Path, context_salt: Option<&[u8]>) -> Result<EncryptionKey, SeedError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| SeedError::Io {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
    }

    let seed = match fs::metadata(path).await {
        Ok(_) => read_existing(path).await?,
        Err(_) => generate_new(path).await?,
    };

    let root_key = EncryptionKey::from_bytes(seed);
    crypto::derive_key(&root_key, context_salt, MASTER_KEY_CONTEXT).map_err(|e| SeedError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

async fn read_existing(path: &Path) -> Result<[u8; 32], SeedError> {
    check_permissions(path).await?;

    let bytes = fs::read(path).await.map_err(|e| SeedError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    if bytes.len() != SEED_LEN {
        return Err(SeedError::Corrupt {
            path: path.display().to_string(),
            reason: format!("expected {SEED_LEN} bytes, found {}", bytes.len()),
        });
    }

    let mut seed = [0u8; SEED_LEN];
    seed.copy_from_slice(&bytes);
    Ok(seed)
}

async fn generate_new(path: &Path) -> Result<[u8; 32], SeedError> {
    let mut seed = [0u8; SEED_LEN];
    rand::rngs::OsRng.fill_bytes(&mut seed);

    fs::write(path, seed).await.map_err(|e| SeedError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    restrict_permissions(path).await?;

    tracing::info!(path = %path.display(), "generated new keystore seed");
    Ok(seed)
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), SeedError> {
    let perms = std::fs::Permissions::from_mode(SEED_MODE);
    fs::set_permissions(path, perms)
        .await
        .map_err(|e| SeedError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), SeedError> {
    Ok(())
}

#[cfg(unix)]
async fn check_permissions(path: &Path) -> Result<(), SeedError> {
    let meta = fs::metadata(path).await.map_err(|e| SeedError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mode = meta.permissions().mode() & 0o777;
    if mode != SEED_MODE {
        return Err(SeedError::InsecurePermissions {
            path: path.display().to_string(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
async fn check_permissions(_path: &Path) -> Result<(), SeedError> {
    Ok(())
}

/// Default seed path relative to a runtime directory.
#[must_use]
pub fn default_seed_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("keystore.seed")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_and_reloads_same_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.seed");

        let key1 = load_or_create(&path, None).await.unwrap();
        let key2 = load_or_create(&path, None).await.unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[tokio::test]
    async fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("keystore.seed");

        assert!(load_or_create(&path, None).await.is_ok());
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn seed_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.seed");
        load_or_create(&path, None).await.unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn insecure_permissions_are_refused() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.seed");
        load_or_create(&path, None).await.unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let result = load_or_create(&path, None).await;
        assert!(matches!(result, Err(SeedError::InsecurePermissions { .. })));
    }

    #[tokio::test]
    async fn corrupt_seed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.seed");
        tokio::fs::write(&path, b"too short").await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }

        let result = load_or_create(&path, None).await;
        assert!(matches!(result, Err(SeedError::Corrupt { .. })));
    }
}
