//! Master key lifecycle for vaultsearch
//!
//! The key is 32 raw bytes, generated once and persisted exactly once with
//! owner-only permissions. Creation is gated on both "key present?" and
//! "data present?": a missing key next to existing ciphertext is an
//! operator problem, never something to paper over by generating a fresh
//! key that can decrypt nothing.

use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use aes_gcm::aead::OsRng;
use rand::RngCore;
use tempfile::NamedTempFile;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::KEY_LEN;

/// Permission mode for key directories (owner rwx only)
pub const DIR_PERMISSIONS: u32 = 0o700;

/// Permission mode for the key file (owner rw only)
pub const FILE_PERMISSIONS: u32 = 0o600;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key file holds {found} bytes, expected exactly {expected}")]
    InvalidKeyLength { found: usize, expected: usize },
    #[error(
        "Encrypted data exists but the key file is missing. Restore the original \
         key file from backup; generating a new key cannot decrypt the existing store."
    )]
    MissingKeyForExistingData,
    #[error("Key file I/O error: {0}")]
    Io(String),
}

/// Securely zeroed master key wrapper
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl MasterKey {
    /// Generate a new random master key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Create from existing bytes (takes ownership)
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { key: bytes }
    }

    /// Get reference to key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Copy the key for a second component that seals independently.
    /// The copy zeroizes on drop like the original.
    pub fn duplicate(&self) -> Self {
        Self { key: self.key }
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Set secure permissions on a path. No-op on non-Unix systems.
#[cfg(unix)]
pub fn set_secure_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    let perms = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn set_secure_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Create a directory with secure permissions (0o700), parents included.
pub fn create_secure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)?;
    set_secure_permissions(path, DIR_PERMISSIONS)
}

/// Owns loading and first-time generation of the master key.
pub struct KeyManager;

impl KeyManager {
    /// Load the key at `key_path`, or create it if neither key nor data
    /// exists yet.
    ///
    /// `data_present` reports whether encrypted artifacts already exist on
    /// disk. No key + data present fails with
    /// [`KeyError::MissingKeyForExistingData`] instead of fabricating a key.
    ///
    /// Idempotent: repeated calls with the same path return byte-identical
    /// keys.
    pub fn load_or_create(key_path: &Path, data_present: bool) -> Result<MasterKey, KeyError> {
        if key_path.exists() {
            return Self::read_key_file(key_path);
        }

        if data_present {
            tracing::error!(
                path = %key_path.display(),
                "key file missing while encrypted data exists"
            );
            return Err(KeyError::MissingKeyForExistingData);
        }

        let key = MasterKey::generate();
        Self::write_key_file(key_path, &key)?;
        tracing::info!(path = %key_path.display(), "generated new master key");
        Ok(key)
    }

    fn read_key_file(path: &Path) -> Result<MasterKey, KeyError> {
        let mut bytes = fs::read(path).map_err(|e| KeyError::Io(e.to_string()))?;

        if bytes.len() != KEY_LEN {
            let found = bytes.len();
            bytes.zeroize();
            return Err(KeyError::InvalidKeyLength {
                found,
                expected: KEY_LEN,
            });
        }

        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(MasterKey::from_bytes(key_bytes))
    }

    /// Persist the key atomically with 0o600, creating the parent directory
    /// with 0o700.
    fn write_key_file(path: &Path, key: &MasterKey) -> Result<(), KeyError> {
        let parent = path
            .parent()
            .ok_or_else(|| KeyError::Io("Key path has no parent directory".into()))?;
        create_secure_dir(parent).map_err(|e| KeyError::Io(e.to_string()))?;

        let mut temp = NamedTempFile::new_in(parent).map_err(|e| KeyError::Io(e.to_string()))?;
        temp.write_all(key.as_bytes())
            .map_err(|e| KeyError::Io(e.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| KeyError::Io(e.to_string()))?;
        #[cfg(unix)]
        {
            temp.as_file()
                .set_permissions(fs::Permissions::from_mode(FILE_PERMISSIONS))
                .map_err(|e| KeyError::Io(e.to_string()))?;
        }

        temp.persist(path).map_err(|e| KeyError::Io(e.to_string()))?;
        set_secure_permissions(path, FILE_PERMISSIONS).map_err(|e| KeyError::Io(e.to_string()))?;
        Ok(())
    }
}
