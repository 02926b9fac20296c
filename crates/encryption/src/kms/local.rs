//! Local KMS
//!
//! Random primary keys live hex-encoded in `<keystore>/<key-id>.key`. The
//! handle names the key id; the keystore directory is the trust boundary.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{random_key_bytes, unwrap_data_key_with, wrap_data_key, KeyManagementService, KmsKind};
use crate::error::{EncryptionError, Result};
use crate::keys::{DataKey, PrimaryKey, PrimaryKeyHandle, WrappedDataKey, PRIMARY_KEY_SIZE};

const HANDLE_VERSION: u16 = 1;
const KEY_FILE_EXTENSION: &str = "key";

#[derive(Debug, Serialize, Deserialize)]
struct LocalHandle {
    version: u16,
    kms: KmsKind,
    app_id: String,
    key_id: Uuid,
}

/// KMS backed by a keystore directory
#[derive(Debug, Clone)]
pub struct LocalKeyManagementService {
    keystore: PathBuf,
}

impl LocalKeyManagementService {
    /// No I/O happens until the first operation.
    pub fn open(keystore: impl Into<PathBuf>) -> Self {
        Self {
            keystore: keystore.into(),
        }
    }

    pub fn keystore(&self) -> &Path {
        &self.keystore
    }

    fn key_path(&self, key_id: &Uuid) -> PathBuf {
        self.keystore.join(format!("{key_id}.{KEY_FILE_EXTENSION}"))
    }

    fn load(
        &self,
        handle: &PrimaryKeyHandle,
    ) -> std::result::Result<(LocalHandle, PrimaryKey), String> {
        let parsed: LocalHandle = serde_json::from_slice(handle.as_bytes())
            .map_err(|e| format!("malformed primary key handle: {e}"))?;
        if parsed.version != HANDLE_VERSION {
            return Err(format!("unsupported handle version {}", parsed.version));
        }
        if parsed.kms != KmsKind::Local {
            return Err(format!("handle was issued by {}", parsed.kms));
        }

        let path = self.key_path(&parsed.key_id);
        let encoded = Zeroizing::new(
            fs::read_to_string(&path)
                .map_err(|e| format!("keystore entry {} unreadable: {e}", path.display()))?,
        );
        let decoded = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| format!("keystore entry {} corrupt: {e}", path.display()))?,
        );
        if decoded.len() != PRIMARY_KEY_SIZE {
            return Err(format!(
                "keystore entry {} holds {} bytes, expected {PRIMARY_KEY_SIZE}",
                path.display(),
                decoded.len()
            ));
        }
        let mut bytes = [0u8; PRIMARY_KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        Ok((parsed, PrimaryKey::from_bytes(bytes)))
    }

    fn wrap_aad(handle: &LocalHandle) -> Vec<u8> {
        let mut aad = Vec::with_capacity(handle.app_id.len() + 16);
        aad.extend_from_slice(handle.app_id.as_bytes());
        aad.extend_from_slice(handle.key_id.as_bytes());
        aad
    }
}

impl KeyManagementService for LocalKeyManagementService {
    fn kind(&self) -> KmsKind {
        KmsKind::Local
    }

    #[instrument(skip(self), fields(keystore = %self.keystore.display()))]
    fn generate_primary_key(&self, app_id: &str) -> Result<PrimaryKeyHandle> {
        fs::create_dir_all(&self.keystore).map_err(|e| {
            EncryptionError::key_generation(format!(
                "keystore {} unreachable: {e}",
                self.keystore.display()
            ))
        })?;

        let key_id = Uuid::new_v4();
        let material = random_key_bytes();
        let encoded = Zeroizing::new(hex::encode(&*material));
        let path = self.key_path(&key_id);
        super::write_key_file(&path, encoded.as_bytes(), false).map_err(|e| {
            EncryptionError::key_generation(format!(
                "cannot write keystore entry {}: {e}",
                path.display()
            ))
        })?;

        let handle = LocalHandle {
            version: HANDLE_VERSION,
            kms: KmsKind::Local,
            app_id: app_id.to_string(),
            key_id,
        };
        info!(%key_id, "primary key stored");
        Ok(PrimaryKeyHandle::from_bytes(serde_json::to_vec(&handle)?))
    }

    #[instrument(skip_all)]
    fn generate_and_wrap_data_key(&self, primary: &PrimaryKeyHandle) -> Result<WrappedDataKey> {
        let (handle, primary) = self.load(primary).map_err(EncryptionError::KeyGeneration)?;
        let data_key = DataKey::from_bytes(*random_key_bytes());
        let wrapped = wrap_data_key(&primary, &data_key, &Self::wrap_aad(&handle))?;
        debug!(key_id = %handle.key_id, "data key wrapped");
        Ok(wrapped)
    }

    #[instrument(skip_all)]
    fn unwrap_data_key(
        &self,
        primary: &PrimaryKeyHandle,
        wrapped: &WrappedDataKey,
    ) -> Result<DataKey> {
        let (handle, primary) = self.load(primary).map_err(EncryptionError::Unwrap)?;
        unwrap_data_key_with(&primary, wrapped, &Self::wrap_aad(&handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_through_keystore() {
        let dir = TempDir::new().unwrap();
        let kms = LocalKeyManagementService::open(dir.path().join("keystore"));

        let handle = kms.generate_primary_key("reports").unwrap();
        let wrapped = kms.generate_and_wrap_data_key(&handle).unwrap();
        let key = kms.unwrap_data_key(&handle, &wrapped).unwrap();
        assert_eq!(key, kms.unwrap_data_key(&handle, &wrapped).unwrap());

        let entries = fs::read_dir(kms.keystore()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_each_primary_key_is_distinct() {
        let dir = TempDir::new().unwrap();
        let kms = LocalKeyManagementService::open(dir.path());

        let h1 = kms.generate_primary_key("reports").unwrap();
        let h2 = kms.generate_primary_key("reports").unwrap();
        assert_ne!(h1, h2);

        let wrapped = kms.generate_and_wrap_data_key(&h1).unwrap();
        assert!(matches!(
            kms.unwrap_data_key(&h2, &wrapped),
            Err(EncryptionError::Unwrap(_))
        ));
    }

    #[test]
    fn test_missing_keystore_entry() {
        let dir = TempDir::new().unwrap();
        let kms = LocalKeyManagementService::open(dir.path());
        let handle = kms.generate_primary_key("reports").unwrap();
        let wrapped = kms.generate_and_wrap_data_key(&handle).unwrap();

        let other = LocalKeyManagementService::open(dir.path().join("elsewhere"));
        assert!(matches!(
            other.unwrap_data_key(&handle, &wrapped),
            Err(EncryptionError::Unwrap(_))
        ));
        assert!(matches!(
            other.generate_and_wrap_data_key(&handle),
            Err(EncryptionError::KeyGeneration(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_keystore_entry_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let kms = LocalKeyManagementService::open(dir.path());
        kms.generate_primary_key("reports").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 1);
        let mode = entries[0].metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_unreachable_keystore() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let kms = LocalKeyManagementService::open(blocker.join("keystore"));
        assert!(matches!(
            kms.generate_primary_key("reports"),
            Err(EncryptionError::KeyGeneration(_))
        ));
    }
}
