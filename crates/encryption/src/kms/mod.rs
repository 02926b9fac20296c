//! Key Management Service
//!
//! Capability contract for the two-tier key hierarchy: create a primary key,
//! generate-and-wrap a data key under it, unwrap a data key. Backends are
//! selected by [`KmsConfig`]; anything implementing
//! [`KeyManagementService`] is a drop-in replacement.
//!
//! ## Persisted key files
//!
//! The primary key handle and the wrapped data key are stored as opaque
//! blobs at caller-chosen paths (see [`init_key_files`] and
//! [`load_data_key`]), readable by the owner only. Existing key files are
//! never replaced unless the caller asks for it with [`replace_key_files`],
//! since everything sealed under the old data key would become unreadable.
//! Plaintext data keys are never written anywhere.

mod config;
mod local;
mod simple;

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::error::{EncryptionError, Result};
use crate::keys::{DataKey, PrimaryKey, PrimaryKeyHandle, WrappedDataKey, DATA_KEY_SIZE};
use crate::mode::{GCM_NONCE_LEN, GCM_TAG_LEN};

pub use config::{
    KmsConfig, DATA_KEY_PATH, KMS_TYPE, LOCAL_KEYSTORE_PATH, PRIMARY_KEY_PATH, SIMPLE_APP_ID,
    SIMPLE_APP_KEY,
};
pub use local::LocalKeyManagementService;
pub use simple::SimpleKeyManagementService;

/// Version byte of the wrapped data key layout shared by the in-process KMSs
const WRAP_FORMAT_VERSION: u8 = 1;

/// `[version:1][nonce:12][AES-256-GCM(dek):32 + tag:16]`
pub const WRAPPED_DATA_KEY_SIZE: usize = 1 + GCM_NONCE_LEN + DATA_KEY_SIZE + GCM_TAG_LEN;

/// KMS backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KmsKind {
    /// Primary key derived from an application id and secret
    #[serde(rename = "SimpleKeyManagementService")]
    Simple,
    /// Primary key material kept in a local keystore directory
    #[serde(rename = "LocalKeyManagementService")]
    Local,
}

impl KmsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KmsKind::Simple => "SimpleKeyManagementService",
            KmsKind::Local => "LocalKeyManagementService",
        }
    }
}

impl fmt::Display for KmsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KmsKind {
    type Err = EncryptionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simplekeymanagementservice" | "simple" => Ok(KmsKind::Simple),
            "localkeymanagementservice" | "local" => Ok(KmsKind::Local),
            other => Err(EncryptionError::InvalidConfiguration(format!(
                "unknown kms_type `{other}`"
            ))),
        }
    }
}

/// Key management capability set
pub trait KeyManagementService: Send + Sync + fmt::Debug {
    /// Backend variant
    fn kind(&self) -> KmsKind;

    /// Create (or re-derive) the primary key for an application identity.
    ///
    /// Persists nothing itself; the caller decides where the handle lives.
    fn generate_primary_key(&self, app_id: &str) -> Result<PrimaryKeyHandle>;

    /// Create a fresh random data key and return it wrapped under the primary key.
    ///
    /// Fails with [`EncryptionError::KeyGeneration`] when the backend is
    /// unreachable or the handle does not match this service's credentials.
    fn generate_and_wrap_data_key(&self, primary: &PrimaryKeyHandle) -> Result<WrappedDataKey>;

    /// Reverse the wrapping.
    ///
    /// Fails with [`EncryptionError::Unwrap`] when the wrapped key is
    /// malformed or the primary key does not match.
    fn unwrap_data_key(
        &self,
        primary: &PrimaryKeyHandle,
        wrapped: &WrappedDataKey,
    ) -> Result<DataKey>;
}

/// Draw a fresh data key from the OS RNG
pub(crate) fn random_key_bytes() -> Zeroizing<[u8; DATA_KEY_SIZE]> {
    let mut bytes = Zeroizing::new([0u8; DATA_KEY_SIZE]);
    OsRng.fill_bytes(&mut bytes[..]);
    bytes
}

/// Wrap `data_key` under `primary` with AES-256-GCM, binding `aad`
pub(crate) fn wrap_data_key(
    primary: &PrimaryKey,
    data_key: &DataKey,
    aad: &[u8],
) -> Result<WrappedDataKey> {
    let cipher = Aes256Gcm::new_from_slice(primary.as_bytes())
        .map_err(|e| EncryptionError::key_generation(format!("wrapping cipher init: {e}")))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: data_key.as_bytes(),
                aad,
            },
        )
        .map_err(|_| EncryptionError::key_generation("data key wrap failed"))?;

    let mut bytes = Vec::with_capacity(WRAPPED_DATA_KEY_SIZE);
    bytes.push(WRAP_FORMAT_VERSION);
    bytes.extend_from_slice(&nonce);
    bytes.extend_from_slice(&sealed);
    Ok(WrappedDataKey::from_bytes(bytes))
}

/// Inverse of [`wrap_data_key`]
pub(crate) fn unwrap_data_key_with(
    primary: &PrimaryKey,
    wrapped: &WrappedDataKey,
    aad: &[u8],
) -> Result<DataKey> {
    let bytes = wrapped.as_bytes();
    if bytes.len() != WRAPPED_DATA_KEY_SIZE {
        return Err(EncryptionError::unwrap_failed(format!(
            "wrapped data key must be {WRAPPED_DATA_KEY_SIZE} bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[0] != WRAP_FORMAT_VERSION {
        return Err(EncryptionError::unwrap_failed(format!(
            "unsupported wrapped key version {}",
            bytes[0]
        )));
    }

    let nonce = Nonce::from_slice(&bytes[1..1 + GCM_NONCE_LEN]);
    let cipher = Aes256Gcm::new_from_slice(primary.as_bytes())
        .map_err(|e| EncryptionError::unwrap_failed(format!("wrapping cipher init: {e}")))?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &bytes[1 + GCM_NONCE_LEN..],
                    aad,
                },
            )
            .map_err(|_| {
                EncryptionError::unwrap_failed("primary key does not match wrapped data key")
            })?,
    );
    DataKey::from_slice(&plaintext)
}

/// Write key material with owner-only permissions. Without `replace` an
/// existing file is an error and is left untouched.
pub(crate) fn write_key_file(path: &Path, bytes: &[u8], replace: bool) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut options = fs::OpenOptions::new();
    options.write(true);
    if replace {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::AlreadyExists => EncryptionError::KeyFileExists {
            path: path.to_path_buf(),
        },
        _ => err.into(),
    })?;
    // `mode` only applies on creation; tighten a replaced file too
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if replace {
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
    }
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Generate a primary key and a wrapped data key and persist both blobs.
///
/// Fails with [`EncryptionError::KeyFileExists`] before contacting the KMS
/// when either file is already present.
#[instrument(skip(kms, primary_key_path, data_key_path), fields(kms = %kms.kind()))]
pub fn init_key_files(
    kms: &dyn KeyManagementService,
    app_id: &str,
    primary_key_path: impl AsRef<Path>,
    data_key_path: impl AsRef<Path>,
) -> Result<()> {
    write_key_files(
        kms,
        app_id,
        primary_key_path.as_ref(),
        data_key_path.as_ref(),
        false,
    )
}

/// Like [`init_key_files`], but replaces existing key files. Objects sealed
/// under the previous data key can no longer be decrypted afterwards.
#[instrument(skip(kms, primary_key_path, data_key_path), fields(kms = %kms.kind()))]
pub fn replace_key_files(
    kms: &dyn KeyManagementService,
    app_id: &str,
    primary_key_path: impl AsRef<Path>,
    data_key_path: impl AsRef<Path>,
) -> Result<()> {
    let (primary_key_path, data_key_path) = (primary_key_path.as_ref(), data_key_path.as_ref());
    if primary_key_path.exists() || data_key_path.exists() {
        warn!("replacing existing key files");
    }
    write_key_files(kms, app_id, primary_key_path, data_key_path, true)
}

fn write_key_files(
    kms: &dyn KeyManagementService,
    app_id: &str,
    primary_key_path: &Path,
    data_key_path: &Path,
    replace: bool,
) -> Result<()> {
    if !replace {
        if let Some(existing) = [primary_key_path, data_key_path].into_iter().find(|p| p.exists()) {
            return Err(EncryptionError::KeyFileExists {
                path: existing.to_path_buf(),
            });
        }
    }

    let handle = kms.generate_primary_key(app_id)?;
    let wrapped = kms.generate_and_wrap_data_key(&handle)?;

    write_key_file(primary_key_path, handle.as_bytes(), replace)?;
    write_key_file(data_key_path, wrapped.as_bytes(), replace)?;

    info!(
        primary_key_path = %primary_key_path.display(),
        data_key_path = %data_key_path.display(),
        "key files initialised"
    );
    Ok(())
}

/// Read the persisted blobs and unwrap the data key.
#[instrument(skip(kms, primary_key_path, data_key_path), fields(kms = %kms.kind()))]
pub fn load_data_key(
    kms: &dyn KeyManagementService,
    primary_key_path: impl AsRef<Path>,
    data_key_path: impl AsRef<Path>,
) -> Result<DataKey> {
    let handle = PrimaryKeyHandle::from_bytes(fs::read(primary_key_path.as_ref())?);
    let wrapped = WrappedDataKey::from_bytes(fs::read(data_key_path.as_ref())?);
    let key = kms.unwrap_data_key(&handle, &wrapped)?;
    debug!("data key unwrapped");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("SimpleKeyManagementService".parse::<KmsKind>().unwrap(), KmsKind::Simple);
        assert_eq!("local".parse::<KmsKind>().unwrap(), KmsKind::Local);
        assert!(matches!(
            "EHSMKeyManagementService".parse::<KmsKind>(),
            Err(EncryptionError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let primary = PrimaryKey::from_bytes([9u8; 32]);
        let dek = DataKey::from_bytes(*random_key_bytes());

        let wrapped = wrap_data_key(&primary, &dek, b"app").unwrap();
        assert_eq!(wrapped.as_bytes().len(), WRAPPED_DATA_KEY_SIZE);

        let unwrapped = unwrap_data_key_with(&primary, &wrapped, b"app").unwrap();
        assert_eq!(unwrapped, dek);
    }

    #[test]
    fn test_unwrap_rejects_wrong_primary_and_aad() {
        let primary = PrimaryKey::from_bytes([1u8; 32]);
        let other = PrimaryKey::from_bytes([2u8; 32]);
        let dek = DataKey::from_bytes([3u8; 32]);
        let wrapped = wrap_data_key(&primary, &dek, b"app").unwrap();

        assert!(matches!(
            unwrap_data_key_with(&other, &wrapped, b"app"),
            Err(EncryptionError::Unwrap(_))
        ));
        assert!(matches!(
            unwrap_data_key_with(&primary, &wrapped, b"other-app"),
            Err(EncryptionError::Unwrap(_))
        ));
    }

    #[test]
    fn test_unwrap_rejects_malformed() {
        let primary = PrimaryKey::from_bytes([1u8; 32]);
        let short = WrappedDataKey::from_bytes(vec![1u8; 10]);
        assert!(matches!(
            unwrap_data_key_with(&primary, &short, b""),
            Err(EncryptionError::Unwrap(_))
        ));

        let dek = DataKey::from_bytes([3u8; 32]);
        let mut bytes = wrap_data_key(&primary, &dek, b"").unwrap().into_bytes();
        bytes[0] = 9;
        assert!(matches!(
            unwrap_data_key_with(&primary, &WrappedDataKey::from_bytes(bytes), b""),
            Err(EncryptionError::Unwrap(_))
        ));
    }

    fn simple_kms() -> Box<dyn KeyManagementService> {
        Box::new(SimpleKeyManagementService::new("files-app", "files-secret").unwrap())
    }

    #[test]
    fn test_second_init_leaves_key_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, data) = (dir.path().join("primary"), dir.path().join("data"));
        let kms = simple_kms();

        init_key_files(kms.as_ref(), "files-app", &primary, &data).unwrap();
        let before = (fs::read(&primary).unwrap(), fs::read(&data).unwrap());
        let key = load_data_key(kms.as_ref(), &primary, &data).unwrap();

        let err = init_key_files(kms.as_ref(), "files-app", &primary, &data).unwrap_err();
        assert!(matches!(err, EncryptionError::KeyFileExists { .. }), "{err}");
        assert_eq!((fs::read(&primary).unwrap(), fs::read(&data).unwrap()), before);
        assert_eq!(load_data_key(kms.as_ref(), &primary, &data).unwrap(), key);

        // a lone data key file blocks init as well
        fs::remove_file(&primary).unwrap();
        assert!(matches!(
            init_key_files(kms.as_ref(), "files-app", &primary, &data),
            Err(EncryptionError::KeyFileExists { .. })
        ));
        assert!(!primary.exists());
    }

    #[test]
    fn test_replace_rotates_data_key() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, data) = (dir.path().join("primary"), dir.path().join("data"));
        let kms = simple_kms();

        init_key_files(kms.as_ref(), "files-app", &primary, &data).unwrap();
        let old = load_data_key(kms.as_ref(), &primary, &data).unwrap();
        replace_key_files(kms.as_ref(), "files-app", &primary, &data).unwrap();
        assert_ne!(load_data_key(kms.as_ref(), &primary, &data).unwrap(), old);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let (primary, data) = (dir.path().join("primary"), dir.path().join("data"));
        fs::write(&data, b"stale").unwrap();
        fs::set_permissions(&data, fs::Permissions::from_mode(0o644)).unwrap();

        replace_key_files(simple_kms().as_ref(), "files-app", &primary, &data).unwrap();
        for path in [&primary, &data] {
            let mode = fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", path.display());
        }
    }

    #[test]
    fn test_random_keys_differ() {
        assert_ne!(*random_key_bytes(), *random_key_bytes());
    }
}
