//! Simple KMS
//!
//! The primary key is never stored: it is re-derived on demand from the
//! application id and secret with HKDF-SHA256. The persisted handle only
//! carries the application id and a key check value, so a handle created
//! under other credentials is rejected before any unwrap is attempted.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use super::{random_key_bytes, unwrap_data_key_with, wrap_data_key, KeyManagementService, KmsKind};
use crate::error::{EncryptionError, Result};
use crate::keys::{DataKey, PrimaryKey, PrimaryKeyHandle, WrappedDataKey, PRIMARY_KEY_SIZE};

const PRIMARY_KEY_DOMAIN: &[u8] = b"SEAL-SIMPLE-KMS-PRIMARY-V1";
const KEY_CHECK_CONTEXT: &[u8] = b"SEAL-SIMPLE-KMS-KEY-CHECK-V1";
const HANDLE_VERSION: u16 = 1;
const KEY_CHECK_LEN: usize = 8;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct SimpleHandle {
    version: u16,
    kms: KmsKind,
    app_id: String,
    key_check: String,
}

/// KMS backed by an (application id, secret) pair
pub struct SimpleKeyManagementService {
    app_id: String,
    app_secret: Zeroizing<String>,
}

impl SimpleKeyManagementService {
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Result<Self> {
        let app_id = app_id.into();
        let app_secret = Zeroizing::new(app_secret.into());
        if app_id.is_empty() {
            return Err(EncryptionError::InvalidConfiguration(
                "simple KMS requires a non-empty application id".into(),
            ));
        }
        if app_secret.is_empty() {
            return Err(EncryptionError::InvalidConfiguration(
                "simple KMS requires a non-empty application secret".into(),
            ));
        }
        Ok(Self { app_id, app_secret })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// HKDF(ikm = secret, salt = domain || app id, info = domain)
    fn derive_primary_key(&self) -> std::result::Result<PrimaryKey, String> {
        let mut salt = Vec::with_capacity(PRIMARY_KEY_DOMAIN.len() + self.app_id.len());
        salt.extend_from_slice(PRIMARY_KEY_DOMAIN);
        salt.extend_from_slice(self.app_id.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&salt), self.app_secret.as_bytes());
        let mut okm = Zeroizing::new([0u8; PRIMARY_KEY_SIZE]);
        hk.expand(PRIMARY_KEY_DOMAIN, &mut okm[..])
            .map_err(|e| format!("primary key derivation failed: {e}"))?;
        Ok(PrimaryKey::from_bytes(*okm))
    }

    fn key_check(primary: &PrimaryKey) -> std::result::Result<String, String> {
        let mut mac = HmacSha256::new_from_slice(primary.as_bytes())
            .map_err(|e| format!("key check init failed: {e}"))?;
        mac.update(KEY_CHECK_CONTEXT);
        let digest = mac.finalize().into_bytes();
        Ok(hex::encode(&digest[..KEY_CHECK_LEN]))
    }

    /// Parse the handle and re-derive the matching primary key
    fn resolve(&self, handle: &PrimaryKeyHandle) -> std::result::Result<PrimaryKey, String> {
        let parsed: SimpleHandle = serde_json::from_slice(handle.as_bytes())
            .map_err(|e| format!("malformed primary key handle: {e}"))?;
        if parsed.version != HANDLE_VERSION {
            return Err(format!("unsupported handle version {}", parsed.version));
        }
        if parsed.kms != KmsKind::Simple {
            return Err(format!("handle was issued by {}", parsed.kms));
        }
        if parsed.app_id != self.app_id {
            return Err("handle belongs to a different application id".into());
        }

        let primary = self.derive_primary_key()?;
        let expected = Self::key_check(&primary)?;
        if !bool::from(expected.as_bytes().ct_eq(parsed.key_check.as_bytes())) {
            return Err("application secret does not match primary key handle".into());
        }
        Ok(primary)
    }
}

impl KeyManagementService for SimpleKeyManagementService {
    fn kind(&self) -> KmsKind {
        KmsKind::Simple
    }

    #[instrument(skip(self))]
    fn generate_primary_key(&self, app_id: &str) -> Result<PrimaryKeyHandle> {
        if app_id != self.app_id {
            return Err(EncryptionError::key_generation(
                "application id does not match configured credentials",
            ));
        }
        let primary = self
            .derive_primary_key()
            .map_err(EncryptionError::KeyGeneration)?;
        let handle = SimpleHandle {
            version: HANDLE_VERSION,
            kms: KmsKind::Simple,
            app_id: self.app_id.clone(),
            key_check: Self::key_check(&primary).map_err(EncryptionError::KeyGeneration)?,
        };
        debug!("primary key derived");
        Ok(PrimaryKeyHandle::from_bytes(serde_json::to_vec(&handle)?))
    }

    #[instrument(skip_all)]
    fn generate_and_wrap_data_key(&self, primary: &PrimaryKeyHandle) -> Result<WrappedDataKey> {
        let primary = self.resolve(primary).map_err(EncryptionError::KeyGeneration)?;
        let data_key = DataKey::from_bytes(*random_key_bytes());
        wrap_data_key(&primary, &data_key, self.app_id.as_bytes())
    }

    #[instrument(skip_all)]
    fn unwrap_data_key(
        &self,
        primary: &PrimaryKeyHandle,
        wrapped: &WrappedDataKey,
    ) -> Result<DataKey> {
        let primary = self.resolve(primary).map_err(EncryptionError::Unwrap)?;
        unwrap_data_key_with(&primary, wrapped, self.app_id.as_bytes())
    }
}

impl std::fmt::Debug for SimpleKeyManagementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleKeyManagementService")
            .field("app_id", &self.app_id)
            .field("app_secret", &"[REDACTED]")
            .finish()
    }
}
