//! Key material
//!
//! Two-tier hierarchy: a primary key (held by the KMS) wraps a data key
//! (used for content). Callers only ever see:
//!
//! - [`PrimaryKeyHandle`]: opaque, KMS-specific reference to a primary key,
//!   safe to persist
//! - [`WrappedDataKey`]: data key encrypted under the primary key, safe to persist
//! - [`DataKey`]: the plaintext data key, memory only, zeroized on drop

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{EncryptionError, Result};

/// AES-256 key length (256 bits)
pub const DATA_KEY_SIZE: usize = 32;

/// Primary key length (256 bits)
pub const PRIMARY_KEY_SIZE: usize = 32;

/// Plaintext data key
///
/// Deliberately neither `Serialize` nor `Clone`: share it through `Arc`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; DATA_KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; DATA_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DATA_KEY_SIZE {
            return Err(EncryptionError::InvalidKeyLength {
                expected: DATA_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; DATA_KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    pub fn as_bytes(&self) -> &[u8; DATA_KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey").field("bytes", &"[REDACTED]").finish()
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        bool::from(self.bytes.ct_eq(&other.bytes))
    }
}

impl Eq for DataKey {}

/// Data key encrypted under a primary key. Layout is KMS-specific.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedDataKey {
    bytes: Vec<u8>,
}

impl WrappedDataKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for WrappedDataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedDataKey")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Reference to a primary key inside a KMS. Never contains the key itself
/// in plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct PrimaryKeyHandle {
    bytes: Vec<u8>,
}

impl PrimaryKeyHandle {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for PrimaryKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryKeyHandle")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Primary key material, only ever materialized inside a KMS implementation
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct PrimaryKey {
    bytes: [u8; PRIMARY_KEY_SIZE],
}

impl PrimaryKey {
    pub(crate) fn from_bytes(bytes: [u8; PRIMARY_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; PRIMARY_KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_key_debug_redacted() {
        let key = DataKey::from_bytes([42u8; DATA_KEY_SIZE]);
        let debug_str = format!("{:?}", key);

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("42"));
    }

    #[test]
    fn test_data_key_from_slice_length() {
        assert!(DataKey::from_slice(&[1u8; DATA_KEY_SIZE]).is_ok());
        let err = DataKey::from_slice(&[1u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            EncryptionError::InvalidKeyLength {
                expected: 32,
                actual: 16
            }
        ));
    }

    #[test]
    fn test_data_key_equality() {
        let a = DataKey::from_bytes([7u8; DATA_KEY_SIZE]);
        let b = DataKey::from_bytes([7u8; DATA_KEY_SIZE]);
        let c = DataKey::from_bytes([8u8; DATA_KEY_SIZE]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_opaque_blobs_round_trip() {
        let wrapped = WrappedDataKey::from_bytes(vec![1, 2, 3]);
        assert_eq!(wrapped.as_bytes(), &[1, 2, 3]);
        assert_eq!(format!("{:?}", wrapped), "WrappedDataKey { len: 3 }");

        let handle = PrimaryKeyHandle::from_bytes(b"handle".to_vec());
        assert_eq!(handle.clone().into_bytes(), b"handle".to_vec());
    }
}
