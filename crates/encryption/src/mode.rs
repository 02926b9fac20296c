//! Cipher mode registry
//!
//! Enumerates the supported encryption schemes and the properties the
//! decryptor and the partition planner need: splittability, framing block
//! size, IV/tag lengths and the on-disk record stride.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EncryptionError, Result};
use crate::frame::OBJECT_HEADER_LEN;

/// Plaintext bytes per framed block for the authenticated modes.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// AES block length (CBC chaining value, PKCS#7 unit)
pub const AES_BLOCK_LEN: usize = 16;

/// AES-GCM nonce length
pub const GCM_NONCE_LEN: usize = 12;

/// AES-GCM tag length
pub const GCM_TAG_LEN: usize = 16;

/// HMAC-SHA256 tag length (CBC encrypt-then-MAC)
pub const HMAC_TAG_LEN: usize = 32;

/// Fixed bytes of a record besides IV, ciphertext and tag:
/// index (8) + iv length (2) + payload length (4) + tag length (2)
pub const RECORD_OVERHEAD: usize = 8 + 2 + 4 + 2;

/// At which granularity an object may be divided between partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitGranularity {
    /// Any byte offset (no framing)
    Byte,
    /// Record boundaries of `stride` framed bytes
    Block { stride: u64 },
    /// Only the whole object
    WholeObject,
}

/// Encryption scheme selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CryptoMode {
    /// No encryption; raw bytes, trivially splittable
    #[default]
    #[serde(rename = "plain_text")]
    PlainText,

    /// AES-256-CBC with PKCS#7 padding and HMAC-SHA256 per block.
    ///
    /// Each block's IV is the previous block's last cipher block, so blocks
    /// can only be decrypted in order from the start of the object.
    #[serde(rename = "AES/CBC/PKCS5Padding")]
    AesCbcPkcs5Padding,

    /// AES-256-GCM per block with IVs derived from the block index.
    ///
    /// Every block decrypts independently given the data key and its index.
    #[serde(rename = "AES_GCM_CTR_V1")]
    AesGcmCtrV1,
}

impl CryptoMode {
    pub const ALL: [CryptoMode; 3] = [
        CryptoMode::PlainText,
        CryptoMode::AesCbcPkcs5Padding,
        CryptoMode::AesGcmCtrV1,
    ];

    /// Canonical identifier
    pub fn identifier(&self) -> &'static str {
        match self {
            CryptoMode::PlainText => "plain_text",
            CryptoMode::AesCbcPkcs5Padding => "AES/CBC/PKCS5Padding",
            CryptoMode::AesGcmCtrV1 => "AES_GCM_CTR_V1",
        }
    }

    /// Look up a mode by identifier (case-insensitive, short aliases accepted)
    pub fn from_identifier(identifier: &str) -> Result<Self> {
        let normalized = identifier.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "plain_text" | "plaintext" | "plain" | "none" => Ok(CryptoMode::PlainText),
            "aes/cbc/pkcs5padding" | "aes_cbc_pkcs5padding" | "aes-cbc" | "cbc" => {
                Ok(CryptoMode::AesCbcPkcs5Padding)
            }
            "aes_gcm_ctr_v1" | "aes-gcm-ctr" | "gcm-ctr" | "gcm" => Ok(CryptoMode::AesGcmCtrV1),
            _ => Err(EncryptionError::UnsupportedMode(identifier.to_string())),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, CryptoMode::PlainText)
    }

    /// Authenticated modes carry an integrity tag per block
    pub fn is_authenticated(&self) -> bool {
        self.is_encrypted()
    }

    /// Can an interior byte range be decrypted without the preceding bytes
    pub fn is_splittable(&self) -> bool {
        match self {
            CryptoMode::PlainText => true,
            CryptoMode::AesCbcPkcs5Padding => false,
            CryptoMode::AesGcmCtrV1 => true,
        }
    }

    /// Plaintext bytes per framing unit
    pub fn block_size(&self) -> usize {
        match self {
            CryptoMode::PlainText => 1,
            CryptoMode::AesCbcPkcs5Padding | CryptoMode::AesGcmCtrV1 => DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CryptoMode::PlainText => 0,
            CryptoMode::AesCbcPkcs5Padding => AES_BLOCK_LEN,
            CryptoMode::AesGcmCtrV1 => GCM_NONCE_LEN,
        }
    }

    pub fn tag_len(&self) -> usize {
        match self {
            CryptoMode::PlainText => 0,
            CryptoMode::AesCbcPkcs5Padding => HMAC_TAG_LEN,
            CryptoMode::AesGcmCtrV1 => GCM_TAG_LEN,
        }
    }

    /// Ciphertext length produced for `plaintext_len` bytes in one block
    pub fn ciphertext_len(&self, plaintext_len: usize) -> usize {
        match self {
            CryptoMode::PlainText | CryptoMode::AesGcmCtrV1 => plaintext_len,
            // PKCS#7 always adds between 1 and 16 bytes
            CryptoMode::AesCbcPkcs5Padding => (plaintext_len / AES_BLOCK_LEN + 1) * AES_BLOCK_LEN,
        }
    }

    /// Framed length of a full (non-final) record. Zero for `PlainText`.
    pub fn record_stride(&self) -> u64 {
        if !self.is_encrypted() {
            return 0;
        }
        (RECORD_OVERHEAD + self.iv_len() + self.ciphertext_len(self.block_size()) + self.tag_len())
            as u64
    }

    /// Bytes ahead of the first record. Zero for `PlainText`.
    pub fn header_len(&self) -> u64 {
        if self.is_encrypted() {
            OBJECT_HEADER_LEN as u64
        } else {
            0
        }
    }

    pub fn split_granularity(&self) -> SplitGranularity {
        match self {
            CryptoMode::PlainText => SplitGranularity::Byte,
            CryptoMode::AesCbcPkcs5Padding => SplitGranularity::WholeObject,
            CryptoMode::AesGcmCtrV1 => SplitGranularity::Block {
                stride: self.record_stride(),
            },
        }
    }
}

impl fmt::Display for CryptoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl FromStr for CryptoMode {
    type Err = EncryptionError;

    fn from_str(s: &str) -> Result<Self> {
        CryptoMode::from_identifier(s)
    }
}

/// Resolve a mode identifier
pub fn mode_for(identifier: &str) -> Result<CryptoMode> {
    CryptoMode::from_identifier(identifier)
}

pub fn is_splittable(mode: CryptoMode) -> bool {
    mode.is_splittable()
}

pub fn block_size(mode: CryptoMode) -> usize {
    mode.block_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_round_trip() {
        for mode in CryptoMode::ALL {
            assert_eq!(mode_for(mode.identifier()).unwrap(), mode);
            assert_eq!(mode.to_string().parse::<CryptoMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_aliases_case_insensitive() {
        assert_eq!(mode_for("aes/cbc/pkcs5padding").unwrap(), CryptoMode::AesCbcPkcs5Padding);
        assert_eq!(mode_for(" GCM ").unwrap(), CryptoMode::AesGcmCtrV1);
        assert_eq!(mode_for("PLAIN").unwrap(), CryptoMode::PlainText);
    }

    #[test]
    fn test_unknown_identifier() {
        let err = mode_for("AES/XTS").unwrap_err();
        assert!(matches!(err, EncryptionError::UnsupportedMode(ref id) if id == "AES/XTS"));
    }

    #[test]
    fn test_splittability_policy() {
        assert!(is_splittable(CryptoMode::PlainText));
        assert!(!is_splittable(CryptoMode::AesCbcPkcs5Padding));
        assert!(is_splittable(CryptoMode::AesGcmCtrV1));

        assert_eq!(CryptoMode::PlainText.split_granularity(), SplitGranularity::Byte);
        assert_eq!(
            CryptoMode::AesCbcPkcs5Padding.split_granularity(),
            SplitGranularity::WholeObject
        );
        assert!(matches!(
            CryptoMode::AesGcmCtrV1.split_granularity(),
            SplitGranularity::Block { .. }
        ));
    }

    #[test]
    fn test_block_sizes_and_strides() {
        assert_eq!(block_size(CryptoMode::PlainText), 1);
        assert_eq!(block_size(CryptoMode::AesGcmCtrV1), DEFAULT_BLOCK_SIZE);

        assert_eq!(CryptoMode::PlainText.record_stride(), 0);
        assert_eq!(
            CryptoMode::AesGcmCtrV1.record_stride(),
            (16 + 12 + DEFAULT_BLOCK_SIZE + 16) as u64
        );
        assert_eq!(
            CryptoMode::AesCbcPkcs5Padding.record_stride(),
            (16 + 16 + DEFAULT_BLOCK_SIZE + 16 + 32) as u64
        );
    }

    #[test]
    fn test_cbc_padding_length() {
        let mode = CryptoMode::AesCbcPkcs5Padding;
        assert_eq!(mode.ciphertext_len(0), 16);
        assert_eq!(mode.ciphertext_len(15), 16);
        assert_eq!(mode.ciphertext_len(16), 32);
    }

    #[test]
    fn test_serde_uses_identifiers() {
        let json = serde_json::to_string(&CryptoMode::AesGcmCtrV1).unwrap();
        assert_eq!(json, "\"AES_GCM_CTR_V1\"");
        let mode: CryptoMode = serde_json::from_str("\"AES/CBC/PKCS5Padding\"").unwrap();
        assert_eq!(mode, CryptoMode::AesCbcPkcs5Padding);
    }

    #[test]
    fn test_default_is_plain() {
        assert_eq!(CryptoMode::default(), CryptoMode::PlainText);
        assert!(!CryptoMode::default().is_encrypted());
    }
}
