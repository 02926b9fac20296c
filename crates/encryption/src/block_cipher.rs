//! Per-block cipher engine
//!
//! Three sub-keys are derived from the data key with HKDF-SHA256, each
//! bound to the object's header (stream id and random salt), so no two
//! objects share a content key and the key is never used for more than one
//! purpose:
//!
//! - `enc`: AES-256 key for GCM or CBC
//! - `iv`:  HMAC-SHA256 key for deterministic IV derivation from the block index
//! - `mac`: HMAC-SHA256 key for CBC encrypt-then-MAC tags
//!
//! Both modes authenticate `index || final_flag` so records cannot be
//! reordered between positions, moved between objects, or truncated at a
//! record boundary without detection.

use aes::Aes256;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Nonce};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{EncryptionError, Result};
use crate::frame::{EncryptedBlock, ObjectHeader};
use crate::keys::DataKey;
use crate::mode::{CryptoMode, AES_BLOCK_LEN};

type HmacSha256 = Hmac<Sha256>;

const SUBKEY_SALT: &[u8] = b"SEAL-BLOCK-CIPHER-V1";
const ENC_INFO: &[u8] = b"enc";
const IV_INFO: &[u8] = b"iv";
const MAC_INFO: &[u8] = b"mac";
const SUBKEY_LEN: usize = 32;

fn derive_subkey(
    hk: &Hkdf<Sha256>,
    label: &[u8],
    header: &ObjectHeader,
) -> Result<Zeroizing<[u8; SUBKEY_LEN]>> {
    let mut out = Zeroizing::new([0u8; SUBKEY_LEN]);
    hk.expand_multi_info(&[label, &header.encode()[..]], &mut out[..])
        .map_err(|e| EncryptionError::key_generation(format!("sub-key derivation: {e}")))?;
    Ok(out)
}

enum Engine {
    Gcm(Box<Aes256Gcm>),
    Cbc {
        aes: Box<Aes256>,
        mac_key: Zeroizing<[u8; SUBKEY_LEN]>,
    },
}

/// Keyed block cipher for one encrypted mode
pub struct BlockCipher {
    mode: CryptoMode,
    engine: Engine,
    iv_key: Zeroizing<[u8; SUBKEY_LEN]>,
}

impl BlockCipher {
    /// Key a cipher for one object in `mode`. `PlainText` has no cipher.
    pub fn new(mode: CryptoMode, data_key: &DataKey, header: &ObjectHeader) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(SUBKEY_SALT), data_key.as_bytes());
        let enc_key = derive_subkey(&hk, ENC_INFO, header)?;
        let iv_key = derive_subkey(&hk, IV_INFO, header)?;

        let engine = match mode {
            CryptoMode::PlainText => {
                return Err(EncryptionError::InvalidConfiguration(
                    "plain_text records are not enciphered".into(),
                ))
            }
            CryptoMode::AesGcmCtrV1 => Engine::Gcm(Box::new(
                Aes256Gcm::new_from_slice(&enc_key[..])
                    .map_err(|e| EncryptionError::key_generation(format!("gcm init: {e}")))?,
            )),
            CryptoMode::AesCbcPkcs5Padding => Engine::Cbc {
                aes: Box::new(
                    Aes256::new_from_slice(&enc_key[..])
                        .map_err(|e| EncryptionError::key_generation(format!("aes init: {e}")))?,
                ),
                mac_key: derive_subkey(&hk, MAC_INFO, header)?,
            },
        };

        Ok(Self {
            mode,
            engine,
            iv_key,
        })
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    /// IV for `index`: HMAC-SHA256(iv_key, index) truncated to the mode's IV
    /// length. `iv_key` is per object, so equal indices in different objects
    /// still get different IVs.
    ///
    /// Used for every GCM record and for the first record of a CBC chain.
    pub fn derive_iv(&self, index: u64) -> Result<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.iv_key[..])
            .map_err(|e| EncryptionError::key_generation(format!("iv derivation: {e}")))?;
        mac.update(&index.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        Ok(digest[..self.mode.iv_len()].to_vec())
    }

    /// Encrypt one block of plaintext into a record
    pub fn seal(
        &self,
        index: u64,
        is_final: bool,
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<EncryptedBlock> {
        if iv.len() != self.mode.iv_len() {
            return Err(EncryptionError::InvalidConfiguration(format!(
                "{} needs a {}-byte iv, got {}",
                self.mode,
                self.mode.iv_len(),
                iv.len()
            )));
        }
        let aad = associated_data(index, is_final);

        match &self.engine {
            Engine::Gcm(gcm) => {
                let mut buf = plaintext.to_vec();
                let tag = gcm
                    .encrypt_in_place_detached(Nonce::from_slice(iv), &aad, &mut buf)
                    .map_err(|_| EncryptionError::Integrity { block_index: index })?;
                Ok(EncryptedBlock {
                    index,
                    iv: iv.to_vec(),
                    ciphertext: buf,
                    tag: tag.to_vec(),
                })
            }
            Engine::Cbc { aes, mac_key } => {
                let ciphertext = cbc_encrypt(aes, iv, plaintext);
                let tag = cbc_tag(mac_key, &aad, iv, &ciphertext)?.finalize().into_bytes();
                Ok(EncryptedBlock {
                    index,
                    iv: iv.to_vec(),
                    ciphertext,
                    tag: tag.to_vec(),
                })
            }
        }
    }

    /// Verify and decrypt one record. Any authentication failure is
    /// [`EncryptionError::Integrity`]; no plaintext is released for it.
    pub fn open(&self, block: &EncryptedBlock, is_final: bool) -> Result<Vec<u8>> {
        let integrity = || EncryptionError::Integrity {
            block_index: block.index,
        };
        if block.iv.len() != self.mode.iv_len() || block.tag.len() != self.mode.tag_len() {
            return Err(integrity());
        }
        let aad = associated_data(block.index, is_final);

        match &self.engine {
            Engine::Gcm(gcm) => {
                let mut buf = block.ciphertext.clone();
                gcm.decrypt_in_place_detached(
                    Nonce::from_slice(&block.iv),
                    &aad,
                    &mut buf,
                    GenericArray::from_slice(&block.tag),
                )
                .map_err(|_| integrity())?;
                Ok(buf)
            }
            Engine::Cbc { aes, mac_key } => {
                cbc_tag(mac_key, &aad, &block.iv, &block.ciphertext)?
                    .verify_slice(&block.tag)
                    .map_err(|_| integrity())?;
                cbc_decrypt(aes, &block.iv, &block.ciphertext).ok_or_else(integrity)
            }
        }
    }

    /// Does `iv` match the IV the encryptor must have used for `index`
    pub fn iv_matches(&self, index: u64, iv: &[u8]) -> Result<bool> {
        let expected = self.derive_iv(index)?;
        Ok(bool::from(expected.as_slice().ct_eq(iv)))
    }
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher")
            .field("mode", &self.mode)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

/// Chaining value for the CBC record after `block`
pub fn next_chain_iv(block: &EncryptedBlock) -> Option<&[u8]> {
    let len = block.ciphertext.len();
    (len >= AES_BLOCK_LEN).then(|| &block.ciphertext[len - AES_BLOCK_LEN..])
}

fn associated_data(index: u64, is_final: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = u8::from(is_final);
    aad
}

fn cbc_tag(mac_key: &[u8; SUBKEY_LEN], aad: &[u8], iv: &[u8], ct: &[u8]) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| EncryptionError::key_generation(format!("mac init: {e}")))?;
    mac.update(aad);
    mac.update(iv);
    mac.update(ct);
    Ok(mac)
}

fn cbc_encrypt(aes: &Aes256, iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let pad = AES_BLOCK_LEN - plaintext.len() % AES_BLOCK_LEN;
    let mut buf = Vec::with_capacity(plaintext.len() + pad);
    buf.extend_from_slice(plaintext);
    buf.resize(plaintext.len() + pad, pad as u8);

    let mut prev = [0u8; AES_BLOCK_LEN];
    prev.copy_from_slice(iv);
    for chunk in buf.chunks_exact_mut(AES_BLOCK_LEN) {
        chunk.iter_mut().zip(prev.iter()).for_each(|(b, p)| *b ^= p);
        aes.encrypt_block(GenericArray::from_mut_slice(chunk));
        prev.copy_from_slice(chunk);
    }
    buf
}

/// `None` on a malformed length or bad padding
fn cbc_decrypt(aes: &Aes256, iv: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_LEN != 0 {
        return None;
    }

    let mut out = ciphertext.to_vec();
    let mut prev = [0u8; AES_BLOCK_LEN];
    prev.copy_from_slice(iv);
    for chunk in out.chunks_exact_mut(AES_BLOCK_LEN) {
        let mut saved = [0u8; AES_BLOCK_LEN];
        saved.copy_from_slice(chunk);
        aes.decrypt_block(GenericArray::from_mut_slice(chunk));
        chunk.iter_mut().zip(prev.iter()).for_each(|(b, p)| *b ^= p);
        prev = saved;
    }

    let pad = *out.last()? as usize;
    if pad == 0 || pad > AES_BLOCK_LEN || out[out.len() - pad..].iter().any(|&b| b as usize != pad) {
        return None;
    }
    out.truncate(out.len() - pad);
    Some(out)
}
