//! Encrypted object framing
//!
//! An encrypted object is a fixed header followed by self-describing records:
//!
//! ```text
//! header: ┌──────────┬─────────────┬───────────────┬──────────┐
//!         │ "SEAL" 4 │ version u16 │ stream_id u32 │ salt 16  │
//!         └──────────┴─────────────┴───────────────┴──────────┘
//! record: ┌────────────┬────────────┬──────┬────────────────┬────────────┬────────────┬─────┐
//!         │ index u64  │ iv_len u16 │  iv  │ payload_len u32│ ciphertext │ tag_len u16│ tag │
//!         └────────────┴────────────┴──────┴────────────────┴────────────┴────────────┴─────┘
//! ```
//!
//! All integers are big-endian. The header's random salt is drawn once per
//! object and feeds the per-object sub-key derivation, so two objects under
//! one data key never share a (key, nonce) pair even when their indices
//! match. The 64-bit index packs the object's stream id (high 32 bits) with
//! the record ordinal (low 32 bits). Every record except the last one holds
//! exactly one full block, which puts record `k` at byte offset
//! `OBJECT_HEADER_LEN + k * stride`.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{EncryptionError, Result};
use crate::mode::RECORD_OVERHEAD;

/// Leading bytes of every encrypted object
pub const OBJECT_MAGIC: [u8; 4] = *b"SEAL";

/// Object layout version written by this crate
pub const FRAME_FORMAT_VERSION: u16 = 1;

/// Random per-object salt length
pub const SALT_LEN: usize = 16;

/// magic (4) + version (2) + stream id (4) + salt
pub const OBJECT_HEADER_LEN: usize = 4 + 2 + 4 + SALT_LEN;

/// Per-object parameters written ahead of the first record.
///
/// A retried write must reuse the same header to reproduce its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub stream_id: u32,
    pub salt: [u8; SALT_LEN],
}

impl ObjectHeader {
    pub fn new(stream_id: u32, salt: [u8; SALT_LEN]) -> Self {
        Self { stream_id, salt }
    }

    /// Header with a fresh salt from the OS RNG
    pub fn random(stream_id: u32) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self { stream_id, salt }
    }

    pub fn encode(&self) -> [u8; OBJECT_HEADER_LEN] {
        let mut out = [0u8; OBJECT_HEADER_LEN];
        out[..4].copy_from_slice(&OBJECT_MAGIC);
        out[4..6].copy_from_slice(&FRAME_FORMAT_VERSION.to_be_bytes());
        out[6..10].copy_from_slice(&self.stream_id.to_be_bytes());
        out[10..].copy_from_slice(&self.salt);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor {
            buf,
            pos: 0,
            offset: 0,
        };
        let magic: [u8; 4] = cursor.array("object magic")?;
        if magic != OBJECT_MAGIC {
            return Err(EncryptionError::framing(0, "not an encrypted object"));
        }
        let version = u16::from_be_bytes(cursor.array("format version")?);
        if version != FRAME_FORMAT_VERSION {
            return Err(EncryptionError::framing(
                4,
                format!("unsupported format version {version}"),
            ));
        }
        let stream_id = u32::from_be_bytes(cursor.array("stream id")?);
        let salt = cursor.array("salt")?;
        Ok(Self { stream_id, salt })
    }
}

/// Pack a stream id and record ordinal into a block index
pub fn block_index(stream_id: u32, ordinal: u32) -> u64 {
    (u64::from(stream_id) << 32) | u64::from(ordinal)
}

/// Inverse of [`block_index`]
pub fn split_block_index(index: u64) -> (u32, u32) {
    ((index >> 32) as u32, index as u32)
}

/// One framed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlock {
    pub index: u64,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

impl EncryptedBlock {
    pub fn stream_id(&self) -> u32 {
        split_block_index(self.index).0
    }

    pub fn ordinal(&self) -> u32 {
        split_block_index(self.index).1
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.iv.len() + self.ciphertext.len() + self.tag.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let iv_len = u16::try_from(self.iv.len())
            .map_err(|_| EncryptionError::framing(0, "iv longer than 65535 bytes"))?;
        let payload_len = u32::try_from(self.ciphertext.len())
            .map_err(|_| EncryptionError::framing(0, "payload longer than 4 GiB"))?;
        let tag_len = u16::try_from(self.tag.len())
            .map_err(|_| EncryptionError::framing(0, "tag longer than 65535 bytes"))?;

        out.reserve(self.encoded_len());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&iv_len.to_be_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&tag_len.to_be_bytes());
        out.extend_from_slice(&self.tag);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Parse one record from the front of `buf`.
    ///
    /// `offset` is the object offset of `buf[0]`, used only for error
    /// reporting. Returns the record and the number of bytes consumed.
    pub fn decode(buf: &[u8], offset: u64) -> Result<(Self, usize)> {
        let mut cursor = Cursor { buf, pos: 0, offset };

        let index = u64::from_be_bytes(cursor.array("block index")?);
        let iv_len = u16::from_be_bytes(cursor.array("iv length")?) as usize;
        let iv = cursor.take(iv_len, "iv")?.to_vec();
        let payload_len = u32::from_be_bytes(cursor.array("payload length")?) as usize;
        let ciphertext = cursor.take(payload_len, "ciphertext")?.to_vec();
        let tag_len = u16::from_be_bytes(cursor.array("tag length")?) as usize;
        let tag = cursor.take(tag_len, "tag")?.to_vec();

        Ok((
            Self {
                index,
                iv,
                ciphertext,
                tag,
            },
            cursor.pos,
        ))
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    offset: u64,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                EncryptionError::framing(
                    self.offset + self.pos as u64,
                    format!(
                        "truncated {what}: need {len} bytes, {} left",
                        self.buf.len() - self.pos
                    ),
                )
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedBlock {
        EncryptedBlock {
            index: block_index(3, 7),
            iv: vec![1; 12],
            ciphertext: b"ciphertext bytes".to_vec(),
            tag: vec![2; 16],
        }
    }

    #[test]
    fn test_header_layout() {
        let header = ObjectHeader::new(0x0102_0304, [9; SALT_LEN]);
        let bytes = header.encode();
        assert_eq!(&bytes[..4], b"SEAL");
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(&bytes[6..10], &[1, 2, 3, 4]);
        assert_eq!(ObjectHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_foreign_bytes() {
        let mut bytes = ObjectHeader::new(1, [0; SALT_LEN]).encode();
        assert!(ObjectHeader::decode(&bytes[..OBJECT_HEADER_LEN - 1]).is_err());

        bytes[5] = 2;
        let err = ObjectHeader::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("version 2"), "{err}");

        assert!(matches!(
            ObjectHeader::decode(b"name,age\njack,18\n........."),
            Err(EncryptionError::Framing { offset: 0, .. })
        ));
    }

    #[test]
    fn test_random_headers_differ() {
        assert_ne!(ObjectHeader::random(0).salt, ObjectHeader::random(0).salt);
    }

    #[test]
    fn test_index_packing() {
        let index = block_index(0xDEAD, 0xBEEF);
        assert_eq!(index, 0x0000_DEAD_0000_BEEF);
        assert_eq!(split_block_index(index), (0xDEAD, 0xBEEF));

        let block = sample();
        assert_eq!(block.stream_id(), 3);
        assert_eq!(block.ordinal(), 7);
    }

    #[test]
    fn test_layout_is_big_endian() {
        let bytes = sample().encode().unwrap();
        assert_eq!(&bytes[..8], &[0, 0, 0, 3, 0, 0, 0, 7]);
        assert_eq!(&bytes[8..10], &[0, 12]);
        assert_eq!(&bytes[22..26], &[0, 0, 0, 16]);
        assert_eq!(bytes.len(), sample().encoded_len());
    }

    #[test]
    fn test_decode_consumes_one_record() {
        let mut stream = sample().encode().unwrap();
        let second = EncryptedBlock {
            index: block_index(3, 8),
            ..sample()
        };
        second.encode_into(&mut stream).unwrap();

        let (first, used) = EncryptedBlock::decode(&stream, 0).unwrap();
        assert_eq!(first, sample());
        let (next, _) = EncryptedBlock::decode(&stream[used..], used as u64).unwrap();
        assert_eq!(next, second);
    }

    #[test]
    fn test_truncated_record_reports_offset() {
        let bytes = sample().encode().unwrap();
        let err = EncryptedBlock::decode(&bytes[..bytes.len() - 3], 1000).unwrap_err();
        match err {
            EncryptionError::Framing { offset, reason } => {
                assert_eq!(offset, 1000 + (bytes.len() - 16) as u64);
                assert!(reason.contains("tag"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_input_is_framing_error() {
        assert!(matches!(
            EncryptedBlock::decode(&[], 0),
            Err(EncryptionError::Framing { offset: 0, .. })
        ));
    }
}
