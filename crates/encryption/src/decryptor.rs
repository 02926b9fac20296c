//! Streaming decryptor with splittable ranges
//!
//! Given an object and a byte range, yields the plaintext of every record
//! the range owns. A record belongs to the range that contains its first
//! byte, so disjoint ranges covering an object decrypt every record exactly
//! once. Records are verified before any of their plaintext is released.
//!
//! Every range reads the object header first: its salt keys the cipher and
//! its stream id is the only one a record of this object may carry.
//!
//! Splittability follows the mode:
//!
//! - `PlainText`: any byte range
//! - `AES_GCM_CTR_V1`: any byte range, rounded to record boundaries
//! - `AES/CBC/PKCS5Padding`: the range must cover the whole object

use std::io::Write;

use tracing::{debug, instrument, warn};

use crate::block_cipher::{next_chain_iv, BlockCipher};
use crate::error::{EncryptionError, Result};
use crate::frame::{EncryptedBlock, ObjectHeader, OBJECT_HEADER_LEN};
use crate::keys::DataKey;
use crate::mode::CryptoMode;
use crate::source::{ByteRange, ByteSource};

/// Read size for unframed plaintext objects
const PLAIN_CHUNK_SIZE: usize = 64 * 1024;

/// Verified plaintext of one record (or one chunk of an unframed object)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedBlock {
    /// Record ordinal; `None` for unframed plaintext
    pub record: Option<u64>,
    /// Offset of `data[0]` in the object's plaintext
    pub plaintext_offset: u64,
    pub data: Vec<u8>,
    /// True for the block that ends the object
    pub is_last: bool,
}

/// Decrypts records of one object held in `source`
pub struct StreamDecryptor<S: ByteSource> {
    source: S,
    mode: CryptoMode,
    cipher: Option<BlockCipher>,
    header: Option<ObjectHeader>,
}

impl<S: ByteSource> StreamDecryptor<S> {
    /// Reads and checks the object header for encrypted modes; an object too
    /// short to hold one, or written by something else, is a framing error.
    pub fn new(source: S, mode: CryptoMode, data_key: &DataKey) -> Result<Self> {
        if !mode.is_encrypted() {
            return Ok(Self::unencrypted(source));
        }
        if source.len() < OBJECT_HEADER_LEN as u64 {
            return Err(EncryptionError::framing(
                0,
                format!("{}-byte object cannot hold a {mode} header", source.len()),
            ));
        }
        let mut buf = [0u8; OBJECT_HEADER_LEN];
        source.read_exact_at(0, &mut buf)?;
        let header = ObjectHeader::decode(&buf)?;
        let cipher = BlockCipher::new(mode, data_key, &header)?;
        Ok(Self {
            source,
            mode,
            cipher: Some(cipher),
            header: Some(header),
        })
    }

    /// Reader for `PlainText` objects; needs no key.
    pub fn unencrypted(source: S) -> Self {
        Self {
            source,
            mode: CryptoMode::PlainText,
            cipher: None,
            header: None,
        }
    }

    /// Header of an encrypted object
    pub fn header(&self) -> Option<&ObjectHeader> {
        self.header.as_ref()
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    pub fn object_len(&self) -> u64 {
        self.source.len()
    }

    /// Number of framed records (0 for `PlainText`)
    pub fn record_count(&self) -> u64 {
        let stride = self.mode.record_stride();
        if stride == 0 {
            return 0;
        }
        self.object_len()
            .saturating_sub(self.mode.header_len())
            .div_ceil(stride)
    }

    /// Object offset of record `k`'s first byte
    pub fn record_offset(&self, k: u64) -> u64 {
        self.mode.header_len() + k * self.mode.record_stride()
    }

    /// Records owned by `range`: those whose first byte lies inside it
    pub fn owned_records(&self, range: ByteRange) -> std::ops::Range<u64> {
        let stride = self.mode.record_stride();
        if stride == 0 {
            return 0..0;
        }
        let header_len = self.mode.header_len();
        // first record starting at or after `pos`
        let first_from = |pos: u64| pos.saturating_sub(header_len).div_ceil(stride);
        let n = self.record_count();
        let first = first_from(range.start).min(n);
        let last = first_from(range.end).min(n).max(first);
        first..last
    }

    /// Iterate the verified plaintext blocks owned by `range`
    #[instrument(skip(self), fields(mode = %self.mode, object_len = self.object_len()))]
    pub fn blocks(&self, range: ByteRange) -> Result<BlockIter<'_, S>> {
        let object_len = self.object_len();

        if !self.mode.is_encrypted() {
            let end = range.end.min(object_len);
            return Ok(BlockIter {
                decryptor: self,
                state: IterState::Plain {
                    pos: range.start.min(end),
                    end,
                },
            });
        }

        if self.record_count() == 0 {
            return Err(EncryptionError::framing(
                object_len,
                format!("object ends after its header; {} needs a final record", self.mode),
            ));
        }
        if !self.mode.is_splittable() && !range.covers(object_len) {
            return Err(EncryptionError::NotSplittable {
                mode: self.mode,
                start: range.start,
                end: range.end,
                object_len,
            });
        }

        let records = self.owned_records(range);
        debug!(first = records.start, end = records.end, "records selected");
        Ok(BlockIter {
            decryptor: self,
            state: IterState::Framed {
                next: records.start,
                stop: records.end,
                chain_iv: None,
                failed: false,
            },
        })
    }

    /// Decrypt `range` into one buffer
    pub fn decrypt_range(&self, range: ByteRange) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for block in self.blocks(range)? {
            out.extend_from_slice(&block?.data);
        }
        Ok(out)
    }

    /// Decrypt the whole object
    pub fn decrypt_all(&self) -> Result<Vec<u8>> {
        self.decrypt_range(ByteRange::full(self.object_len()))
    }

    fn read_record(&self, k: u64) -> Result<(EncryptedBlock, bool)> {
        let stride = self.mode.record_stride();
        let object_len = self.object_len();
        let offset = self.record_offset(k);
        let is_final = k + 1 == self.record_count();
        let len = stride.min(object_len - offset) as usize;

        let mut buf = vec![0u8; len];
        self.source.read_exact_at(offset, &mut buf)?;
        let (block, used) = EncryptedBlock::decode(&buf, offset)?;

        if used != len {
            return Err(EncryptionError::framing(
                offset + used as u64,
                format!("record {k} is {used} bytes but occupies {len}"),
            ));
        }
        if block.iv.len() != self.mode.iv_len() || block.tag.len() != self.mode.tag_len() {
            return Err(EncryptionError::framing(
                offset,
                format!(
                    "record {k} has iv/tag lengths {}/{}, {} expects {}/{}",
                    block.iv.len(),
                    block.tag.len(),
                    self.mode,
                    self.mode.iv_len(),
                    self.mode.tag_len()
                ),
            ));
        }
        let full = self.mode.ciphertext_len(self.mode.block_size());
        if (!is_final && block.ciphertext.len() != full) || block.ciphertext.len() > full {
            return Err(EncryptionError::framing(
                offset,
                format!(
                    "record {k} carries {} ciphertext bytes, expected {full}",
                    block.ciphertext.len()
                ),
            ));
        }
        Ok((block, is_final))
    }
}

impl<S: ByteSource> std::fmt::Debug for StreamDecryptor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecryptor")
            .field("mode", &self.mode)
            .field("object_len", &self.object_len())
            .finish()
    }
}

enum IterState {
    Plain {
        pos: u64,
        end: u64,
    },
    Framed {
        next: u64,
        stop: u64,
        chain_iv: Option<Vec<u8>>,
        failed: bool,
    },
}

/// Lazily decrypts the records of one range. Fused after the first error.
pub struct BlockIter<'a, S: ByteSource> {
    decryptor: &'a StreamDecryptor<S>,
    state: IterState,
}

impl<S: ByteSource> std::fmt::Debug for BlockIter<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockIter").finish_non_exhaustive()
    }
}

impl<S: ByteSource> BlockIter<'_, S> {
    fn next_plain(&mut self) -> Option<Result<DecryptedBlock>> {
        let IterState::Plain { pos, end } = &mut self.state else {
            return None;
        };
        if *pos >= *end {
            return None;
        }
        let len = (*end - *pos).min(PLAIN_CHUNK_SIZE as u64) as usize;
        let mut data = vec![0u8; len];
        let offset = *pos;
        if let Err(e) = self.decryptor.source.read_exact_at(offset, &mut data) {
            *pos = *end;
            return Some(Err(e));
        }
        *pos += len as u64;
        Some(Ok(DecryptedBlock {
            record: None,
            plaintext_offset: offset,
            data,
            is_last: *pos == self.decryptor.object_len(),
        }))
    }

    fn next_framed(&mut self) -> Option<Result<DecryptedBlock>> {
        let decryptor = self.decryptor;
        let IterState::Framed {
            next,
            stop,
            chain_iv,
            failed,
        } = &mut self.state
        else {
            return None;
        };
        if *failed || *next >= *stop {
            return None;
        }

        let k = *next;
        let result = open_record(decryptor, k, chain_iv);
        match &result {
            Ok(_) => *next += 1,
            Err(e) => {
                *failed = true;
                if let EncryptionError::Integrity { block_index } = e {
                    warn!(record = k, block_index, "record failed verification");
                }
            }
        }
        Some(result)
    }
}

fn open_record<S: ByteSource>(
    decryptor: &StreamDecryptor<S>,
    k: u64,
    chain_iv: &mut Option<Vec<u8>>,
) -> Result<DecryptedBlock> {
    let (cipher, header) = decryptor
        .cipher
        .as_ref()
        .zip(decryptor.header.as_ref())
        .ok_or_else(|| EncryptionError::InvalidConfiguration("no cipher keyed".into()))?;
    let (block, is_final) = decryptor.read_record(k)?;
    let integrity = EncryptionError::Integrity {
        block_index: block.index,
    };

    // Records must sit at their own position in their own object.
    if u64::from(block.ordinal()) != k || block.stream_id() != header.stream_id {
        return Err(integrity);
    }

    let iv_ok = match (decryptor.mode, chain_iv.as_deref()) {
        (CryptoMode::AesCbcPkcs5Padding, Some(expected)) => expected == block.iv.as_slice(),
        _ => cipher.iv_matches(block.index, &block.iv)?,
    };
    if !iv_ok {
        return Err(integrity);
    }

    let data = cipher.open(&block, is_final)?;
    let block_size = decryptor.mode.block_size();
    if !is_final && data.len() != block_size {
        return Err(integrity);
    }
    if decryptor.mode == CryptoMode::AesCbcPkcs5Padding {
        *chain_iv = next_chain_iv(&block).map(<[u8]>::to_vec);
    }

    Ok(DecryptedBlock {
        record: Some(k),
        plaintext_offset: k * block_size as u64,
        data,
        is_last: is_final,
    })
}

impl<S: ByteSource> Iterator for BlockIter<'_, S> {
    type Item = Result<DecryptedBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            IterState::Plain { .. } => self.next_plain(),
            IterState::Framed { .. } => self.next_framed(),
        }
    }
}

/// Decrypt a whole in-memory object in one call
pub fn decrypt(mode: CryptoMode, data_key: &DataKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    StreamDecryptor::new(ciphertext, mode, data_key)?.decrypt_all()
}

/// Decrypt the records `range` owns from `source` into `writer`.
///
/// Each record is written only after it verifies; on error the writer holds
/// the plaintext of the records before the failing one. Returns the number
/// of plaintext bytes written.
pub fn decrypt_stream<S: ByteSource, W: Write>(
    source: S,
    range: ByteRange,
    data_key: &DataKey,
    mode: CryptoMode,
    mut writer: W,
) -> Result<u64> {
    let decryptor = StreamDecryptor::new(source, mode, data_key)?;
    let mut written = 0u64;
    for block in decryptor.blocks(range)? {
        let block = block?;
        writer.write_all(&block.data)?;
        written += block.data.len() as u64;
    }
    writer.flush()?;
    Ok(written)
}
