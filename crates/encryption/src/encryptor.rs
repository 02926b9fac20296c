//! Streaming encryptor
//!
//! Accepts plaintext in arbitrary pieces and emits the object header
//! followed by framed records of exactly one block each. The last block is held back until
//! [`StreamEncryptor::finish`] so it can be sealed with the final flag;
//! empty input therefore still produces one (empty) final record.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::block_cipher::{next_chain_iv, BlockCipher};
use crate::error::{EncryptionError, Result};
use crate::frame::{block_index, ObjectHeader};
use crate::keys::DataKey;
use crate::mode::CryptoMode;

/// Counters for one encrypted object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptSummary {
    pub mode: CryptoMode,
    pub plaintext_bytes: u64,
    pub ciphertext_bytes: u64,
    pub records: u64,
}

impl EncryptSummary {
    pub fn new(mode: CryptoMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Framing and padding overhead relative to the plaintext (0.0 for none)
    pub fn overhead_ratio(&self) -> f64 {
        if self.plaintext_bytes == 0 {
            return 0.0;
        }
        self.ciphertext_bytes.saturating_sub(self.plaintext_bytes) as f64
            / self.plaintext_bytes as f64
    }

    /// Fold another object's counters into this one
    pub fn merge(&mut self, other: &EncryptSummary) {
        self.plaintext_bytes += other.plaintext_bytes;
        self.ciphertext_bytes += other.ciphertext_bytes;
        self.records += other.records;
    }
}

/// Encrypts a plaintext stream into `writer`
pub struct StreamEncryptor<W: Write> {
    writer: W,
    mode: CryptoMode,
    cipher: Option<BlockCipher>,
    stream_id: u32,
    header_pending: Option<ObjectHeader>,
    next_ordinal: u32,
    pending: Vec<u8>,
    chain_iv: Option<Vec<u8>>,
    summary: EncryptSummary,
}

impl<W: Write> StreamEncryptor<W> {
    /// `header.stream_id` becomes the high half of every record index.
    /// Use [`ObjectHeader::random`] for new objects; reusing a header
    /// reproduces the same bytes for the same plaintext.
    pub fn new(
        writer: W,
        mode: CryptoMode,
        data_key: &DataKey,
        header: ObjectHeader,
    ) -> Result<Self> {
        if !mode.is_encrypted() {
            return Ok(Self::with_cipher(writer, mode, None, None));
        }
        let cipher = BlockCipher::new(mode, data_key, &header)?;
        Ok(Self::with_cipher(writer, mode, Some(cipher), Some(header)))
    }

    /// Pass-through writer for `PlainText`; needs no key.
    pub fn unencrypted(writer: W) -> Self {
        Self::with_cipher(writer, CryptoMode::PlainText, None, None)
    }

    fn with_cipher(
        writer: W,
        mode: CryptoMode,
        cipher: Option<BlockCipher>,
        header: Option<ObjectHeader>,
    ) -> Self {
        Self {
            writer,
            mode,
            cipher,
            stream_id: header.map_or(0, |h| h.stream_id),
            header_pending: header,
            next_ordinal: 0,
            pending: Vec::new(),
            chain_iv: None,
            summary: EncryptSummary::new(mode),
        }
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    /// Feed plaintext. Full blocks are sealed and written as soon as more
    /// data follows them.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        self.summary.plaintext_bytes += data.len() as u64;

        if self.cipher.is_none() {
            self.writer.write_all(data)?;
            self.summary.ciphertext_bytes += data.len() as u64;
            return Ok(());
        }

        let block_size = self.mode.block_size();
        self.pending.extend_from_slice(data);
        if self.pending.len() > block_size {
            let full = (self.pending.len() - 1) / block_size;
            let ready: Vec<u8> = self.pending.drain(..full * block_size).collect();
            for chunk in ready.chunks(block_size) {
                self.emit(chunk, false)?;
            }
        }
        Ok(())
    }

    /// Seal the held-back block as final, flush, and hand back the writer
    #[instrument(skip(self), fields(mode = %self.mode, stream_id = self.stream_id))]
    pub fn finish(mut self) -> Result<(W, EncryptSummary)> {
        if self.cipher.is_some() {
            let last = std::mem::take(&mut self.pending);
            self.emit(&last, true)?;
        }
        self.writer.flush()?;
        debug!(
            records = self.summary.records,
            plaintext_bytes = self.summary.plaintext_bytes,
            ciphertext_bytes = self.summary.ciphertext_bytes,
            "stream sealed"
        );
        Ok((self.writer, self.summary))
    }

    fn emit(&mut self, plaintext: &[u8], is_final: bool) -> Result<()> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| EncryptionError::InvalidConfiguration("no cipher keyed".into()))?;

        if let Some(header) = self.header_pending.take() {
            let encoded = header.encode();
            self.writer.write_all(&encoded)?;
            self.summary.ciphertext_bytes += encoded.len() as u64;
        }

        let ordinal = self.next_ordinal;
        let index = block_index(self.stream_id, ordinal);
        let iv = match (&self.chain_iv, self.mode) {
            (Some(prev), CryptoMode::AesCbcPkcs5Padding) => prev.clone(),
            _ => cipher.derive_iv(index)?,
        };

        let block = cipher.seal(index, is_final, &iv, plaintext)?;
        let encoded = block.encode()?;
        self.writer.write_all(&encoded)?;

        if self.mode == CryptoMode::AesCbcPkcs5Padding {
            self.chain_iv = next_chain_iv(&block).map(<[u8]>::to_vec);
        }
        self.summary.records += 1;
        self.summary.ciphertext_bytes += encoded.len() as u64;
        self.next_ordinal = ordinal.checked_add(1).ok_or_else(|| {
            EncryptionError::InvalidConfiguration(
                "object exceeds the maximum record count per stream".into(),
            )
        })?;
        Ok(())
    }
}

impl<W: Write> Write for StreamEncryptor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    /// Flushes only what is already sealed; the tail block waits for `finish`.
    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: Write> std::fmt::Debug for StreamEncryptor<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEncryptor")
            .field("mode", &self.mode)
            .field("stream_id", &self.stream_id)
            .field("next_ordinal", &self.next_ordinal)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Encrypt a whole buffer in one call
pub fn encrypt(
    mode: CryptoMode,
    data_key: &DataKey,
    header: ObjectHeader,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut encryptor = StreamEncryptor::new(Vec::new(), mode, data_key, header)?;
    encryptor.update(plaintext)?;
    let (out, _) = encryptor.finish()?;
    Ok(out)
}

/// Encrypt everything `reader` yields into `writer`
#[instrument(skip(reader, writer, data_key), fields(mode = %mode))]
pub fn encrypt_stream<R: Read, W: Write>(
    mut reader: R,
    writer: W,
    data_key: &DataKey,
    mode: CryptoMode,
    header: ObjectHeader,
) -> Result<(W, EncryptSummary)> {
    let mut encryptor = StreamEncryptor::new(writer, mode, data_key, header)?;
    let mut buf = vec![0u8; mode.block_size().max(8 * 1024)];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        encryptor.update(&buf[..n])?;
    }
    encryptor.finish()
}
