//! Line-oriented decrypting reader
//!
//! Two consumers share the line rules here: [`TextFile`], which decrypts
//! whole objects one at a time, and split reads, where a partition owns the
//! lines whose first byte falls in its plaintext interval `(start, end]`
//! (the object's first partition also owns offset 0). A partition keeps
//! decrypting past `end` until its last line is complete.
//!
//! Lines end at `\n`; a trailing `\r` is stripped and the empty line after a
//! final terminator is not reported.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use compression::Compression;
use encryption::{CryptoMode, DataKey, DecryptedBlock, FileSource};
use tracing::{debug, instrument};

use crate::context::open_decryptor;
use crate::error::{DatasetError, Result};
use crate::planner::list_objects;

fn decode_line(bytes: &[u8], offset: u64) -> Result<String> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|_| {
        DatasetError::format("text", format!("line at offset {offset} is not valid UTF-8"))
    })
}

/// Split a whole plaintext buffer into lines. `base` is the plaintext
/// offset of `bytes[0]`, used in error messages.
pub(crate) fn split_lines(bytes: &[u8], base: u64) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut pos = 0usize;
    while let Some((line, next)) = next_line(bytes, pos) {
        lines.push(decode_line(line, base + pos as u64)?);
        pos = next;
    }
    Ok(lines)
}

/// The line starting at `pos` and the offset just past its terminator
fn next_line(bytes: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    if pos >= bytes.len() {
        return None;
    }
    match bytes[pos..].iter().position(|&b| b == b'\n') {
        Some(i) => Some((&bytes[pos..pos + i], pos + i + 1)),
        None => Some((&bytes[pos..], bytes.len())),
    }
}

/// Lines owned by the plaintext interval `(start, end]` of one object,
/// pulled from verified blocks that begin at offset `start`.
pub(crate) struct OwnedLines<I> {
    blocks: I,
    buf: Vec<u8>,
    /// Plaintext offset of `buf[0]`
    buf_offset: u64,
    /// Read position within `buf`
    pos: usize,
    /// Bytes after `pos` already known to hold no `\n`
    scanned: usize,
    end: u64,
    aligned: bool,
    exhausted: bool,
    done: bool,
}

impl<I> OwnedLines<I>
where
    I: Iterator<Item = encryption::Result<DecryptedBlock>>,
{
    pub(crate) fn new(blocks: I, start: u64, end: u64) -> Self {
        Self {
            blocks,
            buf: Vec::new(),
            buf_offset: start,
            pos: 0,
            scanned: 0,
            end,
            aligned: start == 0,
            exhausted: false,
            done: false,
        }
    }

    /// Append the next block; false once the source is drained.
    fn fill(&mut self) -> Result<bool> {
        match self.blocks.next() {
            None => {
                self.exhausted = true;
                Ok(false)
            }
            Some(block) => {
                let block = block?;
                self.buf.drain(..self.pos);
                self.buf_offset += self.pos as u64;
                self.pos = 0;
                self.buf.extend_from_slice(&block.data);
                Ok(true)
            }
        }
    }

    fn find_newline(&mut self) -> Option<usize> {
        let from = self.pos + self.scanned;
        match self.buf[from..].iter().position(|&b| b == b'\n') {
            Some(i) => {
                self.scanned = 0;
                Some(from + i)
            }
            None => {
                self.scanned = self.buf.len() - self.pos;
                None
            }
        }
    }

    fn step(&mut self) -> Result<Option<String>> {
        // Skip the partial line that belongs to the previous partition.
        while !self.aligned {
            match self.find_newline() {
                Some(nl) => {
                    self.pos = nl + 1;
                    self.aligned = true;
                }
                None => {
                    self.pos = self.buf.len();
                    self.scanned = 0;
                    if !self.fill()? {
                        return Ok(None);
                    }
                }
            }
        }

        loop {
            let line_start = self.buf_offset + self.pos as u64;
            if line_start > self.end {
                return Ok(None);
            }
            if let Some(nl) = self.find_newline() {
                let line = decode_line(&self.buf[self.pos..nl], line_start)?;
                self.pos = nl + 1;
                return Ok(Some(line));
            }
            if self.exhausted || !self.fill()? {
                if self.pos >= self.buf.len() {
                    return Ok(None);
                }
                let line = decode_line(&self.buf[self.pos..], line_start)?;
                self.pos = self.buf.len();
                return Ok(Some(line));
            }
        }
    }
}

impl<I> Iterator for OwnedLines<I>
where
    I: Iterator<Item = encryption::Result<DecryptedBlock>>,
{
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Lines of a file or directory of part files, decrypted on demand.
///
/// Each call to [`TextFile::lines`] re-reads the source.
#[derive(Debug, Clone)]
pub struct TextFile {
    path: PathBuf,
    mode: CryptoMode,
    data_key: Option<Arc<DataKey>>,
}

impl TextFile {
    pub(crate) fn new(path: PathBuf, mode: CryptoMode, data_key: Option<Arc<DataKey>>) -> Self {
        Self {
            path,
            mode,
            data_key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    /// Lazily yields every line, object by object in file-name order
    #[instrument(skip(self), fields(path = %self.path.display(), mode = %self.mode))]
    pub fn lines(&self) -> Result<Lines> {
        let objects = list_objects(&self.path)?
            .into_iter()
            .map(|object| object.path)
            .collect::<Vec<_>>();
        debug!(objects = objects.len(), "text objects listed");
        Ok(Lines {
            objects: objects.into_iter(),
            mode: self.mode,
            data_key: self.data_key.clone(),
            current: Vec::new(),
            current_path: PathBuf::new(),
            pos: 0,
            failed: false,
        })
    }

    pub fn collect_lines(&self) -> Result<Vec<String>> {
        self.lines()?.collect()
    }
}

/// Iterator returned by [`TextFile::lines`]. Fused after the first error.
pub struct Lines {
    objects: std::vec::IntoIter<PathBuf>,
    mode: CryptoMode,
    data_key: Option<Arc<DataKey>>,
    current: Vec<u8>,
    current_path: PathBuf,
    pos: usize,
    failed: bool,
}

impl Lines {
    fn load(&mut self, path: PathBuf) -> Result<()> {
        let source = FileSource::open(&path).map_err(|e| DatasetError::with_path(e, &path))?;
        let decryptor = open_decryptor(source, self.mode, self.data_key.as_deref())?;
        let plaintext = decryptor.decrypt_all()?;
        self.current = Compression::detect(&path).decompress(&plaintext)?.into_owned();
        debug!(path = %path.display(), bytes = self.current.len(), "text object decrypted");
        self.current_path = path;
        self.pos = 0;
        Ok(())
    }
}

impl Iterator for Lines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some((line, next)) = next_line(&self.current, self.pos) {
                let offset = self.pos as u64;
                self.pos = next;
                let line = decode_line(line, offset).map_err(|err| match err {
                    DatasetError::Format { format, message } => DatasetError::Format {
                        format,
                        message: format!("{message} in {}", self.current_path.display()),
                    },
                    other => other,
                });
                if line.is_err() {
                    self.failed = true;
                }
                return Some(line);
            }
            let path = self.objects.next()?;
            if let Err(err) = self.load(path) {
                self.failed = true;
                return Some(Err(err));
            }
        }
    }
}

impl std::fmt::Debug for Lines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lines")
            .field("mode", &self.mode)
            .field("current_path", &self.current_path)
            .field("remaining_objects", &self.objects.len())
            .finish()
    }
}
