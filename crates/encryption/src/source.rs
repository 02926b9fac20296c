//! Random-access byte sources
//!
//! The decryptor reads records by offset, so it works against anything that
//! can serve positional reads: an in-memory buffer or a file.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EncryptionError, Result};

/// Half-open byte range `[start, end)` within an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(EncryptionError::InvalidConfiguration(format!(
                "byte range start {start} is past its end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The whole of an object of `len` bytes
    pub fn full(len: u64) -> Self {
        Self { start: 0, end: len }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    /// Does this range cover every byte of an object of `len` bytes
    pub fn covers(&self, len: u64) -> bool {
        self.start == 0 && self.end >= len
    }
}

/// Positional reads over an immutable object
pub trait ByteSource: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes at `offset`; returns the count read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Fill `buf` entirely or fail with a framing error at the short offset
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let pos = offset + filled as u64;
            let n = self.read_at(pos, &mut buf[filled..])?;
            if n == 0 {
                return Err(EncryptionError::framing(
                    pos,
                    format!("unexpected end of object, {} bytes missing", buf.len() - filled),
                ));
            }
            filled += n;
        }
        Ok(())
    }
}

impl ByteSource for [u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let total = <[u8]>::len(self) as u64;
        if offset >= total {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(<[u8]>::len(self) - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl ByteSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.as_slice().read_at(offset, buf)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for &T {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for Arc<T> {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }
}

/// File opened for positional reads; the length is captured at open time.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    len: u64,
    path: PathBuf,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let max = buf.len().min((self.len - offset) as usize);
        positional_read(&self.file, offset, &mut buf[..max]).map_err(EncryptionError::Io)
    }
}

#[cfg(unix)]
fn positional_read(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn positional_read(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_range_basics() {
        let range = ByteRange::new(10, 20).unwrap();
        assert_eq!(range.len(), 10);
        assert!(range.contains(10));
        assert!(!range.contains(20));
        assert!(!range.covers(20));
        assert!(ByteRange::full(20).covers(20));
        assert!(ByteRange::new(0, 100).unwrap().covers(20));
        assert!(ByteRange::new(5, 4).is_err());
        assert!(ByteRange::new(7, 7).unwrap().is_empty());
    }

    #[test]
    fn test_slice_reads() {
        let data = b"0123456789".to_vec();
        let mut buf = [0u8; 4];
        assert_eq!(data.read_at(8, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(data.read_at(10, &mut buf).unwrap(), 0);

        data.read_exact_at(2, &mut buf).unwrap();
        assert_eq!(&buf, b"2345");
    }

    #[test]
    fn test_read_exact_past_end_is_framing_error() {
        let data: &[u8] = b"abc";
        let mut buf = [0u8; 5];
        let err = data.read_exact_at(1, &mut buf).unwrap_err();
        assert!(matches!(err, EncryptionError::Framing { offset: 3, .. }));
    }

    #[test]
    fn test_file_source() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello file source").unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.len(), 17);
        let mut buf = [0u8; 6];
        source.read_exact_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"file s");
        assert_eq!(source.read_at(17, &mut buf).unwrap(), 0);
    }
}
