//! Input listing and split planning
//!
//! Objects are split only when both the format and the cipher mode allow
//! it. `PlainText` splits at any byte, `AES_GCM_CTR_V1` at record
//! boundaries. `AES/CBC/PKCS5Padding` never splits: asking for more
//! partitions than there are objects is an error rather than a silent
//! downgrade.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use encryption::{ByteRange, CryptoMode, EncryptionError};
use tracing::debug;

use crate::error::{DatasetError, Result};

/// One input object
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InputObject {
    pub path: PathBuf,
    pub len: u64,
}

/// Byte range of one object assigned to one read task
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Split {
    pub path: PathBuf,
    pub range: ByteRange,
    pub object_len: u64,
    pub whole_object: bool,
}

/// Files hidden from readers: markers such as `_SUCCESS` and temp files
pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

/// A single file, or the visible files of a directory in name order
pub(crate) fn list_objects(path: &Path) -> Result<Vec<InputObject>> {
    let meta = fs::metadata(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => DatasetError::NoInput {
            path: path.to_path_buf(),
        },
        _ => DatasetError::io(path, err),
    })?;
    if meta.is_file() {
        return Ok(vec![InputObject {
            path: path.to_path_buf(),
            len: meta.len(),
        }]);
    }

    let mut objects = Vec::new();
    for entry in fs::read_dir(path).map_err(|err| DatasetError::io(path, err))? {
        let entry = entry.map_err(|err| DatasetError::io(path, err))?;
        if is_hidden(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let entry_path = entry.path();
        let meta = entry
            .metadata()
            .map_err(|err| DatasetError::io(&entry_path, err))?;
        if meta.is_file() {
            objects.push(InputObject {
                path: entry_path,
                len: meta.len(),
            });
        }
    }
    objects.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(path = %path.display(), objects = objects.len(), "input listed");
    Ok(objects)
}

/// Assign byte ranges so that at least `min_partitions` tasks exist where
/// the mode and format allow. `splittable` reports whether the format can
/// split a given object (line-oriented and uncompressed).
pub(crate) fn plan_splits(
    objects: &[InputObject],
    mode: CryptoMode,
    min_partitions: usize,
    splittable: impl Fn(&Path) -> bool,
) -> Result<Vec<Split>> {
    let per_object = min_partitions.max(1).div_ceil(objects.len().max(1)) as u64;
    let mut splits = Vec::new();

    for object in objects {
        let format_splittable = splittable(&object.path);
        if !format_splittable || per_object == 1 {
            splits.push(whole(object, !format_splittable));
            continue;
        }
        if !mode.is_splittable() {
            return Err(EncryptionError::NotSplittable {
                mode,
                start: 0,
                end: object.len / per_object,
                object_len: object.len,
            }
            .into());
        }

        let unit = match mode.record_stride() {
            0 => 1,
            stride => stride,
        };
        // records start after the object header; the first split keeps it
        let header = mode.header_len().min(object.len);
        let units = (object.len - header).div_ceil(unit);
        let count = per_object.min(units).max(1);
        let boundary = |i: u64| match i {
            0 => 0,
            i if i == count => object.len,
            i => header + units * i / count * unit,
        };
        for i in 0..count {
            let (start, end) = (boundary(i), boundary(i + 1));
            splits.push(Split {
                path: object.path.clone(),
                range: ByteRange { start, end },
                object_len: object.len,
                whole_object: false,
            });
        }
    }
    debug!(
        objects = objects.len(),
        splits = splits.len(),
        min_partitions,
        "splits planned"
    );
    Ok(splits)
}

fn whole(object: &InputObject, whole_object: bool) -> Split {
    Split {
        path: object.path.clone(),
        range: ByteRange::full(object.len),
        object_len: object.len,
        whole_object,
    }
}
