//! Write pipeline
//!
//! Each dataset partition becomes one object `part-NNNNN.<ext>` whose part
//! number is also its encryption stream id. Every task carries an object
//! header with a salt drawn when the write is prepared, so objects under
//! one data key never share a nonce, while a retried task reproduces its
//! bytes exactly. Objects are written to a hidden temp file and renamed
//! into place; a `_SUCCESS` marker is written once every part is in place.

use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use compression::Compression;
use encryption::{CryptoMode, DataKey, EncryptSummary, EncryptionError, ObjectHeader};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::context::{open_encryptor, CryptoContext};
use crate::dataset::{Dataset, Row};
use crate::error::{DatasetError, Result};
use crate::format::{ColumnarCodec, DelimitedCodec, FormatCodec, TextCodec};
use crate::options::{Options, COMPRESSION};
use crate::planner::is_hidden;

pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// What to do when the output path already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
    /// Replace the existing output
    Overwrite,
    /// Add new parts after the existing ones
    Append,
    #[default]
    ErrorIfExists,
    /// Leave the existing output alone and write nothing
    Ignore,
}

impl SaveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveMode::Overwrite => "overwrite",
            SaveMode::Append => "append",
            SaveMode::ErrorIfExists => "errorifexists",
            SaveMode::Ignore => "ignore",
        }
    }
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SaveMode {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(SaveMode::Overwrite),
            "append" => Ok(SaveMode::Append),
            "errorifexists" | "error" | "default" => Ok(SaveMode::ErrorIfExists),
            "ignore" => Ok(SaveMode::Ignore),
            _ => Err(DatasetError::invalid_option(
                "mode",
                s,
                "expected overwrite, append, errorifexists or ignore",
            )),
        }
    }
}

/// Writer configuration; every method returns a new value.
#[derive(Debug, Clone)]
pub struct DataWriter<'a> {
    ctx: CryptoContext,
    dataset: &'a Dataset,
    mode: CryptoMode,
    save_mode: SaveMode,
    options: Options,
}

impl<'a> DataWriter<'a> {
    pub(crate) fn new(ctx: CryptoContext, dataset: &'a Dataset, mode: CryptoMode) -> Self {
        Self {
            ctx,
            dataset,
            mode,
            save_mode: SaveMode::default(),
            options: Options::new(),
        }
    }

    /// Policy for pre-existing output
    pub fn mode(&self, save_mode: SaveMode) -> Self {
        Self {
            save_mode,
            ..self.clone()
        }
    }

    pub fn option(&self, key: impl AsRef<str>, value: impl ToString) -> Self {
        Self {
            options: self.options.with(key, value),
            ..self.clone()
        }
    }

    pub fn options<I, K, V>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: ToString,
    {
        let options = entries
            .into_iter()
            .fold(self.options.clone(), |acc, (k, v)| acc.with(k, v));
        Self {
            options,
            ..self.clone()
        }
    }

    pub fn crypto_mode(&self) -> CryptoMode {
        self.mode
    }

    pub fn save_mode(&self) -> SaveMode {
        self.save_mode
    }

    pub fn csv(&self, path: impl Into<PathBuf>) -> WritePlan<'a> {
        self.format(Arc::new(DelimitedCodec::csv()), path)
    }

    pub fn delimited(&self, path: impl Into<PathBuf>) -> WritePlan<'a> {
        self.format(Arc::new(DelimitedCodec::text()), path)
    }

    pub fn text(&self, path: impl Into<PathBuf>) -> WritePlan<'a> {
        self.format(Arc::new(TextCodec), path)
    }

    pub fn columnar(&self, path: impl Into<PathBuf>) -> WritePlan<'a> {
        self.format(Arc::new(ColumnarCodec), path)
    }

    pub fn format(&self, codec: Arc<dyn FormatCodec>, path: impl Into<PathBuf>) -> WritePlan<'a> {
        WritePlan {
            ctx: self.ctx.clone(),
            dataset: self.dataset,
            mode: self.mode,
            save_mode: self.save_mode,
            options: Arc::new(self.options.clone()),
            codec,
            path: path.into(),
        }
    }
}

/// Deferred write of one dataset to one output directory
#[derive(Debug, Clone)]
pub struct WritePlan<'a> {
    ctx: CryptoContext,
    dataset: &'a Dataset,
    mode: CryptoMode,
    save_mode: SaveMode,
    options: Arc<Options>,
    codec: Arc<dyn FormatCodec>,
    path: PathBuf,
}

/// Result of one written part
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenPart {
    pub path: PathBuf,
    pub rows: usize,
    pub summary: EncryptSummary,
}

/// Result of a whole write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub path: PathBuf,
    pub save_mode: SaveMode,
    /// True when `Ignore` found existing output and nothing was written
    pub skipped: bool,
    pub parts: Vec<WrittenPart>,
}

impl WriteSummary {
    pub fn rows(&self) -> usize {
        self.parts.iter().map(|p| p.rows).sum()
    }

    /// Byte and record counts over all parts
    pub fn totals(&self, mode: CryptoMode) -> EncryptSummary {
        let mut total = EncryptSummary::new(mode);
        for part in &self.parts {
            total.merge(&part.summary);
        }
        total
    }
}

impl<'a> WritePlan<'a> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply the save mode to the output path and plan one task per
    /// partition. `None` means the save mode chose to skip the write.
    #[instrument(skip(self), fields(path = %self.path.display(), mode = %self.mode, save_mode = %self.save_mode))]
    pub fn prepare(&self) -> Result<Option<Vec<WriteTask<'a>>>> {
        let data_key = self.ctx.key_for(self.mode)?;
        let compression = self.options.compression()?;
        if !compression.is_none() && !self.codec.line_oriented() {
            return Err(DatasetError::invalid_option(
                COMPRESSION,
                compression.to_string(),
                format!("{} output cannot be compressed", self.codec.name()),
            ));
        }

        let first_part = match (self.path.exists(), self.save_mode) {
            (false, _) => {
                create_dir(&self.path)?;
                0
            }
            (true, SaveMode::ErrorIfExists) => {
                return Err(DatasetError::OutputExists {
                    path: self.path.clone(),
                })
            }
            (true, SaveMode::Ignore) => {
                warn!("output exists, write skipped");
                return Ok(None);
            }
            (true, SaveMode::Overwrite) => {
                warn!("replacing existing output");
                remove_output(&self.path)?;
                create_dir(&self.path)?;
                0
            }
            (true, SaveMode::Append) => {
                if !self.path.is_dir() {
                    return Err(DatasetError::OutputExists {
                        path: self.path.clone(),
                    });
                }
                let next = next_part_number(&self.path)?;
                if next > 0 {
                    warn!(next_part = next, "appending after existing parts");
                }
                next
            }
        };

        let tasks = self
            .dataset
            .partitions()
            .iter()
            .enumerate()
            .map(|(i, rows)| {
                let part = u32::try_from(i)
                    .ok()
                    .and_then(|i| first_part.checked_add(i))
                    .ok_or_else(|| {
                        EncryptionError::InvalidConfiguration(
                            "part numbers exhausted for this output".into(),
                        )
                    })?;
                Ok(WriteTask {
                    part,
                    header: ObjectHeader::random(part),
                    dir: self.path.clone(),
                    file_name: part_file_name(part, self.codec.extension(), compression),
                    columns: self.dataset.columns(),
                    rows,
                    mode: self.mode,
                    compression,
                    codec: Arc::clone(&self.codec),
                    options: Arc::clone(&self.options),
                    data_key: data_key.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(tasks = tasks.len(), first_part, "write tasks planned");
        Ok(Some(tasks))
    }

    /// Mark the output complete
    pub fn commit(&self) -> Result<()> {
        let marker = self.path.join(SUCCESS_MARKER);
        fs::write(&marker, b"").map_err(|err| DatasetError::io(&marker, err))
    }

    /// Prepare, run every task in order, and commit
    #[instrument(skip(self), fields(path = %self.path.display(), mode = %self.mode))]
    pub fn execute(&self) -> Result<WriteSummary> {
        let Some(tasks) = self.prepare()? else {
            return Ok(WriteSummary {
                path: self.path.clone(),
                save_mode: self.save_mode,
                skipped: true,
                parts: Vec::new(),
            });
        };
        let parts = tasks
            .iter()
            .map(WriteTask::execute)
            .collect::<Result<Vec<_>>>()?;
        self.commit()?;

        let summary = WriteSummary {
            path: self.path.clone(),
            save_mode: self.save_mode,
            skipped: false,
            parts,
        };
        info!(
            parts = summary.parts.len(),
            rows = summary.rows(),
            "write complete"
        );
        Ok(summary)
    }
}

/// One output object. Re-running a task rewrites the same bytes.
#[derive(Clone)]
pub struct WriteTask<'a> {
    part: u32,
    header: ObjectHeader,
    dir: PathBuf,
    file_name: String,
    columns: &'a [String],
    rows: &'a [Row],
    mode: CryptoMode,
    compression: Compression,
    codec: Arc<dyn FormatCodec>,
    options: Arc<Options>,
    data_key: Option<Arc<DataKey>>,
}

impl WriteTask<'_> {
    pub fn part(&self) -> u32 {
        self.part
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    #[instrument(skip(self), fields(part = self.part, rows = self.rows.len(), mode = %self.mode))]
    pub fn execute(&self) -> Result<WrittenPart> {
        let encoded = self.codec.encode(self.columns, self.rows, &self.options)?;
        let (payload, _) = self.compression.compress(&encoded)?;

        let target = self.path();
        let temp = self.dir.join(format!(".{}.tmp", self.file_name));
        let file = File::create(&temp).map_err(|err| DatasetError::io(&temp, err))?;

        let mut encryptor = open_encryptor(
            BufWriter::new(file),
            self.mode,
            self.data_key.as_deref(),
            self.header,
        )?;
        encryptor
            .update(&payload)
            .map_err(|e| DatasetError::with_path(e, &temp))?;
        let (writer, summary) = encryptor
            .finish()
            .map_err(|e| DatasetError::with_path(e, &temp))?;
        let file = writer
            .into_inner()
            .map_err(|err| DatasetError::io(&temp, err.into_error()))?;
        file.sync_all().map_err(|err| DatasetError::io(&temp, err))?;
        fs::rename(&temp, &target).map_err(|err| DatasetError::io(&target, err))?;

        debug!(
            path = %target.display(),
            ciphertext_bytes = summary.ciphertext_bytes,
            "part written"
        );
        Ok(WrittenPart {
            path: target,
            rows: self.rows.len(),
            summary,
        })
    }
}

impl fmt::Debug for WriteTask<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTask")
            .field("part", &self.part)
            .field("path", &self.path())
            .field("rows", &self.rows.len())
            .field("mode", &self.mode)
            .field("compression", &self.compression)
            .finish()
    }
}

fn part_file_name(part: u32, extension: &str, compression: Compression) -> String {
    match compression.extension() {
        Some(suffix) => format!("part-{part:05}.{extension}.{suffix}"),
        None => format!("part-{part:05}.{extension}"),
    }
}

/// Part number parsed from a `part-NNNNN...` file name
fn part_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("part-")?;
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}

fn next_part_number(dir: &Path) -> Result<u32> {
    let mut next = 0u32;
    for entry in fs::read_dir(dir).map_err(|err| DatasetError::io(dir, err))? {
        let entry = entry.map_err(|err| DatasetError::io(dir, err))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_hidden(&name) {
            continue;
        }
        if let Some(n) = part_number(&name) {
            next = next.max(n.saturating_add(1));
        }
    }
    Ok(next)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|err| DatasetError::io(path, err))
}

fn remove_output(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|err| DatasetError::io(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn dataset() -> Dataset {
        Dataset::new(
            vec!["language".into(), "user".into()],
            vec![
                vec!["Java".into(), "20000".into()],
                vec!["Python".into(), "100000".into()],
                vec!["Scala".into(), "3000".into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_save_mode_parsing() {
        assert_eq!("Overwrite".parse::<SaveMode>().unwrap(), SaveMode::Overwrite);
        assert_eq!("error".parse::<SaveMode>().unwrap(), SaveMode::ErrorIfExists);
        assert!("replace".parse::<SaveMode>().is_err());
        assert_eq!(SaveMode::default(), SaveMode::ErrorIfExists);
        assert_eq!(SaveMode::Append.to_string(), "append");
    }

    #[test]
    fn test_part_names() {
        assert_eq!(part_file_name(3, "csv", Compression::None), "part-00003.csv");
        assert_eq!(part_file_name(12, "csv", Compression::zstd()), "part-00012.csv.zst");
        assert_eq!(part_number("part-00012.csv.zst"), Some(12));
        assert_eq!(part_number("_SUCCESS"), None);
    }

    #[test]
    fn test_plain_write_layout() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let ds = dataset().repartition(2);

        let summary = CryptoContext::plain()
            .write(&ds, CryptoMode::PlainText)
            .option("header", true)
            .csv(&out)
            .execute()
            .unwrap();
        assert_eq!(summary.rows(), 3);
        assert!(out.join(SUCCESS_MARKER).exists());
        assert_eq!(
            fs::read_to_string(out.join("part-00000.csv")).unwrap(),
            "language,user\nJava,20000\n"
        );
        assert!(out.join("part-00001.csv").exists());
    }

    #[test]
    fn test_save_modes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let ds = dataset();
        let writer = CryptoContext::plain().write(&ds, CryptoMode::PlainText);

        writer.csv(&out).execute().unwrap();
        assert!(matches!(
            writer.csv(&out).execute(),
            Err(DatasetError::OutputExists { .. })
        ));
        assert!(writer.mode(SaveMode::Ignore).csv(&out).execute().unwrap().skipped);

        let appended = writer.mode(SaveMode::Append).csv(&out).execute().unwrap();
        assert!(appended.parts[0].path.ends_with("part-00001.csv"));

        writer.mode(SaveMode::Overwrite).csv(&out).execute().unwrap();
        assert!(!out.join("part-00001.csv").exists());
        assert!(out.join("part-00000.csv").exists());
    }

    #[test]
    #[traced_test]
    fn test_ignore_logs_skip() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let ds = dataset();
        let summary = CryptoContext::plain()
            .write(&ds, CryptoMode::PlainText)
            .mode(SaveMode::Ignore)
            .csv(&out)
            .execute()
            .unwrap();
        assert!(summary.skipped);
        assert!(fs::read_dir(&out).unwrap().next().is_none());
        assert!(logs_contain("output exists, write skipped"));
    }

    #[test]
    fn test_columnar_rejects_compression() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dataset();
        let err = CryptoContext::plain()
            .write(&ds, CryptoMode::PlainText)
            .option("compression", "lz4")
            .columnar(dir.path().join("out"))
            .prepare()
            .unwrap_err();
        assert!(matches!(err, DatasetError::InvalidOption { .. }));
    }

    #[test]
    fn test_compressed_part_extension() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let ds = dataset();
        CryptoContext::plain()
            .write(&ds, CryptoMode::PlainText)
            .option("compression", "zstd")
            .csv(&out)
            .execute()
            .unwrap();
        let bytes = fs::read(out.join("part-00000.csv.zst")).unwrap();
        let plain = Compression::zstd().decompress(&bytes).unwrap();
        assert!(plain.starts_with(b"Java,20000\n"));
    }
}
