//! Read pipeline: immutable builder, deferred plan, per-partition tasks

use std::path::{Path, PathBuf};
use std::sync::Arc;

use compression::Compression;
use encryption::{ByteRange, ByteSource, CryptoMode, DataKey, FileSource, StreamDecryptor};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::context::{open_decryptor, CryptoContext};
use crate::dataset::{Dataset, PartitionData};
use crate::error::{DatasetError, Result};
use crate::format::{ColumnarCodec, DelimitedCodec, FormatCodec, TextCodec};
use crate::lines::OwnedLines;
use crate::options::{Options, MIN_PARTITIONS};
use crate::planner::{list_objects, plan_splits};

/// Reader configuration. Every method returns a new value; nothing touches
/// storage until a plan is executed.
#[derive(Debug, Clone)]
pub struct DataReader {
    ctx: CryptoContext,
    mode: CryptoMode,
    options: Options,
}

impl DataReader {
    pub(crate) fn new(ctx: CryptoContext, mode: CryptoMode) -> Self {
        Self {
            ctx,
            mode,
            options: Options::new(),
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

    /// Shorthand for the `minPartitions` option
    pub fn partitions(&self, n: usize) -> Self {
        self.option(MIN_PARTITIONS, n)
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    pub fn options_ref(&self) -> &Options {
        &self.options
    }

    pub fn csv(&self, path: impl Into<PathBuf>) -> ReadPlan {
        self.format(Arc::new(DelimitedCodec::csv()), path)
    }

    /// Delimited text; tab-separated unless `delimiter` is set
    pub fn delimited(&self, path: impl Into<PathBuf>) -> ReadPlan {
        self.format(Arc::new(DelimitedCodec::text()), path)
    }

    /// One `value` column per line
    pub fn text(&self, path: impl Into<PathBuf>) -> ReadPlan {
        self.format(Arc::new(TextCodec), path)
    }

    pub fn columnar(&self, path: impl Into<PathBuf>) -> ReadPlan {
        self.format(Arc::new(ColumnarCodec), path)
    }

    pub fn format(&self, codec: Arc<dyn FormatCodec>, path: impl Into<PathBuf>) -> ReadPlan {
        ReadPlan {
            ctx: self.ctx.clone(),
            mode: self.mode,
            options: Arc::new(self.options.clone()),
            codec,
            path: path.into(),
        }
    }
}

/// Deferred read of one path
#[derive(Debug, Clone)]
pub struct ReadPlan {
    ctx: CryptoContext,
    mode: CryptoMode,
    options: Arc<Options>,
    codec: Arc<dyn FormatCodec>,
    path: PathBuf,
}

impl ReadPlan {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    /// List the input and plan one task per split
    #[instrument(skip(self), fields(path = %self.path.display(), mode = %self.mode, format = self.codec.name()))]
    pub fn tasks(&self) -> Result<Vec<ReadTask>> {
        let data_key = self.ctx.key_for(self.mode)?;
        let min_partitions = self.options.min_partitions()?.unwrap_or(1);
        let objects = list_objects(&self.path)?;

        let line_oriented = self.codec.line_oriented();
        let splits = plan_splits(&objects, self.mode, min_partitions, |path| {
            line_oriented && Compression::detect(path).is_none()
        })?;

        let tasks = splits
            .into_iter()
            .enumerate()
            .map(|(partition, split)| ReadTask {
                partition,
                compression: Compression::detect(&split.path),
                path: split.path,
                range: split.range,
                object_len: split.object_len,
                whole_object: split.whole_object,
                mode: self.mode,
                codec: Arc::clone(&self.codec),
                options: Arc::clone(&self.options),
                data_key: data_key.clone(),
            })
            .collect::<Vec<_>>();
        debug!(tasks = tasks.len(), "read tasks planned");
        Ok(tasks)
    }

    /// Run every task in order on the calling thread
    #[instrument(skip(self), fields(path = %self.path.display(), mode = %self.mode))]
    pub fn collect(&self) -> Result<Dataset> {
        let outputs = self
            .tasks()?
            .iter()
            .map(ReadTask::execute)
            .collect::<Result<Vec<_>>>()?;
        let dataset = assemble(outputs)?;
        info!(
            partitions = dataset.num_partitions(),
            rows = dataset.count(),
            "read complete"
        );
        Ok(dataset)
    }
}

/// Combine task outputs; the first header seen names the columns.
pub fn assemble(outputs: Vec<PartitionData>) -> Result<Dataset> {
    let columns = outputs
        .iter()
        .find_map(|out| out.columns.clone())
        .or_else(|| {
            outputs
                .iter()
                .flat_map(|out| out.rows.first())
                .next()
                .map(|row| Dataset::default_columns(row.len()))
        })
        .unwrap_or_default();
    Dataset::from_partitions(columns, outputs.into_iter().map(|out| out.rows).collect())
}

/// One partition of a read: an object and the byte range it owns.
///
/// Tasks are independent and `Send`; they may run on any thread and be
/// retried freely, since decryption is a pure function of the stored bytes.
#[derive(Clone, Serialize)]
pub struct ReadTask {
    partition: usize,
    path: PathBuf,
    range: ByteRange,
    object_len: u64,
    whole_object: bool,
    #[serde(serialize_with = "serialize_mode")]
    mode: CryptoMode,
    compression: Compression,
    #[serde(skip)]
    codec: Arc<dyn FormatCodec>,
    #[serde(skip)]
    options: Arc<Options>,
    #[serde(skip)]
    data_key: Option<Arc<DataKey>>,
}

fn serialize_mode<S: serde::Serializer>(
    mode: &CryptoMode,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(mode.identifier())
}

impl ReadTask {
    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn range(&self) -> ByteRange {
        self.range
    }

    pub fn is_whole_object(&self) -> bool {
        self.whole_object
    }

    /// Decrypt this task's range and decode its rows
    #[instrument(
        skip(self),
        fields(partition = self.partition, path = %self.path.display(), start = self.range.start, end = self.range.end)
    )]
    pub fn execute(&self) -> Result<PartitionData> {
        let source =
            FileSource::open(&self.path).map_err(|e| DatasetError::with_path(e, &self.path))?;
        if source.len() != self.object_len {
            return Err(DatasetError::io(
                &self.path,
                std::io::Error::other(format!(
                    "object changed size since planning ({} -> {} bytes)",
                    self.object_len,
                    source.len()
                )),
            ));
        }
        let decryptor = open_decryptor(source, self.mode, self.data_key.as_deref())?;

        let out = if self.whole_object {
            let plaintext = decryptor.decrypt_all()?;
            let plaintext = self.compression.decompress(&plaintext)?;
            self.codec.decode(&plaintext, &self.options)?
        } else {
            self.decode_owned_lines(&decryptor)?
        };
        debug!(rows = out.rows.len(), "partition decoded");
        Ok(out)
    }

    fn decode_owned_lines(&self, decryptor: &StreamDecryptor<FileSource>) -> Result<PartitionData> {
        let object_len = decryptor.object_len();
        let (start, end, blocks) = if self.mode.is_encrypted() {
            let records = decryptor.owned_records(self.range);
            if records.is_empty() {
                return Ok(PartitionData::default());
            }
            let block_size = self.mode.block_size() as u64;
            let end = if records.end == decryptor.record_count() {
                u64::MAX
            } else {
                records.end * block_size
            };
            let first = decryptor.record_offset(records.start);
            let blocks = decryptor.blocks(ByteRange::new(first, object_len)?)?;
            (records.start * block_size, end, blocks)
        } else {
            if self.range.is_empty() && object_len > 0 {
                return Ok(PartitionData::default());
            }
            let start = self.range.start.min(object_len);
            let blocks = decryptor.blocks(ByteRange::new(start, object_len)?)?;
            (start, self.range.end.min(object_len), blocks)
        };

        let lines = OwnedLines::new(blocks, start, end).collect::<Result<Vec<_>>>()?;
        self.codec.decode_lines(&lines, start == 0, &self.options)
    }
}

impl std::fmt::Debug for ReadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTask")
            .field("partition", &self.partition)
            .field("path", &self.path)
            .field("range", &self.range)
            .field("mode", &self.mode)
            .field("format", &self.codec.name())
            .field("whole_object", &self.whole_object)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_plain(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_builder_is_immutable() {
        let base = CryptoContext::plain().read(CryptoMode::PlainText);
        let with_header = base.option("header", true);
        assert!(base.options_ref().get("header").is_none());
        assert_eq!(with_header.options_ref().get("header"), Some("true"));

        let many = base.options([("sep", "|"), ("minPartitions", "3")]);
        assert_eq!(many.options_ref().min_partitions().unwrap(), Some(3));
        assert_eq!(base.partitions(2).options_ref().get("minPartitions"), Some("2"));
    }

    #[test]
    fn test_plan_does_no_io_until_tasks() {
        let plan = CryptoContext::plain()
            .read(CryptoMode::PlainText)
            .csv("/definitely/not/here");
        assert!(matches!(plan.tasks(), Err(DatasetError::NoInput { .. })));
    }

    #[test]
    fn test_plain_csv_split_reads() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..50).map(|i| format!("row{i},{}\n", i * 7)).collect();
        let path = write_plain(dir.path(), "people.csv", &format!("name,value\n{body}"));

        for partitions in [1, 2, 7] {
            let plan = CryptoContext::plain()
                .read(CryptoMode::PlainText)
                .option("header", "true")
                .partitions(partitions)
                .csv(&path);
            let tasks = plan.tasks().unwrap();
            assert_eq!(tasks.len(), partitions);

            let ds = plan.collect().unwrap();
            assert_eq!(ds.columns(), &["name", "value"]);
            assert_eq!(ds.count(), 50);
            assert_eq!(ds.rows().next().unwrap()[0], "row0");
            assert_eq!(ds.rows().last().unwrap()[0], "row49");
        }
    }

    #[test]
    fn test_headerless_gets_default_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plain(dir.path(), "t.csv", "a,1\nb,2\n");
        let ds = CryptoContext::plain()
            .read(CryptoMode::PlainText)
            .csv(path)
            .collect()
            .unwrap();
        assert_eq!(ds.columns(), &["_c0", "_c1"]);
        assert_eq!(ds.count(), 2);
    }

    #[test]
    fn test_task_serializes_for_scheduling() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plain(dir.path(), "t.csv", "a,1\n");
        let tasks = CryptoContext::plain()
            .read(CryptoMode::PlainText)
            .csv(path)
            .tasks()
            .unwrap();
        let json = serde_json::to_string(&tasks[0]).unwrap();
        assert!(json.contains("\"mode\":\"plain_text\""));
        assert!(json.contains("\"range\":{\"start\":0,\"end\":4}"));
    }

    #[test]
    fn test_encrypted_read_needs_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plain(dir.path(), "t.csv", "a,1\n");
        let err = CryptoContext::plain()
            .read(CryptoMode::AesGcmCtrV1)
            .csv(path)
            .tasks()
            .unwrap_err();
        assert!(matches!(err, DatasetError::Encryption { .. }));
    }
}
