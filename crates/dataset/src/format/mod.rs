//! Format codecs
//!
//! A codec turns rows into the plaintext bytes of one object and back. The
//! encryption layer never looks inside; it only learns whether the format
//! may be split at line boundaries.

mod columnar;
mod delimited;
mod text;

use std::fmt;

use crate::dataset::{PartitionData, Row};
use crate::error::{DatasetError, Result};
use crate::options::Options;

pub use columnar::ColumnarCodec;
pub use delimited::DelimitedCodec;
pub use text::TextCodec;

pub trait FormatCodec: Send + Sync + fmt::Debug {
    /// Short name used in errors and logs
    fn name(&self) -> &'static str;

    /// Extension of written objects, without the dot
    fn extension(&self) -> &'static str;

    /// True when every `\n` ends a record, so an object may be read as
    /// several line-aligned splits.
    fn line_oriented(&self) -> bool {
        false
    }

    fn encode(&self, columns: &[String], rows: &[Row], options: &Options) -> Result<Vec<u8>>;

    /// Decode one whole object
    fn decode(&self, bytes: &[u8], options: &Options) -> Result<PartitionData>;

    /// Decode the lines owned by one split. `at_object_start` is true when
    /// `lines[0]` is the first line of its object.
    fn decode_lines(
        &self,
        lines: &[String],
        at_object_start: bool,
        options: &Options,
    ) -> Result<PartitionData> {
        let _ = (lines, at_object_start, options);
        Err(DatasetError::format(
            self.name(),
            "format cannot be read line by line",
        ))
    }
}
