use crate::dataset::{PartitionData, Row};
use crate::error::{DatasetError, Result};
use crate::lines::split_lines;
use crate::options::Options;

use super::FormatCodec;

/// Each line is a row with a single `value` column
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

pub const VALUE_COLUMN: &str = "value";

impl FormatCodec for TextCodec {
    fn name(&self) -> &'static str {
        "text"
    }

    fn extension(&self) -> &'static str {
        "txt"
    }

    fn line_oriented(&self) -> bool {
        true
    }

    fn encode(&self, columns: &[String], rows: &[Row], _options: &Options) -> Result<Vec<u8>> {
        if columns.len() != 1 {
            return Err(DatasetError::format(
                "text",
                format!("text output needs exactly one column, got {}", columns.len()),
            ));
        }
        let mut out = Vec::new();
        for row in rows {
            if row[0].contains('\n') {
                return Err(DatasetError::format("text", "value contains a line break"));
            }
            out.extend_from_slice(row[0].as_bytes());
            out.push(b'\n');
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8], options: &Options) -> Result<PartitionData> {
        self.decode_lines(&split_lines(bytes, 0)?, true, options)
    }

    fn decode_lines(
        &self,
        lines: &[String],
        at_object_start: bool,
        _options: &Options,
    ) -> Result<PartitionData> {
        Ok(PartitionData {
            columns: at_object_start.then(|| vec![VALUE_COLUMN.to_string()]),
            rows: lines.iter().map(|line| vec![line.clone()]).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_become_rows() {
        let decoded = TextCodec.decode(b"a,1\nb,2\r\n", &Options::new()).unwrap();
        assert_eq!(decoded.columns.as_deref(), Some(&["value".to_string()][..]));
        assert_eq!(decoded.rows, vec![vec!["a,1".to_string()], vec!["b,2".to_string()]]);
    }

    #[test]
    fn test_single_column_required() {
        let err = TextCodec
            .encode(&["a".into(), "b".into()], &[], &Options::new())
            .unwrap_err();
        assert!(matches!(err, DatasetError::Format { .. }));
    }
}
