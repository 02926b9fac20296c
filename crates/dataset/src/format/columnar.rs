//! Minimal columnar layout: one JSON document per object holding each
//! column's values contiguously. Objects are always decoded whole.

use serde::{Deserialize, Serialize};

use crate::dataset::{PartitionData, Row};
use crate::error::{DatasetError, Result};
use crate::options::Options;

use super::FormatCodec;

const NAME: &str = "columnar";
const LAYOUT_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ColumnarObject {
    version: u16,
    row_count: usize,
    columns: Vec<ColumnChunk>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ColumnChunk {
    name: String,
    values: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnarCodec;

impl FormatCodec for ColumnarCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn extension(&self) -> &'static str {
        "columnar"
    }

    fn encode(&self, columns: &[String], rows: &[Row], _options: &Options) -> Result<Vec<u8>> {
        let chunks = columns
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnChunk {
                name: name.clone(),
                values: rows.iter().map(|row| row[i].clone()).collect(),
            })
            .collect();
        let object = ColumnarObject {
            version: LAYOUT_VERSION,
            row_count: rows.len(),
            columns: chunks,
        };
        serde_json::to_vec(&object).map_err(|err| DatasetError::format(NAME, err.to_string()))
    }

    fn decode(&self, bytes: &[u8], _options: &Options) -> Result<PartitionData> {
        let object: ColumnarObject =
            serde_json::from_slice(bytes).map_err(|err| DatasetError::format(NAME, err.to_string()))?;
        if object.version != LAYOUT_VERSION {
            return Err(DatasetError::format(
                NAME,
                format!("unsupported layout version {}", object.version),
            ));
        }
        if let Some(chunk) = object
            .columns
            .iter()
            .find(|chunk| chunk.values.len() != object.row_count)
        {
            return Err(DatasetError::format(
                NAME,
                format!(
                    "column {:?} holds {} values, expected {}",
                    chunk.name,
                    chunk.values.len(),
                    object.row_count
                ),
            ));
        }

        let rows = (0..object.row_count)
            .map(|r| object.columns.iter().map(|c| c.values[r].clone()).collect())
            .collect();
        let columns = object.columns.into_iter().map(|c| c.name).collect();
        Ok(PartitionData {
            columns: Some(columns),
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_survive() {
        let columns = vec!["language".to_string(), "user".to_string()];
        let rows = vec![
            vec!["Java".to_string(), "20000".to_string()],
            vec!["Scala".to_string(), "3000".to_string()],
        ];
        let bytes = ColumnarCodec.encode(&columns, &rows, &Options::new()).unwrap();
        let decoded = ColumnarCodec.decode(&bytes, &Options::new()).unwrap();
        assert_eq!(decoded.columns, Some(columns));
        assert_eq!(decoded.rows, rows);
    }

    #[test]
    fn test_inconsistent_column_rejected() {
        let bytes = br#"{"version":1,"row_count":2,"columns":[{"name":"a","values":["1"]}]}"#;
        let err = ColumnarCodec.decode(bytes, &Options::new()).unwrap_err();
        assert!(matches!(err, DatasetError::Format { .. }));
    }

    #[test]
    fn test_not_line_oriented() {
        assert!(!ColumnarCodec.line_oriented());
        assert!(ColumnarCodec.decode_lines(&[], true, &Options::new()).is_err());
        assert!(ColumnarCodec.decode(b"not json", &Options::new()).is_err());
    }
}
