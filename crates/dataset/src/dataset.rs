//! In-memory partitioned rows

use crate::error::{DatasetError, Result};

/// One record; every field is kept as text
pub type Row = Vec<String>;

/// Named columns and rows split into ordered partitions.
///
/// Partition boundaries carry through writes: each partition becomes one
/// output object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    columns: Vec<String>,
    partitions: Vec<Vec<Row>>,
}

/// Rows decoded by one read task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionData {
    /// Column names, when this partition saw its object's header
    pub columns: Option<Vec<String>>,
    pub rows: Vec<Row>,
}

impl Dataset {
    /// Single-partition dataset
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Result<Self> {
        Self::from_partitions(columns, vec![rows])
    }

    pub fn from_partitions(columns: Vec<String>, partitions: Vec<Vec<Row>>) -> Result<Self> {
        let width = columns.len();
        for (p, rows) in partitions.iter().enumerate() {
            if let Some((r, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != width) {
                return Err(DatasetError::format(
                    "dataset",
                    format!(
                        "row {r} of partition {p} has {} fields, expected {width}",
                        row.len()
                    ),
                ));
            }
        }
        Ok(Self {
            columns,
            partitions,
        })
    }

    /// Column names `_c0`, `_c1`, ... for data without a header
    pub fn default_columns(width: usize) -> Vec<String> {
        (0..width).map(|i| format!("_c{i}")).collect()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn partitions(&self) -> &[Vec<Row>] {
        &self.partitions
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Total row count across partitions
    pub fn count(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Rows in partition order
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.partitions.iter().flatten()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.partitions.into_iter().flatten().collect()
    }

    /// Redistribute rows into `n` contiguous, near-equal partitions
    pub fn repartition(&self, n: usize) -> Self {
        let n = n.max(1);
        let rows: Vec<Row> = self.rows().cloned().collect();
        let total = rows.len();
        let mut iter = rows.into_iter();
        let partitions = (0..n)
            .map(|i| {
                let take = total * (i + 1) / n - total * i / n;
                iter.by_ref().take(take).collect()
            })
            .collect();
        Self {
            columns: self.columns.clone(),
            partitions,
        }
    }

    /// Single-partition copy with rows ordered by `column` (stable)
    pub fn sorted_by(&self, column: &str) -> Result<Self> {
        let idx = self.column_index(column).ok_or_else(|| {
            DatasetError::format("dataset", format!("no column named {column:?}"))
        })?;
        let mut rows: Vec<Row> = self.rows().cloned().collect();
        rows.sort_by(|a, b| a[idx].cmp(&b[idx]));
        Ok(Self {
            columns: self.columns.clone(),
            partitions: vec![rows],
        })
    }
}
