//! Format options shared by readers and writers.
//!
//! Keys are case-insensitive (`minPartitions` and `minpartitions` are the
//! same option). Unknown keys are kept and ignored so callers can pass one
//! map to several codecs.

use std::collections::BTreeMap;

use compression::Compression;

use crate::error::{DatasetError, Result};

pub const HEADER: &str = "header";
pub const DELIMITER: &str = "delimiter";
pub const SEP: &str = "sep";
pub const COMPRESSION: &str = "compression";
pub const MIN_PARTITIONS: &str = "minpartitions";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    entries: BTreeMap<String, String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of these options with `key` set to `value`
    pub fn with(&self, key: impl AsRef<str>, value: impl ToString) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(key.as_ref().to_ascii_lowercase(), value.to_string());
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn header(&self) -> Result<bool> {
        match self.get(HEADER) {
            None => Ok(false),
            Some(value) => parse_bool(HEADER, value),
        }
    }

    /// Field delimiter, `default` when unset. `sep` is accepted as an alias.
    pub fn delimiter(&self, default: u8) -> Result<u8> {
        let (key, value) = match (self.get(DELIMITER), self.get(SEP)) {
            (Some(value), _) => (DELIMITER, value),
            (None, Some(value)) => (SEP, value),
            (None, None) => return Ok(default),
        };
        let byte = match value {
            "\\t" => b'\t',
            _ if value.len() == 1 && value.is_ascii() => value.as_bytes()[0],
            _ => {
                return Err(DatasetError::invalid_option(
                    key,
                    value,
                    "expected a single ASCII character",
                ))
            }
        };
        if matches!(byte, b'\n' | b'\r' | b'"') {
            return Err(DatasetError::invalid_option(
                key,
                value,
                "line terminators and quotes cannot delimit fields",
            ));
        }
        Ok(byte)
    }

    pub fn compression(&self) -> Result<Compression> {
        match self.get(COMPRESSION) {
            None => Ok(Compression::None),
            Some(value) => value.parse().map_err(|err: compression::CompressionError| {
                DatasetError::invalid_option(COMPRESSION, value, err.to_string())
            }),
        }
    }

    pub fn min_partitions(&self) -> Result<Option<usize>> {
        let Some(value) = self.get(MIN_PARTITIONS) else {
            return Ok(None);
        };
        match value.trim().parse::<usize>() {
            Ok(0) | Err(_) => Err(DatasetError::invalid_option(
                "minPartitions",
                value,
                "expected a positive integer",
            )),
            Ok(n) => Ok(Some(n)),
        }
    }
}

impl<K: AsRef<str>, V: ToString> FromIterator<(K, V)> for Options {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.to_string()))
            .collect();
        Self { entries }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(DatasetError::invalid_option(
            key,
            value,
            "expected true or false",
        )),
    }
}
