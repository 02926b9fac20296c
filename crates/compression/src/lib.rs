//! Whole-object compression for delimited text output.
//!
//! A codec is chosen per write and recorded in the object's file extension
//! (`.lz4`, `.zst`), so readers pick the matching decoder from the path
//! alone. Compression always runs before encryption.

mod error;

use std::borrow::Cow;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};

pub use error::CompressionError;

pub type Result<T> = std::result::Result<T, CompressionError>;

pub const DEFAULT_LZ4_LEVEL: i32 = 4;
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.ct_eq(b))
}

/// Codec applied to a whole object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Compression {
    #[default]
    None,
    Lz4 {
        level: i32,
    },
    Zstd {
        level: i32,
    },
}

/// Compression statistics for one object
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub original_size: usize,
    pub compressed_size: usize,
    pub compressed: bool,
    pub algorithm: String,
}

impl CompressionResult {
    pub fn ratio(&self) -> f32 {
        if self.compressed_size == 0 {
            return 1.0;
        }
        self.original_size as f32 / self.compressed_size as f32
    }
}

impl Compression {
    pub fn lz4() -> Self {
        Compression::Lz4 {
            level: DEFAULT_LZ4_LEVEL,
        }
    }

    pub fn zstd() -> Self {
        Compression::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 { .. } => "lz4",
            Compression::Zstd { .. } => "zstd",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Compression::None)
    }

    /// File extension appended to compressed objects
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Lz4 { .. } => Some("lz4"),
            Compression::Zstd { .. } => Some("zst"),
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "lz4" => Some(Self::lz4()),
            "zst" | "zstd" => Some(Self::zstd()),
            _ => None,
        }
    }

    /// Codec implied by the last extension of `path`; `None` when unknown.
    pub fn detect(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
            .unwrap_or(Compression::None)
    }

    /// Compress `data`, verifying that it decodes back to the input.
    #[instrument(skip(self, data), fields(algorithm = self.algorithm(), input_len = data.len()))]
    pub fn compress<'a>(&self, data: &'a [u8]) -> Result<(Cow<'a, [u8]>, CompressionResult)> {
        let (compressed, algorithm) = match *self {
            Compression::None => {
                return Ok((
                    Cow::Borrowed(data),
                    CompressionResult {
                        original_size: data.len(),
                        compressed_size: data.len(),
                        compressed: false,
                        algorithm: "identity".into(),
                    },
                ));
            }
            Compression::Lz4 { level } => {
                let level = adjusted_level(level, "lz4");
                (compress_lz4(data, level)?, format!("lz4:{level}"))
            }
            Compression::Zstd { level } => {
                let level = adjusted_level(level, "zstd");
                (compress_zstd(data, level)?, format!("zstd:{level}"))
            }
        };

        verify_integrity(*self, &compressed, data)?;

        let result = CompressionResult {
            original_size: data.len(),
            compressed_size: compressed.len(),
            compressed: true,
            algorithm,
        };
        if compressed.len() >= data.len() && !data.is_empty() {
            info!(
                original_len = data.len(),
                compressed_len = compressed.len(),
                "Compression ineffective for object"
            );
        }
        Ok((Cow::Owned(compressed), result))
    }

    #[instrument(skip(self, data), fields(algorithm = self.algorithm(), input_len = data.len()))]
    pub fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        match self {
            Compression::None => Ok(Cow::Borrowed(data)),
            Compression::Lz4 { .. } => decompress_lz4(data).map(Cow::Owned),
            Compression::Zstd { .. } => decompress_zstd(data).map(Cow::Owned),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => f.write_str("none"),
            Compression::Lz4 { level } => write!(f, "lz4:{level}"),
            Compression::Zstd { level } => write!(f, "zstd:{level}"),
        }
    }
}

impl FromStr for Compression {
    type Err = CompressionError;

    /// Accepts `none`, `lz4`, `zstd`, optionally followed by `:<level>`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (name, level) = match s.split_once(':') {
            Some((name, level)) => {
                let level = level.parse::<i32>().map_err(|_| {
                    CompressionError::invalid_codec(format!("bad level in {s:?}"))
                })?;
                (name, Some(level))
            }
            None => (s.as_str(), None),
        };

        match (name, level) {
            ("" | "none" | "uncompressed", None) => Ok(Compression::None),
            ("lz4", level) => Ok(Compression::Lz4 {
                level: level.unwrap_or(DEFAULT_LZ4_LEVEL),
            }),
            ("zstd" | "zst", level) => Ok(Compression::Zstd {
                level: level.unwrap_or(DEFAULT_ZSTD_LEVEL),
            }),
            _ => Err(CompressionError::invalid_codec(format!(
                "unsupported codec {s:?}"
            ))),
        }
    }
}

impl TryFrom<String> for Compression {
    type Error = CompressionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Compression> for String {
    fn from(value: Compression) -> Self {
        value.to_string()
    }
}

/// Compress data using LZ4
#[instrument(skip(data), fields(algorithm = "lz4", level, input_len = data.len()))]
fn compress_lz4(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut encoder = lz4::EncoderBuilder::new()
        .level(level as u32)
        .build(Vec::new())
        .map_err(|err| CompressionError::codec("lz4", err.to_string()))?;

    encoder
        .write_all(data)
        .map_err(|err| CompressionError::io("lz4", err))?;
    let (compressed, result) = encoder.finish();
    result.map_err(|err| CompressionError::codec("lz4", err.to_string()))?;

    debug!(
        compressed_len = compressed.len(),
        "lz4 compression complete"
    );
    Ok(compressed)
}

/// Decompress LZ4 data
#[instrument(skip(data), fields(algorithm = "lz4", input_len = data.len()))]
pub fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder =
        lz4::Decoder::new(data).map_err(|err| CompressionError::codec("lz4", err.to_string()))?;
    let mut decompressed = Vec::new();
    std::io::copy(&mut decoder, &mut decompressed)
        .map_err(|err| CompressionError::io("lz4", err))?;
    Ok(decompressed)
}

/// Compress data using Zstd
#[instrument(skip(data), fields(algorithm = "zstd", level, input_len = data.len()))]
fn compress_zstd(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let compressed = zstd::encode_all(data, level)
        .map_err(|err| CompressionError::codec("zstd", err.to_string()))?;
    Ok(compressed)
}

/// Decompress Zstd data
#[instrument(skip(data), fields(algorithm = "zstd", input_len = data.len()))]
pub fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    let decompressed =
        zstd::decode_all(data).map_err(|err| CompressionError::codec("zstd", err.to_string()))?;
    Ok(decompressed)
}

/// Clamp a level into the range the codec supports
fn adjusted_level(level: i32, algorithm: &'static str) -> i32 {
    let clamped = match algorithm {
        "lz4" => level.clamp(1, 16),
        "zstd" => level.clamp(-5, 22),
        _ => level,
    };

    if clamped != level {
        warn!(
            original_level = level,
            clamped_level = clamped,
            algorithm,
            "Compression level clamped to supported range"
        );
    }

    clamped
}

/// Decode `compressed` and compare it with the original input.
fn verify_integrity(codec: Compression, compressed: &[u8], original: &[u8]) -> Result<()> {
    let decompressed = codec.decompress(compressed)?;
    if !constant_time_equal(&decompressed, original) {
        return Err(CompressionError::integrity(codec.algorithm()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_roundtrip_lz4() {
        let original = b"name,age\nada,36\n".repeat(500);
        let codec = Compression::lz4();

        let (compressed, result) = codec.compress(&original).unwrap();
        assert!(result.compressed);
        assert!(result.ratio() > 1.0);

        let decompressed = codec.decompress(compressed.as_ref()).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_ref());
    }

    #[test]
    fn test_roundtrip_zstd() {
        let original = b"name,age\ngrace,45\n".repeat(500);
        let codec: Compression = "zstd:6".parse().unwrap();

        let (compressed, result) = codec.compress(&original).unwrap();
        assert_eq!(result.algorithm, "zstd:6");

        let decompressed = decompress_zstd(compressed.as_ref()).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn test_none_borrows_input() {
        let data = b"untouched";
        let (view, result) = Compression::None.compress(data).unwrap();
        assert!(matches!(view, Cow::Borrowed(_)));
        assert!(!result.compressed);
        assert!(matches!(
            Compression::None.decompress(data).unwrap(),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn test_empty_object_round_trips() {
        for codec in [Compression::lz4(), Compression::zstd()] {
            let (compressed, _) = codec.compress(b"").unwrap();
            assert!(codec.decompress(&compressed).unwrap().is_empty());
        }
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert_eq!("LZ4".parse::<Compression>().unwrap(), Compression::lz4());
        assert_eq!(
            "zstd:9".parse::<Compression>().unwrap(),
            Compression::Zstd { level: 9 }
        );
        assert_eq!(Compression::Lz4 { level: 2 }.to_string(), "lz4:2");
        assert!("gzip".parse::<Compression>().is_err());
        assert!("lz4:fast".parse::<Compression>().is_err());
        assert!("none:3".parse::<Compression>().is_err());
    }

    #[test]
    fn test_detect_from_path() {
        assert_eq!(
            Compression::detect(Path::new("out/part-00000.csv.zst")),
            Compression::zstd()
        );
        assert_eq!(
            Compression::detect(Path::new("out/part-00000.csv.lz4")),
            Compression::lz4()
        );
        assert_eq!(
            Compression::detect(Path::new("out/part-00000.csv")),
            Compression::None
        );
        assert_eq!(Compression::zstd().extension(), Some("zst"));
        assert_eq!(Compression::None.extension(), None);
    }

    #[test]
    fn test_verify_integrity_detects_tampering() {
        let payload = b"Tamper detection payload".repeat(256);
        let compressed = compress_lz4(payload.as_slice(), 4).unwrap();
        let mut altered = payload.clone();
        altered[0] ^= 0xAA;

        let error = verify_integrity(Compression::lz4(), &compressed, &altered).unwrap_err();
        assert!(matches!(
            error,
            CompressionError::IntegrityFailure { algorithm: "lz4" }
        ));
    }

    #[test]
    fn test_corrupt_input_is_codec_error() {
        let err = Compression::zstd().decompress(b"not a zstd frame").unwrap_err();
        assert!(matches!(err, CompressionError::Codec { algorithm: "zstd", .. }));
    }

    #[traced_test]
    #[test]
    fn test_level_clamp_emits_tracing() {
        let data = b"clamp me ".repeat(64);
        let (_view, result) = Compression::Lz4 { level: 99 }.compress(&data).unwrap();
        assert_eq!(result.algorithm, "lz4:16");
        assert!(logs_contain("Compression level clamped to supported range"));
    }

    #[test]
    fn test_string_conversion() {
        let text = String::from(Compression::Zstd { level: 5 });
        assert_eq!(text, "zstd:5");
        assert_eq!(
            Compression::try_from(text).unwrap(),
            Compression::Zstd { level: 5 }
        );
    }
}
