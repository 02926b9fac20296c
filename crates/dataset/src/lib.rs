//! # Encrypted Partitioned Datasets
//!
//! Reads and writes tabular datasets as directories of `part-NNNNN` objects,
//! each independently encrypted under the job's data key, and reads them
//! back as parallel splits.
//!
//! ## Features
//!
//! - **One context per job**: [`CryptoContext`] unwraps the data key once
//!   and hands it to every reader and writer it creates
//! - **Formats**: delimited text (CSV, tab separated), raw text lines and a
//!   self-describing columnar format, plus any [`FormatCodec`]
//! - **Split reads**: `minPartitions` byte ranges per object, owned at
//!   line granularity, for `plain_text` and `AES_GCM_CTR_V1`
//! - **Save modes**: overwrite, append, error-if-exists and ignore
//! - **Retry safe**: a [`WriteTask`] or [`ReadTask`] re-run yields the same
//!   bytes or rows
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use dataset::{CryptoContext, CryptoMode, KmsConfig, SaveMode};
//!
//! let config = KmsConfig::simple("app-id", "app-key", "keys/primary", "keys/data");
//! dataset::init_keys(&config)?;
//! let ctx = CryptoContext::new(config)?;
//!
//! let people = ctx
//!     .read(CryptoMode::AesCbcPkcs5Padding)
//!     .option("header", true)
//!     .csv("people.csv.cbc")
//!     .collect()?;
//!
//! ctx.write(&people, CryptoMode::AesGcmCtrV1)
//!     .mode(SaveMode::Overwrite)
//!     .option("header", true)
//!     .csv("out/people")
//!     .execute()?;
//! ```

pub mod context;
pub mod dataset;
pub mod error;
pub mod files;
pub mod format;
mod lines;
pub mod options;
mod planner;
pub mod read;
pub mod write;

pub use context::CryptoContext;
pub use dataset::{Dataset, PartitionData, Row};
pub use error::{DatasetError, Result};
pub use files::{decrypt_file, encrypt_file, init_keys, replace_keys};
pub use format::{ColumnarCodec, DelimitedCodec, FormatCodec, TextCodec};
pub use lines::{Lines, TextFile};
pub use options::Options;
pub use read::{assemble, DataReader, ReadPlan, ReadTask};
pub use write::{DataWriter, SaveMode, WritePlan, WriteSummary, WriteTask, WrittenPart};

pub use compression::Compression;
pub use encryption::{CryptoMode, EncryptSummary, KeyManagementService, KmsConfig, KmsKind};
