use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use encryption::{
    load_data_key, ByteSource, CryptoMode, DataKey, EncryptionError, KeyManagementService,
    KmsConfig, ObjectHeader, StreamDecryptor, StreamEncryptor,
};
use tracing::{info, instrument};

use crate::dataset::Dataset;
use crate::error::Result;
use crate::lines::TextFile;
use crate::read::DataReader;
use crate::write::DataWriter;

/// Entry point for encrypted dataset I/O.
///
/// Built once per job: the KMS is consulted and the data key unwrapped at
/// construction. Clones share the key.
#[derive(Clone)]
pub struct CryptoContext {
    kms: Option<Arc<dyn KeyManagementService>>,
    config: Option<Arc<KmsConfig>>,
    data_key: Option<Arc<DataKey>>,
}

impl CryptoContext {
    /// Build the configured KMS and unwrap the data key from the key files
    /// named in `config`.
    #[instrument(skip(config), fields(kms = %config.kind()))]
    pub fn new(config: KmsConfig) -> Result<Self> {
        let kms = config.build_service()?;
        Self::with_kms(kms, config)
    }

    /// Use an externally provided KMS; `config` supplies the key file paths.
    #[instrument(skip_all, fields(kms = %kms.kind()))]
    pub fn with_kms(kms: Arc<dyn KeyManagementService>, config: KmsConfig) -> Result<Self> {
        let data_key = load_data_key(
            kms.as_ref(),
            config.primary_key_path(),
            config.data_key_path(),
        )?;
        info!(
            data_key_path = %config.data_key_path().display(),
            "crypto context ready"
        );
        Ok(Self {
            kms: Some(kms),
            config: Some(Arc::new(config)),
            data_key: Some(Arc::new(data_key)),
        })
    }

    /// Context without key material; only `PlainText` I/O succeeds.
    pub fn plain() -> Self {
        Self {
            kms: None,
            config: None,
            data_key: None,
        }
    }

    pub fn kms(&self) -> Option<&Arc<dyn KeyManagementService>> {
        self.kms.as_ref()
    }

    pub fn config(&self) -> Option<&KmsConfig> {
        self.config.as_deref()
    }

    pub fn has_data_key(&self) -> bool {
        self.data_key.is_some()
    }

    /// Key needed for `mode`: `None` for `PlainText`, an error when an
    /// encrypted mode is requested from a plain context.
    pub(crate) fn key_for(&self, mode: CryptoMode) -> Result<Option<Arc<DataKey>>> {
        if !mode.is_encrypted() {
            return Ok(None);
        }
        match &self.data_key {
            Some(key) => Ok(Some(Arc::clone(key))),
            None => Err(EncryptionError::InvalidConfiguration(format!(
                "{mode} needs a data key but the context has no KMS configuration"
            ))
            .into()),
        }
    }

    pub fn read(&self, mode: CryptoMode) -> DataReader {
        DataReader::new(self.clone(), mode)
    }

    pub fn write<'a>(&self, dataset: &'a Dataset, mode: CryptoMode) -> DataWriter<'a> {
        DataWriter::new(self.clone(), dataset, mode)
    }

    /// Line reader over a file or a directory of part files
    pub fn read_lines(&self, path: impl Into<PathBuf>, mode: CryptoMode) -> Result<TextFile> {
        Ok(TextFile::new(path.into(), mode, self.key_for(mode)?))
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("kms", &self.kms.as_ref().map(|kms| kms.kind()))
            .field("config", &self.config)
            .field("data_key", &self.data_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub(crate) fn open_decryptor<S: ByteSource>(
    source: S,
    mode: CryptoMode,
    data_key: Option<&DataKey>,
) -> Result<StreamDecryptor<S>> {
    match (mode.is_encrypted(), data_key) {
        (false, _) => Ok(StreamDecryptor::unencrypted(source)),
        (true, Some(key)) => Ok(StreamDecryptor::new(source, mode, key)?),
        (true, None) => Err(missing_key(mode)),
    }
}

pub(crate) fn open_encryptor<W: Write>(
    writer: W,
    mode: CryptoMode,
    data_key: Option<&DataKey>,
    header: ObjectHeader,
) -> Result<StreamEncryptor<W>> {
    match (mode.is_encrypted(), data_key) {
        (false, _) => Ok(StreamEncryptor::unencrypted(writer)),
        (true, Some(key)) => Ok(StreamEncryptor::new(writer, mode, key, header)?),
        (true, None) => Err(missing_key(mode)),
    }
}

fn missing_key(mode: CryptoMode) -> crate::error::DatasetError {
    EncryptionError::InvalidConfiguration(format!("no data key available for {mode}")).into()
}
