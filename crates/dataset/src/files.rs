//! Single-file helpers: key provisioning and whole-file encrypt/decrypt

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use encryption::{
    init_key_files, replace_key_files, ByteRange, CryptoMode, EncryptSummary, FileSource,
    KeyManagementService, KmsConfig, ObjectHeader,
};
use tracing::{info, instrument, warn};

use crate::context::{open_decryptor, open_encryptor, CryptoContext};
use crate::error::{DatasetError, Result};

/// Generate the primary key and data key files named in `config` and
/// return the KMS that can unwrap them. Existing key files are an error.
#[instrument(skip(config), fields(kms = %config.kind(), app_id = config.app_id()))]
pub fn init_keys(config: &KmsConfig) -> Result<Arc<dyn KeyManagementService>> {
    provision_keys(config, false)
}

/// [`init_keys`] that replaces key files already present. Data sealed under
/// the old data key stays unreadable afterwards.
#[instrument(skip(config), fields(kms = %config.kind(), app_id = config.app_id()))]
pub fn replace_keys(config: &KmsConfig) -> Result<Arc<dyn KeyManagementService>> {
    provision_keys(config, true)
}

fn provision_keys(config: &KmsConfig, replace: bool) -> Result<Arc<dyn KeyManagementService>> {
    let kms = config.build_service()?;
    let (primary, data) = (config.primary_key_path(), config.data_key_path());
    if replace {
        replace_key_files(kms.as_ref(), config.app_id(), primary, data)?;
    } else {
        init_key_files(kms.as_ref(), config.app_id(), primary, data)?;
    }
    info!(
        primary_key_path = %config.primary_key_path().display(),
        data_key_path = %config.data_key_path().display(),
        "key files written"
    );
    Ok(kms)
}

/// Encrypt `input` into `output` as a single stream (id 0) under a fresh
/// object salt.
#[instrument(skip_all, fields(input = %input.as_ref().display(), output = %output.as_ref().display(), mode = %mode))]
pub fn encrypt_file(
    ctx: &CryptoContext,
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    mode: CryptoMode,
) -> Result<EncryptSummary> {
    let (input, output) = (input.as_ref(), output.as_ref());
    let data_key = ctx.key_for(mode)?;
    let mut reader = File::open(input)
        .map(BufReader::new)
        .map_err(|err| DatasetError::io(input, err))?;

    let summary = write_atomically(output, |file| {
        let mut encryptor = open_encryptor(
            BufWriter::new(file),
            mode,
            data_key.as_deref(),
            ObjectHeader::random(0),
        )?;
        io::copy(&mut reader, &mut encryptor).map_err(|err| DatasetError::io(input, err))?;
        let (writer, summary) = encryptor
            .finish()
            .map_err(|e| DatasetError::with_path(e, output))?;
        let file = writer
            .into_inner()
            .map_err(|err| DatasetError::io(output, err.into_error()))?;
        Ok((file, summary))
    })?;
    info!(
        plaintext_bytes = summary.plaintext_bytes,
        ciphertext_bytes = summary.ciphertext_bytes,
        "file encrypted"
    );
    Ok(summary)
}

/// Decrypt all of `input` into `output`; returns the plaintext length.
/// Nothing is left at `output` when verification fails.
#[instrument(skip_all, fields(input = %input.as_ref().display(), output = %output.as_ref().display(), mode = %mode))]
pub fn decrypt_file(
    ctx: &CryptoContext,
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    mode: CryptoMode,
) -> Result<u64> {
    let (input, output) = (input.as_ref(), output.as_ref());
    let data_key = ctx.key_for(mode)?;
    let source = FileSource::open(input).map_err(|e| DatasetError::with_path(e, input))?;
    let decryptor = open_decryptor(source, mode, data_key.as_deref())?;
    let range = ByteRange::full(decryptor.object_len());

    let written = write_atomically(output, |file| {
        let mut writer = BufWriter::new(file);
        let mut written = 0u64;
        for block in decryptor.blocks(range)? {
            let block = block.map_err(|e| DatasetError::with_path(e, input))?;
            writer
                .write_all(&block.data)
                .map_err(|err| DatasetError::io(output, err))?;
            written += block.data.len() as u64;
        }
        let file = writer
            .into_inner()
            .map_err(|err| DatasetError::io(output, err.into_error()))?;
        Ok((file, written))
    })?;
    info!(plaintext_bytes = written, "file decrypted");
    Ok(written)
}

/// Run `body` against a hidden temp file next to `path`, then sync and
/// rename it into place. The temp file is removed on failure.
fn write_atomically<T>(path: &Path, body: impl FnOnce(File) -> Result<(File, T)>) -> Result<T> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| DatasetError::io(parent, err))?;
    }
    let name = path
        .file_name()
        .ok_or_else(|| {
            DatasetError::io(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "output has no file name"),
            )
        })?
        .to_string_lossy();
    let temp = path.with_file_name(format!(".{name}.tmp"));
    let file = File::create(&temp).map_err(|err| DatasetError::io(&temp, err))?;

    let result = body(file).and_then(|(file, value)| {
        file.sync_all().map_err(|err| DatasetError::io(&temp, err))?;
        fs::rename(&temp, path).map_err(|err| DatasetError::io(path, err))?;
        Ok(value)
    });
    if result.is_err() {
        if let Err(err) = fs::remove_file(&temp) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(temp = %temp.display(), error = %err, "failed to remove temp file");
            }
        }
    }
    result
}
