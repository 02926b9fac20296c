//! KMS configuration
//!
//! Recognised keys, usable from a string map (e.g. CLI `--conf key=value`
//! pairs), from `SEAL_*` environment variables or as serialized JSON:
//!
//! | key                   | env                   | used by |
//! |-----------------------|-----------------------|---------|
//! | `kms_type`            | `SEAL_KMS_TYPE`       | all     |
//! | `simple_app_id`       | `SEAL_APP_ID`         | simple (optional for local) |
//! | `simple_app_key`      | `SEAL_APP_KEY`        | simple  |
//! | `primary_key_path`    | `SEAL_PRIMARY_KEY_PATH` | all   |
//! | `data_key_path`       | `SEAL_DATA_KEY_PATH`  | all     |
//! | `local_keystore_path` | `SEAL_KEYSTORE_PATH`  | local   |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    KeyManagementService, KmsKind, LocalKeyManagementService, SimpleKeyManagementService,
};
use crate::error::{EncryptionError, Result};

pub const KMS_TYPE: &str = "kms_type";
pub const SIMPLE_APP_ID: &str = "simple_app_id";
pub const SIMPLE_APP_KEY: &str = "simple_app_key";
pub const PRIMARY_KEY_PATH: &str = "primary_key_path";
pub const DATA_KEY_PATH: &str = "data_key_path";
pub const LOCAL_KEYSTORE_PATH: &str = "local_keystore_path";

const ENV_VARS: [(&str, &str); 6] = [
    (KMS_TYPE, "SEAL_KMS_TYPE"),
    (SIMPLE_APP_ID, "SEAL_APP_ID"),
    (SIMPLE_APP_KEY, "SEAL_APP_KEY"),
    (PRIMARY_KEY_PATH, "SEAL_PRIMARY_KEY_PATH"),
    (DATA_KEY_PATH, "SEAL_DATA_KEY_PATH"),
    (LOCAL_KEYSTORE_PATH, "SEAL_KEYSTORE_PATH"),
];

/// Application id recorded by the local KMS when none is configured
const DEFAULT_LOCAL_APP_ID: &str = "local";

/// Which KMS to talk to and where the key blobs live
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmsConfig {
    #[serde(rename = "kms_type")]
    kind: KmsKind,
    #[serde(rename = "simple_app_id", default, skip_serializing_if = "Option::is_none")]
    app_id: Option<String>,
    #[serde(rename = "simple_app_key", default, skip_serializing_if = "Option::is_none")]
    app_secret: Option<String>,
    primary_key_path: PathBuf,
    data_key_path: PathBuf,
    #[serde(
        rename = "local_keystore_path",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    keystore_path: Option<PathBuf>,
}

impl KmsConfig {
    pub fn simple(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        primary_key_path: impl Into<PathBuf>,
        data_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: KmsKind::Simple,
            app_id: Some(app_id.into()),
            app_secret: Some(app_secret.into()),
            primary_key_path: primary_key_path.into(),
            data_key_path: data_key_path.into(),
            keystore_path: None,
        }
    }

    pub fn local(
        keystore_path: impl Into<PathBuf>,
        primary_key_path: impl Into<PathBuf>,
        data_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: KmsKind::Local,
            app_id: None,
            app_secret: None,
            primary_key_path: primary_key_path.into(),
            data_key_path: data_key_path.into(),
            keystore_path: Some(keystore_path.into()),
        }
    }

    /// Build from string pairs. Keys are matched case-insensitively; unknown
    /// keys are ignored so a shared options map can be passed through.
    pub fn from_map<I, K, V>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let map: HashMap<String, String> = entries
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.as_ref().to_string()))
            .collect();

        let required = |key: &str| -> Result<String> {
            map.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| EncryptionError::InvalidConfiguration(format!("missing `{key}`")))
        };

        let config = Self {
            kind: required(KMS_TYPE)?.parse()?,
            app_id: map.get(SIMPLE_APP_ID).cloned(),
            app_secret: map.get(SIMPLE_APP_KEY).cloned(),
            primary_key_path: required(PRIMARY_KEY_PATH)?.into(),
            data_key_path: required(DATA_KEY_PATH)?.into(),
            keystore_path: map.get(LOCAL_KEYSTORE_PATH).map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    /// Build from `SEAL_*` environment variables
    pub fn from_env() -> Result<Self> {
        let entries = ENV_VARS
            .iter()
            .filter_map(|(key, var)| std::env::var(var).ok().map(|value| (*key, value)));
        Self::from_map(entries)
    }

    /// Parse a serialized config and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Every variant needs both key paths; the rest depends on the kind.
    pub fn validate(&self) -> Result<()> {
        if self.primary_key_path.as_os_str().is_empty() {
            return Err(EncryptionError::InvalidConfiguration(format!(
                "missing `{PRIMARY_KEY_PATH}`"
            )));
        }
        if self.data_key_path.as_os_str().is_empty() {
            return Err(EncryptionError::InvalidConfiguration(format!(
                "missing `{DATA_KEY_PATH}`"
            )));
        }
        match self.kind {
            KmsKind::Simple => {
                if self.app_id.as_deref().map_or(true, str::is_empty) {
                    return Err(EncryptionError::InvalidConfiguration(format!(
                        "{} requires `{SIMPLE_APP_ID}`",
                        self.kind
                    )));
                }
                if self.app_secret.as_deref().map_or(true, str::is_empty) {
                    return Err(EncryptionError::InvalidConfiguration(format!(
                        "{} requires `{SIMPLE_APP_KEY}`",
                        self.kind
                    )));
                }
            }
            KmsKind::Local => {
                if self.keystore_path.is_none() {
                    return Err(EncryptionError::InvalidConfiguration(format!(
                        "{} requires `{LOCAL_KEYSTORE_PATH}`",
                        self.kind
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> KmsKind {
        self.kind
    }

    /// Application identity passed to `generate_primary_key`
    pub fn app_id(&self) -> &str {
        self.app_id.as_deref().unwrap_or(DEFAULT_LOCAL_APP_ID)
    }

    pub fn primary_key_path(&self) -> &Path {
        &self.primary_key_path
    }

    pub fn data_key_path(&self) -> &Path {
        &self.data_key_path
    }

    pub fn keystore_path(&self) -> Option<&Path> {
        self.keystore_path.as_deref()
    }

    /// Instantiate the configured KMS variant
    pub fn build_service(&self) -> Result<Arc<dyn KeyManagementService>> {
        self.validate()?;
        match self.kind {
            KmsKind::Simple => {
                let service = SimpleKeyManagementService::new(
                    self.app_id.clone().unwrap_or_default(),
                    self.app_secret.clone().unwrap_or_default(),
                )?;
                Ok(Arc::new(service))
            }
            KmsKind::Local => {
                let keystore = self.keystore_path.clone().ok_or_else(|| {
                    EncryptionError::InvalidConfiguration(format!(
                        "missing `{LOCAL_KEYSTORE_PATH}`"
                    ))
                })?;
                Ok(Arc::new(LocalKeyManagementService::open(keystore)))
            }
        }
    }
}

impl std::fmt::Debug for KmsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsConfig")
            .field("kind", &self.kind)
            .field("app_id", &self.app_id)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "[REDACTED]"))
            .field("primary_key_path", &self.primary_key_path)
            .field("data_key_path", &self.data_key_path)
            .field("keystore_path", &self.keystore_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn simple_entries() -> Vec<(&'static str, &'static str)> {
        vec![
            ("kms_type", "SimpleKeyManagementService"),
            ("simple_app_id", "app-1"),
            ("simple_app_key", "secret-1"),
            ("primary_key_path", "/keys/primary"),
            ("data_key_path", "/keys/data"),
        ]
    }

    #[test]
    fn test_from_map_simple() {
        let config = KmsConfig::from_map(simple_entries()).unwrap();
        assert_eq!(config.kind(), KmsKind::Simple);
        assert_eq!(config.app_id(), "app-1");
        assert_eq!(config.primary_key_path(), Path::new("/keys/primary"));
        assert_eq!(config.build_service().unwrap().kind(), KmsKind::Simple);
    }

    #[test]
    fn test_from_map_keys_case_insensitive() {
        let entries = simple_entries()
            .into_iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v));
        assert!(KmsConfig::from_map(entries).is_ok());
    }

    #[test]
    fn test_from_map_missing_secret() {
        let entries = simple_entries()
            .into_iter()
            .filter(|(k, _)| *k != SIMPLE_APP_KEY);
        let err = KmsConfig::from_map(entries).unwrap_err();
        assert!(matches!(err, EncryptionError::InvalidConfiguration(ref m) if m.contains(SIMPLE_APP_KEY)));
    }

    #[test]
    fn test_from_map_local_requires_keystore() {
        let entries = vec![
            ("kms_type", "local"),
            ("primary_key_path", "p"),
            ("data_key_path", "d"),
        ];
        assert!(KmsConfig::from_map(entries.clone()).is_err());

        let mut entries = entries;
        entries.push(("local_keystore_path", "/tmp/ks"));
        let config = KmsConfig::from_map(entries).unwrap();
        assert_eq!(config.app_id(), DEFAULT_LOCAL_APP_ID);
        assert_eq!(config.build_service().unwrap().kind(), KmsKind::Local);
    }

    #[test]
    fn test_unknown_kms_type() {
        let mut entries = simple_entries();
        entries[0] = ("kms_type", "AzureKeyManagementService");
        assert!(matches!(
            KmsConfig::from_map(entries),
            Err(EncryptionError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let config = KmsConfig::simple("app", "secret", "p", "d");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"kms_type\":\"SimpleKeyManagementService\""));
        assert_eq!(KmsConfig::from_json(&json).unwrap(), config);

        let invalid = r#"{"kms_type":"SimpleKeyManagementService","primary_key_path":"p","data_key_path":"d"}"#;
        assert!(KmsConfig::from_json(invalid).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = KmsConfig::simple("app", "hunter2", "p", "d");
        let debug_str = format!("{:?}", config);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    fn with_env<F: FnOnce()>(vars: &[(&str, Option<&str>)], f: F) {
        let saved: Vec<(String, Option<String>)> = ENV_VARS
            .iter()
            .map(|(_, var)| (var.to_string(), std::env::var(var).ok()))
            .collect();
        for (_, var) in ENV_VARS {
            std::env::remove_var(var);
        }
        for (var, value) in vars {
            if let Some(value) = value {
                std::env::set_var(var, value);
            }
        }

        f();

        for (var, value) in saved {
            match value {
                Some(v) => std::env::set_var(&var, v),
                None => std::env::remove_var(&var),
            }
        }
    }

    #[test]
    #[serial]
    fn test_from_env_valid() {
        with_env(
            &[
                ("SEAL_KMS_TYPE", Some("simple")),
                ("SEAL_APP_ID", Some("env-app")),
                ("SEAL_APP_KEY", Some("env-secret")),
                ("SEAL_PRIMARY_KEY_PATH", Some("/p")),
                ("SEAL_DATA_KEY_PATH", Some("/d")),
            ],
            || {
                let config = KmsConfig::from_env().unwrap();
                assert_eq!(config.app_id(), "env-app");
                assert_eq!(config.data_key_path(), Path::new("/d"));
            },
        );
    }

    #[test]
    #[serial]
    fn test_from_env_missing() {
        with_env(&[], || {
            assert!(matches!(
                KmsConfig::from_env(),
                Err(EncryptionError::InvalidConfiguration(_))
            ));
        });
    }
}
