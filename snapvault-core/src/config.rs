//! Engine configuration, loaded from the environment.

use crate::crypto::container::MAX_CHUNK_SIZE;
use crate::crypto::{EncryptionKey, DEFAULT_CHUNK_SIZE};
use crate::error::BackupError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024 * 1024;
pub const MIN_CHUNK_SIZE: u32 = 4 * 1024;
pub const MAX_RESTORE_TEST_INTERVAL_DAYS: i64 = 3650;
pub const MAX_AUTO_DEADLINE_MINUTES: i64 = 24 * 60;

/// Raw key material from configuration. Wiped on drop, never printed.
#[derive(Clone)]
pub struct KeyMaterial(Zeroizing<String>);

impl KeyMaterial {
    pub fn new(material: impl Into<String>) -> Self {
        Self(Zeroizing::new(material.into()))
    }

    pub fn derive(&self) -> Result<EncryptionKey, BackupError> {
        Ok(EncryptionKey::derive(self.0.as_bytes())?)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Directory holding finished containers. Temp files live here too so
    /// the final rename stays on one filesystem.
    pub storage_dir: PathBuf,
    pub encryption_key: Option<KeyMaterial>,
    pub max_upload_bytes: u64,
    pub chunk_size: u32,
    pub db_engine: String,
    /// Live database schema version, compared against restored manifests.
    pub schema_version: i64,
    pub app_version: String,
    pub restore_test_interval_days: i64,
    pub auto_deadline: Duration,
    /// After a failed scheduled backup, ticks wait this long before trying
    /// again. Zero retries on every tick.
    pub auto_retry_backoff: Duration,
}

impl BackupConfig {
    /// Defaults for everything except the storage directory.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            encryption_key: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            db_engine: "postgres".into(),
            schema_version: 0,
            app_version: env!("CARGO_PKG_VERSION").into(),
            restore_test_interval_days: 7,
            auto_deadline: Duration::from_secs(30 * 60),
            auto_retry_backoff: Duration::from_secs(30 * 60),
        }
    }

    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unparseable values fall back
    /// to the defaults.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<i64>().ok());

        let mut config = Self::new(
            lookup("BACKUP_STORAGE_DIR").unwrap_or_else(|| "./data/backups".into()),
        );
        config.encryption_key = lookup("BACKUP_ENCRYPTION_KEY")
            .filter(|v| !v.trim().is_empty())
            .map(KeyMaterial::new);
        if let Some(max) = parsed("BACKUP_MAX_UPLOAD_BYTES").filter(|v| *v > 0) {
            config.max_upload_bytes = max as u64;
        }
        if let Some(size) = parsed("BACKUP_CHUNK_SIZE") {
            config.chunk_size = size.clamp(i64::from(MIN_CHUNK_SIZE), i64::from(MAX_CHUNK_SIZE)) as u32;
        }
        if let Some(engine) = lookup("BACKUP_DB_ENGINE").filter(|v| !v.trim().is_empty()) {
            config.db_engine = engine.trim().to_string();
        }
        if let Some(version) = parsed("BACKUP_SCHEMA_VERSION") {
            config.schema_version = version;
        }
        if let Some(days) = parsed("BACKUP_RESTORE_TEST_INTERVAL_DAYS") {
            config.restore_test_interval_days = days.clamp(1, MAX_RESTORE_TEST_INTERVAL_DAYS);
        }
        if let Some(minutes) = parsed("BACKUP_AUTO_DEADLINE_MINUTES") {
            let minutes = minutes.clamp(1, MAX_AUTO_DEADLINE_MINUTES) as u64;
            config.auto_deadline = Duration::from_secs(minutes * 60);
        }
        if let Some(minutes) = parsed("BACKUP_AUTO_RETRY_MINUTES") {
            let minutes = minutes.clamp(0, MAX_AUTO_DEADLINE_MINUTES) as u64;
            config.auto_retry_backoff = Duration::from_secs(minutes * 60);
        }
        config
    }

    pub fn with_key(mut self, material: impl Into<String>) -> Self {
        self.encryption_key = Some(KeyMaterial::new(material));
        self
    }

    /// Restore-test interval in days, kept within a representable range
    /// even when the field was set directly.
    pub fn restore_test_interval(&self) -> chrono::Duration {
        chrono::Duration::days(self.restore_test_interval_days.clamp(1, MAX_RESTORE_TEST_INTERVAL_DAYS))
    }

    /// Derive the container key. Missing or short material is `InvalidEncKey`.
    pub fn key(&self) -> Result<EncryptionKey, BackupError> {
        self.encryption_key
            .as_ref()
            .ok_or(BackupError::InvalidEncKey)?
            .derive()
    }
}
