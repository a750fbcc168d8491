//! Domain error taxonomy shared by every backup operation.
//!
//! Each variant carries a stable `code()` that callers map to transport
//! status codes, and a `message_key()` for localized messages.

use crate::crypto::CryptoError;
use crate::payload::ExtractError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup not found")]
    NotFound,

    #[error("Another backup or restore operation is in progress")]
    Concurrent,

    #[error("Maintenance mode is active")]
    MaintenanceActive,

    #[error("Backup is not ready")]
    NotReady,

    #[error("Backup file is missing from storage")]
    FileMissing,

    #[error("Backup file cannot be opened: {0}")]
    CannotOpenFile(#[source] std::io::Error),

    #[error("Backup file is in use by an open download")]
    FileBusy,

    #[error("Backup storage is unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Upload exceeds the limit of {limit} bytes")]
    UploadTooLarge { limit: u64 },

    #[error("Invalid backup format: {0}")]
    InvalidFormat(String),

    #[error("Encryption key is invalid")]
    InvalidEncKey,

    #[error("Backup could not be decrypted")]
    DecryptFailed,

    #[error("Imported backup failed checksum verification: {0}")]
    ChecksumImport(String),

    #[error("Checksum verification failed: {0}")]
    ChecksumMismatch(String),

    #[error("Backup is not compatible with this system: {0}")]
    Incompatible(String),

    #[error("Invalid backup plan: {0}")]
    InvalidPlan(String),

    #[error("Database dump failed: {0}")]
    PgDumpFailed(String),

    #[error("Database restore failed: {0}")]
    PgRestoreFailed(String),

    #[error("Migrations failed: {0}")]
    MigrationFailed(String),

    #[error("Operation exceeded its deadline")]
    Timeout,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    /// Stable machine-readable code, persisted on failed runs.
    pub fn code(&self) -> &'static str {
        match self {
            BackupError::NotFound => "not_found",
            BackupError::Concurrent => "concurrent",
            BackupError::MaintenanceActive => "maintenance_active",
            BackupError::NotReady => "not_ready",
            BackupError::FileMissing => "file_missing",
            BackupError::CannotOpenFile(_) => "cannot_open_file",
            BackupError::FileBusy => "file_busy",
            BackupError::StorageUnavailable(_) => "storage_unavailable",
            BackupError::UploadTooLarge { .. } => "upload_too_large",
            BackupError::InvalidFormat(_) => "invalid_format",
            BackupError::InvalidEncKey => "invalid_enc_key",
            BackupError::DecryptFailed => "decrypt_failed",
            BackupError::ChecksumImport(_) => "checksum_import",
            BackupError::ChecksumMismatch(_) => "checksum_mismatch",
            BackupError::Incompatible(_) => "incompatible",
            BackupError::InvalidPlan(_) => "invalid_plan",
            BackupError::PgDumpFailed(_) => "pg_dump_failed",
            BackupError::PgRestoreFailed(_) => "pg_restore_failed",
            BackupError::MigrationFailed(_) => "migration_failed",
            BackupError::Timeout => "timeout",
            BackupError::Internal(_) => "internal",
        }
    }

    /// Localization key for user-facing messages.
    pub fn message_key(&self) -> String {
        format!("backup.error.{}", self.code())
    }

    pub(crate) fn internal(msg: impl std::fmt::Display) -> Self {
        BackupError::Internal(anyhow::anyhow!("{msg}"))
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::Internal(err.into())
    }
}

impl From<CryptoError> for BackupError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKey => BackupError::InvalidEncKey,
            CryptoError::Authentication { .. } => BackupError::DecryptFailed,
            CryptoError::Io(e) => BackupError::Internal(e.into()),
            CryptoError::Encrypt => BackupError::internal(err),
            other => BackupError::InvalidFormat(other.to_string()),
        }
    }
}

impl From<ExtractError> for BackupError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Io(e) => BackupError::Internal(e.into()),
            other => BackupError::InvalidFormat(other.to_string()),
        }
    }
}
