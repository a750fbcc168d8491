//! Snapvault backup engine.
//!
//! Produces encrypted, checksum-verified snapshots of the service database,
//! accepts imported snapshots, restores them (including dry runs), and keeps a
//! recurring schedule with retention. At most one backup-or-restore pipeline
//! runs at a time.

pub mod config;
pub mod crypto;
pub mod dump;
pub mod error;
pub mod hooks;
pub mod models;
pub mod payload;
pub mod repository;
pub mod schedule;
pub mod service;

// Re-export commonly used types
pub use config::BackupConfig;
pub use error::BackupError;
pub use repository::BackupRepository;
pub use service::BackupService;
pub type Result<T> = std::result::Result<T, BackupError>;
