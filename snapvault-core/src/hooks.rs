//! Host callbacks used by a real restore.

use crate::error::BackupError;
use async_trait::async_trait;

#[async_trait]
pub trait SystemHooks: Send + Sync {
    /// Pause background work that touches the database.
    async fn stop_background_jobs(&self) -> Result<(), BackupError>;

    async fn resume_background_jobs(&self) -> Result<(), BackupError>;

    /// Bring the restored schema up to the live version.
    async fn run_migrations(&self) -> Result<(), BackupError>;
}

/// Hooks for hosts without background jobs or migrations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl SystemHooks for NoopHooks {
    async fn stop_background_jobs(&self) -> Result<(), BackupError> {
        Ok(())
    }

    async fn resume_background_jobs(&self) -> Result<(), BackupError> {
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), BackupError> {
        Ok(())
    }
}
