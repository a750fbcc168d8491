use async_trait::async_trait;
use snapvault_core::dump::run_command;
use snapvault_core::hooks::SystemHooks;
use snapvault_core::BackupError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;

/// Shared flag checked by every scheduler tick.
#[derive(Debug, Clone, Default)]
pub struct PauseFlag(Arc<AtomicBool>);

impl PauseFlag {
    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, paused: bool) {
        self.0.store(paused, Ordering::SeqCst);
    }
}

/// Restore hooks for this process: pause our own cron ticks and run the
/// configured migration command.
#[derive(Debug, Clone)]
pub struct ServerHooks {
    pause: PauseFlag,
    migrate_command: Option<String>,
}

impl ServerHooks {
    pub fn new(pause: PauseFlag, migrate_command: Option<String>) -> Self {
        Self { pause, migrate_command }
    }
}

#[async_trait]
impl SystemHooks for ServerHooks {
    async fn stop_background_jobs(&self) -> Result<(), BackupError> {
        self.pause.set(true);
        tracing::info!("Background jobs paused");
        Ok(())
    }

    async fn resume_background_jobs(&self) -> Result<(), BackupError> {
        self.pause.set(false);
        tracing::info!("Background jobs resumed");
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), BackupError> {
        let Some(command) = &self.migrate_command else {
            tracing::warn!("Restored schema is older but no MIGRATE_COMMAND is configured");
            return Ok(());
        };

        tracing::info!("Running migrations");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_command(cmd).await.map_err(BackupError::MigrationFailed)?;
        tracing::info!("Migrations finished");
        Ok(())
    }
}
