//! External database dump/restore tool port.

use crate::error::BackupError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Produces and consumes database dump files.
#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Write a full dump of the live database to `path`.
    async fn dump(&self, path: &Path) -> Result<(), BackupError>;

    /// Replace the live database contents with the dump at `path`.
    async fn restore(&self, path: &Path) -> Result<(), BackupError>;
}

/// `pg_dump` / `pg_restore` invoked as child processes.
pub struct PgTools {
    pub dump_bin: PathBuf,
    pub restore_bin: PathBuf,
    database_url: String,
}

impl PgTools {
    pub fn new(dump_bin: impl Into<PathBuf>, restore_bin: impl Into<PathBuf>, database_url: String) -> Self {
        Self {
            dump_bin: dump_bin.into(),
            restore_bin: restore_bin.into(),
            database_url,
        }
    }
}

impl std::fmt::Debug for PgTools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTools")
            .field("dump_bin", &self.dump_bin)
            .field("restore_bin", &self.restore_bin)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DumpTool for PgTools {
    async fn dump(&self, path: &Path) -> Result<(), BackupError> {
        let mut cmd = Command::new(&self.dump_bin);
        cmd.arg("--format=custom")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--file")
            .arg(path)
            .arg("--dbname")
            .arg(&self.database_url);

        debug!(bin = %self.dump_bin.display(), "Running database dump");
        run_command(cmd).await.map_err(BackupError::PgDumpFailed)?;
        info!(path = %path.display(), "Database dump written");
        Ok(())
    }

    async fn restore(&self, path: &Path) -> Result<(), BackupError> {
        let mut cmd = Command::new(&self.restore_bin);
        cmd.arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--single-transaction")
            .arg("--dbname")
            .arg(&self.database_url)
            .arg(path);

        debug!(bin = %self.restore_bin.display(), "Running database restore");
        run_command(cmd).await.map_err(BackupError::PgRestoreFailed)?;
        info!("Database restored from dump");
        Ok(())
    }
}

/// Runs to completion; on failure returns the exit status and the tail of
/// stderr. The command line is never part of the message.
pub async fn run_command(mut cmd: Command) -> Result<(), String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = cmd
        .output()
        .await
        .map_err(|e| format!("failed to start: {e}"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(format!("{} ({})", stderr_tail(&stderr), output.status))
}

fn stderr_tail(stderr: &str) -> String {
    const MAX_CHARS: usize = 512;
    let trimmed = stderr.trim();
    let skip = trimmed.chars().count().saturating_sub(MAX_CHARS);
    trimmed.chars().skip(skip).collect()
}
