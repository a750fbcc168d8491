//! Durable storage port for artifacts, runs, the plan and maintenance state.
//!
//! Implementations are synchronous; the service calls them from blocking
//! tasks.

pub mod memory;

pub use memory::MemoryRepository;

use crate::models::{BackupArtifact, BackupPlan, BackupRun, MaintenanceState, RestoreRun};
use anyhow::Result;

pub trait BackupRepository: Send + Sync {
    fn create_artifact(&self, artifact: &BackupArtifact) -> Result<()>;
    fn update_artifact(&self, artifact: &BackupArtifact) -> Result<()>;
    fn get_artifact(&self, id: &str) -> Result<Option<BackupArtifact>>;
    /// Newest first.
    fn list_artifacts(&self) -> Result<Vec<BackupArtifact>>;
    /// Returns whether a row was removed.
    fn delete_artifact(&self, id: &str) -> Result<bool>;
    /// Most recently created artifact with status `success`.
    fn latest_successful_artifact(&self) -> Result<Option<BackupArtifact>>;

    fn create_backup_run(&self, run: &BackupRun) -> Result<()>;
    fn update_backup_run(&self, run: &BackupRun) -> Result<()>;
    /// Newest first.
    fn list_backup_runs(&self, limit: usize) -> Result<Vec<BackupRun>>;

    fn create_restore_run(&self, run: &RestoreRun) -> Result<()>;
    fn update_restore_run(&self, run: &RestoreRun) -> Result<()>;
    fn get_restore_run(&self, id: &str) -> Result<Option<RestoreRun>>;
    /// Newest first.
    fn list_restore_runs(&self, limit: usize) -> Result<Vec<RestoreRun>>;
    /// Most recent dry run in a terminal state.
    fn latest_finished_dry_run(&self) -> Result<Option<RestoreRun>>;

    /// The singleton plan; implementations create the default row.
    fn get_plan(&self) -> Result<BackupPlan>;
    fn save_plan(&self, plan: &BackupPlan) -> Result<()>;

    fn get_maintenance(&self) -> Result<MaintenanceState>;
    fn set_maintenance(&self, state: &MaintenanceState) -> Result<()>;

    /// Any backup run or artifact still queued or running.
    fn has_running_backup(&self) -> Result<bool>;
    /// Any restore run still queued or running.
    fn has_running_restore(&self) -> Result<bool>;

    /// Crash recovery: every queued/running artifact, backup run, restore run
    /// and restore step becomes failed with `code`. Returns the number of
    /// rows changed.
    fn reset_running_operations(&self, code: &str, message: &str) -> Result<usize>;
}
