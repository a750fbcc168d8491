//! Records persisted through the repository port.

pub mod artifact;
pub mod plan;
pub mod restore;
pub mod run;

pub use artifact::{ArtifactOrigin, BackupArtifact};
pub use plan::{BackupPlan, MaintenanceState, PlanUpdate, ScheduleType};
pub use restore::{RestoreRun, RestoreStep, StepRecord, Steps};
pub use run::{BackupRun, RunTrigger};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle shared by artifacts, runs and restore steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Running,
    Success,
    Failed,
    Canceled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Queued => "queued",
            OperationStatus::Running => "running",
            OperationStatus::Success => "success",
            OperationStatus::Failed => "failed",
            OperationStatus::Canceled => "canceled",
        }
    }

    /// Queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self, OperationStatus::Queued | OperationStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => OperationStatus::Queued,
            "running" => OperationStatus::Running,
            "success" => OperationStatus::Success,
            "failed" => OperationStatus::Failed,
            "canceled" => OperationStatus::Canceled,
            other => anyhow::bail!("Unknown status {other:?}"),
        })
    }
}

/// Code and message recorded on failed rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub code: String,
    pub message: String,
}

impl From<&crate::BackupError> for FailureInfo {
    fn from(err: &crate::BackupError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
