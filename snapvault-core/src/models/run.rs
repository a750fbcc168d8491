use super::{FailureInfo, OperationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// What started a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled,
    Import,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Manual => "manual",
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Import => "import",
        }
    }
}

impl FromStr for RunTrigger {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(RunTrigger::Manual),
            "scheduled" => Ok(RunTrigger::Scheduled),
            "import" => Ok(RunTrigger::Import),
            other => anyhow::bail!("Unknown run trigger {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: String,
    pub artifact_id: String,
    pub trigger: RunTrigger,
    pub status: OperationStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupRun {
    pub fn queued(artifact_id: &str, trigger: RunTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            artifact_id: artifact_id.to_string(),
            trigger,
            status: OperationStatus::Queued,
            error_code: None,
            error_message: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Running;
        self.started_at = Some(now);
    }

    pub fn mark_success(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Success;
        self.finished_at = Some(now);
    }

    pub fn mark_failed(&mut self, failure: &FailureInfo, now: DateTime<Utc>) {
        self.status = OperationStatus::Failed;
        self.error_code = Some(failure.code.clone());
        self.error_message = Some(failure.message.clone());
        self.finished_at = Some(now);
    }
}
