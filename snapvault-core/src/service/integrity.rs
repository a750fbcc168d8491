//! Backup integrity: is there a recent backup, and has it been proven
//! restorable by a dry run?

use super::BackupService;
use crate::models::{BackupArtifact, OperationStatus, RestoreRun};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityLevel {
    Ok,
    Warning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityStatus {
    pub status: IntegrityLevel,
    /// Localization key explaining a non-ok status.
    pub reason: Option<&'static str>,
    pub overdue: bool,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_restore_test_at: Option<DateTime<Utc>>,
    pub last_restore_test_status: Option<OperationStatus>,
    pub next_restore_test_due_at: Option<DateTime<Utc>>,
}

pub const REASON_NO_BACKUP: &str = "integrity.no_backup";
pub const REASON_NO_RESTORE_TEST: &str = "integrity.no_restore_test";
pub const REASON_RESTORE_TEST_FAILED: &str = "integrity.restore_test_failed";
pub const REASON_RESTORE_TEST_OVERDUE: &str = "integrity.restore_test_overdue";

/// Pure evaluation over the latest successful artifact and latest finished
/// dry run.
pub fn evaluate(
    last_backup: Option<&BackupArtifact>,
    last_test: Option<&RestoreRun>,
    interval: Duration,
    now: DateTime<Utc>,
) -> IntegrityStatus {
    let last_backup_at = last_backup.map(BackupArtifact::completed_at);
    let last_restore_test_at = last_test.map(|run| run.finished_at.unwrap_or(run.created_at));
    let mut status = IntegrityStatus {
        status: IntegrityLevel::Ok,
        reason: None,
        overdue: false,
        last_backup_at,
        last_restore_test_at,
        last_restore_test_status: last_test.map(|run| run.status),
        next_restore_test_due_at: None,
    };

    let Some(backup_at) = last_backup_at else {
        status.status = IntegrityLevel::Warning;
        status.reason = Some(REASON_NO_BACKUP);
        return status;
    };

    let anchor = last_restore_test_at.map_or(backup_at, |tested| tested.max(backup_at));
    let due = anchor + interval;
    status.next_restore_test_due_at = Some(due);
    status.overdue = now >= due;

    match last_test {
        Some(run) if run.status != OperationStatus::Success => {
            status.status = IntegrityLevel::Failed;
            status.reason = Some(REASON_RESTORE_TEST_FAILED);
        }
        None => {
            status.status = IntegrityLevel::Warning;
            status.reason = Some(REASON_NO_RESTORE_TEST);
        }
        Some(_) if status.overdue => {
            status.status = IntegrityLevel::Warning;
            status.reason = Some(REASON_RESTORE_TEST_OVERDUE);
        }
        Some(_) => {}
    }
    status
}

impl BackupService {
    pub async fn integrity_status(&self, now: DateTime<Utc>) -> Result<IntegrityStatus> {
        let (backup, test) = self
            .db(|repo| Ok((repo.latest_successful_artifact()?, repo.latest_finished_dry_run()?)))
            .await?;
        let interval = self.config.restore_test_interval();
        Ok(evaluate(backup.as_ref(), test.as_ref(), interval, now))
    }
}
