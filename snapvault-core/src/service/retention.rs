use super::BackupService;
use crate::models::{BackupArtifact, OperationStatus};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub kept: usize,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Successful artifacts that retention should remove.
///
/// The newest `keep_last` successful artifacts always survive, whatever
/// their age. Of the rest, those created before `now - retention_days` go.
pub fn select_expired<'a>(
    artifacts: &'a [BackupArtifact],
    keep_last: u32,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Vec<&'a BackupArtifact> {
    let cutoff = now - Duration::days(i64::from(retention_days));
    let mut successful: Vec<&BackupArtifact> = artifacts
        .iter()
        .filter(|a| a.status == OperationStatus::Success)
        .collect();
    successful.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    successful
        .into_iter()
        .skip(keep_last as usize)
        .filter(|a| a.created_at < cutoff)
        .collect()
}

impl BackupService {
    /// Delete expired artifacts per the plan. A failed deletion is logged
    /// and does not stop the others.
    pub async fn apply_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let plan = self.get_plan().await?;
        let artifacts = self.list_artifacts().await?;
        let expired: Vec<String> = select_expired(&artifacts, plan.keep_last_successful, plan.retention_days, now)
            .into_iter()
            .map(|a| a.id.clone())
            .collect();

        let successful = artifacts
            .iter()
            .filter(|a| a.status == OperationStatus::Success)
            .count();
        let mut report = RetentionReport {
            kept: successful - expired.len(),
            ..Default::default()
        };
        for id in expired {
            match self.delete_backup(&id).await {
                Ok(()) => report.deleted.push(id),
                Err(e) => {
                    warn!(artifact_id = %id, code = e.code(), "Retention could not delete backup: {e}");
                    report.failed.push(id);
                }
            }
        }

        if !report.deleted.is_empty() || !report.failed.is_empty() {
            info!(
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                kept = report.kept,
                "Retention applied"
            );
        }
        Ok(report)
    }
}
