//! Scheduler-invoked operations. These never fail the caller for expected
//! conditions (busy pipeline, maintenance, nothing due).

use super::{BackupOptions, BackupService, RestoreOptions, RestoreTicket};
use crate::error::BackupError;
use crate::models::{BackupArtifact, OperationStatus, RunTrigger};
use crate::schedule::should_run_by_plan;
use crate::Result;
use chrono::{DateTime, Local, TimeZone, Utc};
use tracing::{debug, info, warn};

/// How far back a tick looks for the last scheduled run.
const RECENT_RUNS: usize = 50;

/// What a scheduler tick did.
#[derive(Debug)]
pub enum AutoOutcome<T> {
    Ran(T),
    Skipped(&'static str),
}

impl<T> AutoOutcome<T> {
    pub fn ran(&self) -> bool {
        matches!(self, AutoOutcome::Ran(_))
    }
}

impl BackupService {
    /// Backup tick, evaluated on the host's local wall clock.
    pub async fn run_scheduled_backup(&self, now: DateTime<Utc>) -> Result<AutoOutcome<BackupArtifact>> {
        self.run_scheduled_backup_in(&Local, now).await
    }

    /// Backup tick in an explicit time zone. Runs at most once per local
    /// calendar day.
    pub async fn run_scheduled_backup_in<Tz>(&self, tz: &Tz, now: DateTime<Utc>) -> Result<AutoOutcome<BackupArtifact>>
    where
        Tz: TimeZone + Send + Sync,
        Tz::Offset: Send + Sync,
    {
        let plan = self.get_plan().await?;
        if !plan.enabled {
            return Ok(AutoOutcome::Skipped("disabled"));
        }

        let local_now = now.with_timezone(tz);
        let reference = plan.last_auto_run_at.unwrap_or(plan.updated_at).with_timezone(tz);
        if let Some(last) = plan.last_auto_run_at {
            if last.with_timezone(tz).date_naive() == local_now.date_naive() {
                return Ok(AutoOutcome::Skipped("already_ran_today"));
            }
        }
        if !should_run_by_plan(&plan, Some(&reference), &local_now) {
            return Ok(AutoOutcome::Skipped("not_due"));
        }
        if self.backing_off(now).await? {
            return Ok(AutoOutcome::Skipped("backing_off"));
        }

        info!(schedule = plan.schedule_type.as_str(), "Scheduled backup due");
        self.run_auto_backup(now).await
    }

    /// Automatic backup under the configured deadline. On success applies
    /// retention and records the run time on the plan.
    pub async fn run_auto_backup(&self, now: DateTime<Utc>) -> Result<AutoOutcome<BackupArtifact>> {
        if let Some(reason) = self.busy_reason().await? {
            debug!(reason, "Automatic backup skipped");
            return Ok(AutoOutcome::Skipped(reason));
        }

        let plan = self.get_plan().await?;
        let opts = BackupOptions {
            trigger: RunTrigger::Scheduled,
            include_files: plan.include_files,
            deadline: Some(self.config.auto_deadline),
        };
        let artifact = match self.create_backup_with_options(opts).await {
            Ok(artifact) => artifact,
            Err(BackupError::Concurrent) => return Ok(AutoOutcome::Skipped("busy")),
            Err(BackupError::MaintenanceActive) => return Ok(AutoOutcome::Skipped("maintenance")),
            Err(e) => return Err(e),
        };

        if let Err(e) = self.apply_retention(now).await {
            warn!(code = e.code(), "Retention after automatic backup failed: {e}");
        }

        let mut plan = self.get_plan().await?;
        plan.last_auto_run_at = Some(now);
        self.db(move |repo| repo.save_plan(&plan)).await?;
        Ok(AutoOutcome::Ran(artifact))
    }

    /// Dry-run the latest backup when the restore test is overdue. Failures
    /// are logged only.
    pub async fn run_auto_restore_test(&self, now: DateTime<Utc>) -> AutoOutcome<RestoreTicket> {
        match self.try_auto_restore_test(now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(code = e.code(), "Automatic restore test could not start: {e}");
                AutoOutcome::Skipped("error")
            }
        }
    }

    async fn try_auto_restore_test(&self, now: DateTime<Utc>) -> Result<AutoOutcome<RestoreTicket>> {
        let status = self.integrity_status(now).await?;
        if !status.overdue {
            return Ok(AutoOutcome::Skipped("not_due"));
        }
        if let Some(reason) = self.busy_reason().await? {
            return Ok(AutoOutcome::Skipped(reason));
        }
        let Some(artifact) = self.db(|repo| repo.latest_successful_artifact()).await? else {
            return Ok(AutoOutcome::Skipped("no_backup"));
        };

        let opts = RestoreOptions {
            dry_run: true,
            deadline: Some(self.config.auto_deadline),
        };
        let ticket = match self.start_restore_with(&artifact.id, opts).await {
            Ok(ticket) => ticket,
            Err(BackupError::Concurrent) => return Ok(AutoOutcome::Skipped("busy")),
            Err(BackupError::MaintenanceActive) => return Ok(AutoOutcome::Skipped("maintenance")),
            Err(e) => return Err(e),
        };
        info!(run_id = %ticket.run.id, artifact_id = %artifact.id, "Automatic restore test queued");
        Ok(AutoOutcome::Ran(ticket))
    }

    /// True while the latest scheduled run failed less than the retry
    /// backoff ago.
    async fn backing_off(&self, now: DateTime<Utc>) -> Result<bool> {
        let backoff = self.config.auto_retry_backoff;
        if backoff.is_zero() {
            return Ok(false);
        }
        let runs = self.list_backup_runs(RECENT_RUNS).await?;
        let Some(last) = runs.into_iter().find(|r| r.trigger == RunTrigger::Scheduled) else {
            return Ok(false);
        };
        if last.status != OperationStatus::Failed {
            return Ok(false);
        }
        let failed_at = last.finished_at.unwrap_or(last.created_at);
        let waiting = match (now - failed_at).to_std() {
            Ok(elapsed) => elapsed < backoff,
            Err(_) => true,
        };
        if waiting {
            debug!(run_id = %last.id, code = ?last.error_code, "Scheduled backup backing off after failure");
        }
        Ok(waiting)
    }

    async fn busy_reason(&self) -> Result<Option<&'static str>> {
        if self.maintenance_state().await?.enabled {
            return Ok(Some("maintenance"));
        }
        if self.pipeline.is_held() {
            return Ok(Some("busy"));
        }
        Ok(None)
    }
}
