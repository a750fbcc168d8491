use crate::hooks::PauseFlag;
use chrono::Utc;
use snapvault_core::service::auto::AutoOutcome;
use snapvault_core::BackupService;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Cron ticks driving automatic backups and restore tests.
pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    service: BackupService,
    pause: PauseFlag,
}

impl BackupScheduler {
    pub async fn new(service: BackupService, pause: PauseFlag) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            service,
            pause,
        })
    }

    /// Evaluate the plan on every tick; the service decides whether a backup
    /// is due.
    pub async fn schedule_backup_tick(&self, cron_expression: &str) -> anyhow::Result<()> {
        let service = self.service.clone();
        let pause = self.pause.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let service = service.clone();
            let pause = pause.clone();
            Box::pin(async move {
                if pause.is_paused() {
                    tracing::debug!("Backup tick skipped: background jobs paused");
                    return;
                }
                match service.run_scheduled_backup(Utc::now()).await {
                    Ok(AutoOutcome::Ran(artifact)) => {
                        tracing::info!(artifact_id = %artifact.id, "Scheduled backup finished");
                    }
                    Ok(AutoOutcome::Skipped(reason)) => {
                        tracing::trace!(reason, "Backup tick: nothing to do");
                    }
                    Err(e) => {
                        tracing::error!(code = e.code(), error = %e, "Scheduled backup failed");
                    }
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Backup tick scheduled");
        Ok(())
    }

    pub async fn schedule_restore_test(&self, cron_expression: &str) -> anyhow::Result<()> {
        let service = self.service.clone();
        let pause = self.pause.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let service = service.clone();
            let pause = pause.clone();
            Box::pin(async move {
                if pause.is_paused() {
                    tracing::debug!("Restore test tick skipped: background jobs paused");
                    return;
                }
                let AutoOutcome::Ran(ticket) = service.run_auto_restore_test(Utc::now()).await else {
                    return;
                };
                match ticket.wait().await {
                    Ok(run) => tracing::info!(
                        run_id = %run.id,
                        status = run.status.as_str(),
                        "Automatic restore test finished"
                    ),
                    Err(e) => tracing::error!(error = %e, "Automatic restore test task failed"),
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Restore test tick scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
