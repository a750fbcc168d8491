use crate::db::connection::DbPool;
use crate::models::{artifact, restore_run, run, settings};
use anyhow::Result;
use chrono::Utc;
use snapvault_core::models::{
    BackupArtifact, BackupPlan, BackupRun, FailureInfo, MaintenanceState, RestoreRun,
};
use snapvault_core::BackupRepository;

/// SQLite-backed repository shared through an r2d2 pool.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: DbPool,
}

impl SqliteRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl BackupRepository for SqliteRepository {
    fn create_artifact(&self, a: &BackupArtifact) -> Result<()> {
        artifact::create(&*self.pool.get()?, a)
    }

    fn update_artifact(&self, a: &BackupArtifact) -> Result<()> {
        artifact::update(&*self.pool.get()?, a)
    }

    fn get_artifact(&self, id: &str) -> Result<Option<BackupArtifact>> {
        artifact::find_by_id(&*self.pool.get()?, id)
    }

    fn list_artifacts(&self) -> Result<Vec<BackupArtifact>> {
        artifact::find_all(&*self.pool.get()?)
    }

    fn delete_artifact(&self, id: &str) -> Result<bool> {
        artifact::delete(&*self.pool.get()?, id)
    }

    fn latest_successful_artifact(&self) -> Result<Option<BackupArtifact>> {
        artifact::find_latest_successful(&*self.pool.get()?)
    }

    fn create_backup_run(&self, r: &BackupRun) -> Result<()> {
        run::create(&*self.pool.get()?, r)
    }

    fn update_backup_run(&self, r: &BackupRun) -> Result<()> {
        run::update(&*self.pool.get()?, r)
    }

    fn list_backup_runs(&self, limit: usize) -> Result<Vec<BackupRun>> {
        run::find_recent(&*self.pool.get()?, limit)
    }

    fn create_restore_run(&self, r: &RestoreRun) -> Result<()> {
        restore_run::create(&*self.pool.get()?, r)
    }

    fn update_restore_run(&self, r: &RestoreRun) -> Result<()> {
        restore_run::update(&*self.pool.get()?, r)
    }

    fn get_restore_run(&self, id: &str) -> Result<Option<RestoreRun>> {
        restore_run::find_by_id(&*self.pool.get()?, id)
    }

    fn list_restore_runs(&self, limit: usize) -> Result<Vec<RestoreRun>> {
        restore_run::find_recent(&*self.pool.get()?, limit)
    }

    fn latest_finished_dry_run(&self) -> Result<Option<RestoreRun>> {
        restore_run::find_latest_finished_dry_run(&*self.pool.get()?)
    }

    fn get_plan(&self) -> Result<BackupPlan> {
        settings::get_plan(&*self.pool.get()?)
    }

    fn save_plan(&self, plan: &BackupPlan) -> Result<()> {
        settings::save_plan(&*self.pool.get()?, plan)
    }

    fn get_maintenance(&self) -> Result<MaintenanceState> {
        settings::get_maintenance(&*self.pool.get()?)
    }

    fn set_maintenance(&self, state: &MaintenanceState) -> Result<()> {
        settings::set_maintenance(&*self.pool.get()?, state)
    }

    fn has_running_backup(&self) -> Result<bool> {
        let conn = self.pool.get()?;
        Ok(run::any_active(&conn)? || artifact::any_active(&conn)?)
    }

    fn has_running_restore(&self) -> Result<bool> {
        restore_run::any_active(&*self.pool.get()?)
    }

    fn reset_running_operations(&self, code: &str, message: &str) -> Result<usize> {
        let failure = FailureInfo {
            code: code.to_string(),
            message: message.to_string(),
        };
        let now = Utc::now();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut changed = 0;

        for mut a in artifact::find_active(&tx)? {
            a.mark_failed(&failure, now);
            artifact::update(&tx, &a)?;
            changed += 1;
        }
        for mut r in run::find_active(&tx)? {
            r.mark_failed(&failure, now);
            run::update(&tx, &r)?;
            changed += 1;
        }
        for mut r in restore_run::find_active(&tx)? {
            r.abandon(&failure, now);
            restore_run::update(&tx, &r)?;
            changed += 1;
        }

        tx.commit()?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use chrono::Duration;
    use snapvault_core::models::{
        ArtifactOrigin, OperationStatus, RestoreStep, RunTrigger, ScheduleType,
    };

    fn repo() -> (tempfile::TempDir, SqliteRepository) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        migrate(&pool).unwrap();
        (dir, SqliteRepository::new(pool))
    }

    fn failure(code: &str) -> FailureInfo {
        FailureInfo {
            code: code.into(),
            message: "boom".into(),
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        migrate(&pool).unwrap();
        migrate(&pool).unwrap();
    }

    #[test]
    fn test_artifact_round_trip() {
        let (_dir, repo) = repo();
        let now = Utc::now();
        let mut a = BackupArtifact::queued("backup-1.bscc".into(), ArtifactOrigin::Imported, now);
        repo.create_artifact(&a).unwrap();

        a.mark_running(now);
        a.metadata = serde_json::json!({ "original_filename": "nightly.bscc" });
        a.mark_success("/data/backup-1.bscc".into(), "ab".repeat(32), 4096, now);
        repo.update_artifact(&a).unwrap();

        assert_eq!(repo.get_artifact(&a.id).unwrap(), Some(a.clone()));
        assert_eq!(repo.latest_successful_artifact().unwrap(), Some(a.clone()));
        assert!(!repo.has_running_backup().unwrap());

        assert!(repo.delete_artifact(&a.id).unwrap());
        assert!(!repo.delete_artifact(&a.id).unwrap());
        assert_eq!(repo.get_artifact(&a.id).unwrap(), None);
    }

    #[test]
    fn test_update_of_unknown_row_fails() {
        let (_dir, repo) = repo();
        let a = BackupArtifact::queued("x.bscc".into(), ArtifactOrigin::Local, Utc::now());
        assert!(repo.update_artifact(&a).is_err());
    }

    #[test]
    fn test_lists_are_newest_first_and_limited() {
        let (_dir, repo) = repo();
        let now = Utc::now();
        for hours in [3, 1, 2] {
            let at = now - Duration::hours(hours);
            let a = BackupArtifact::queued(format!("{hours}.bscc"), ArtifactOrigin::Local, at);
            repo.create_artifact(&a).unwrap();
            repo.create_backup_run(&BackupRun::queued(&a.id, RunTrigger::Manual, at)).unwrap();
        }

        let names: Vec<String> = repo.list_artifacts().unwrap().into_iter().map(|a| a.filename).collect();
        assert_eq!(names, ["1.bscc", "2.bscc", "3.bscc"]);
        let runs = repo.list_backup_runs(2).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].created_at > runs[1].created_at);
    }

    #[test]
    fn test_restore_run_steps_survive_storage() {
        let (_dir, repo) = repo();
        let now = Utc::now();
        let mut run = RestoreRun::queued("artifact", false, now);
        repo.create_restore_run(&run).unwrap();
        assert!(repo.has_running_restore().unwrap());

        run.mark_running(now);
        run.steps.start(RestoreStep::LoadArtifact, now);
        run.steps.succeed(RestoreStep::LoadArtifact, Some(serde_json::json!({ "size_bytes": 1 })), now);
        run.steps.start(RestoreStep::OpenFile, now);
        run.steps.fail(RestoreStep::OpenFile, &failure("file_missing"), now);
        run.mark_failed(&failure("file_missing"), now);
        repo.update_restore_run(&run).unwrap();

        let stored = repo.get_restore_run(&run.id).unwrap().unwrap();
        assert_eq!(stored, run);
        assert!(!repo.has_running_restore().unwrap());
        assert_eq!(repo.list_restore_runs(10).unwrap(), [run]);
    }

    #[test]
    fn test_latest_finished_dry_run_skips_real_and_active_runs() {
        let (_dir, repo) = repo();
        let now = Utc::now();

        let mut done = RestoreRun::queued("a", true, now - Duration::hours(2));
        done.mark_success(now - Duration::hours(2));
        repo.create_restore_run(&done).unwrap();

        let mut real = RestoreRun::queued("a", false, now - Duration::hours(1));
        real.mark_success(now - Duration::hours(1));
        repo.create_restore_run(&real).unwrap();

        repo.create_restore_run(&RestoreRun::queued("a", true, now)).unwrap();

        let latest = repo.latest_finished_dry_run().unwrap().unwrap();
        assert_eq!(latest.id, done.id);
    }

    #[test]
    fn test_plan_defaults_then_saves() {
        let (_dir, repo) = repo();
        let plan = repo.get_plan().unwrap();
        assert!(plan.enabled);
        assert_eq!(plan.schedule_type, ScheduleType::Daily);
        assert_eq!(repo.get_plan().unwrap(), plan);

        let mut plan = plan;
        plan.schedule_type = ScheduleType::MonthlyEnd;
        plan.hour = 23;
        plan.last_auto_run_at = Some(Utc::now());
        repo.save_plan(&plan).unwrap();
        assert_eq!(repo.get_plan().unwrap(), plan);
    }

    #[test]
    fn test_maintenance_round_trip() {
        let (_dir, repo) = repo();
        assert_eq!(repo.get_maintenance().unwrap(), MaintenanceState::default());

        let on = MaintenanceState::for_restore("run-1", Utc::now());
        repo.set_maintenance(&on).unwrap();
        assert_eq!(repo.get_maintenance().unwrap(), on);

        repo.set_maintenance(&MaintenanceState::default()).unwrap();
        assert!(!repo.get_maintenance().unwrap().enabled);
    }

    #[test]
    fn test_reset_running_operations() {
        let (_dir, repo) = repo();
        let now = Utc::now();

        let mut stuck = BackupArtifact::queued("stuck.bscc".into(), ArtifactOrigin::Local, now);
        stuck.mark_running(now);
        repo.create_artifact(&stuck).unwrap();
        let mut run = BackupRun::queued(&stuck.id, RunTrigger::Scheduled, now);
        run.mark_running(now);
        repo.create_backup_run(&run).unwrap();

        let mut restore = RestoreRun::queued(&stuck.id, true, now);
        restore.mark_running(now);
        restore.steps.start(RestoreStep::LoadArtifact, now);
        repo.create_restore_run(&restore).unwrap();

        let mut finished = BackupArtifact::queued("ok.bscc".into(), ArtifactOrigin::Local, now);
        finished.mark_success("/data/ok.bscc".into(), "00".into(), 1, now);
        repo.create_artifact(&finished).unwrap();

        assert_eq!(repo.reset_running_operations("recovered", "restart").unwrap(), 3);
        assert!(!repo.has_running_backup().unwrap());
        assert!(!repo.has_running_restore().unwrap());

        let stuck = repo.get_artifact(&stuck.id).unwrap().unwrap();
        assert_eq!(stuck.status, OperationStatus::Failed);
        assert_eq!(stuck.error_code.as_deref(), Some("recovered"));
        let restore = repo.get_restore_run(&restore.id).unwrap().unwrap();
        let step = restore.steps.get(RestoreStep::LoadArtifact).unwrap();
        assert_eq!(step.status, OperationStatus::Failed);
        assert_eq!(
            restore.steps.get(RestoreStep::OpenFile).unwrap().status,
            OperationStatus::Queued
        );
        assert_eq!(
            repo.get_artifact(&finished.id).unwrap().unwrap().status,
            OperationStatus::Success
        );

        assert_eq!(repo.reset_running_operations("recovered", "restart").unwrap(), 0);
    }
}
