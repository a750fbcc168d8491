//! In-process repository. Used by tests and by hosts without a database.

use super::BackupRepository;
use crate::models::{
    BackupArtifact, BackupPlan, BackupRun, FailureInfo, MaintenanceState, OperationStatus,
    RestoreRun,
};
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use std::sync::{Mutex, MutexGuard};

struct State {
    artifacts: Vec<BackupArtifact>,
    backup_runs: Vec<BackupRun>,
    restore_runs: Vec<RestoreRun>,
    plan: BackupPlan,
    maintenance: MaintenanceState,
}

pub struct MemoryRepository {
    state: Mutex<State>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                artifacts: Vec::new(),
                backup_runs: Vec::new(),
                restore_runs: Vec::new(),
                plan: BackupPlan::default_at(Utc::now()),
                maintenance: MaintenanceState::default(),
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| anyhow!("repository lock poisoned"))
    }
}

/// Newest first; later inserts win ties.
fn newest_first<T: Clone>(rows: &[T], created_at: impl Fn(&T) -> chrono::DateTime<Utc>) -> Vec<T> {
    let mut out: Vec<T> = rows.iter().rev().cloned().collect();
    out.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
    out
}

fn replace<T>(rows: &mut [T], id: &str, row_id: impl Fn(&T) -> &str, value: T) -> Result<()> {
    match rows.iter_mut().find(|r| row_id(r) == id) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => bail!("no row with id {id}"),
    }
}

impl BackupRepository for MemoryRepository {
    fn create_artifact(&self, artifact: &BackupArtifact) -> Result<()> {
        let mut state = self.state()?;
        if state.artifacts.iter().any(|a| a.id == artifact.id) {
            bail!("artifact {} already exists", artifact.id);
        }
        state.artifacts.push(artifact.clone());
        Ok(())
    }

    fn update_artifact(&self, artifact: &BackupArtifact) -> Result<()> {
        let mut state = self.state()?;
        replace(&mut state.artifacts, &artifact.id, |a| a.id.as_str(), artifact.clone())
    }

    fn get_artifact(&self, id: &str) -> Result<Option<BackupArtifact>> {
        Ok(self.state()?.artifacts.iter().find(|a| a.id == id).cloned())
    }

    fn list_artifacts(&self) -> Result<Vec<BackupArtifact>> {
        Ok(newest_first(&self.state()?.artifacts, |a| a.created_at))
    }

    fn delete_artifact(&self, id: &str) -> Result<bool> {
        let mut state = self.state()?;
        let before = state.artifacts.len();
        state.artifacts.retain(|a| a.id != id);
        Ok(state.artifacts.len() != before)
    }

    fn latest_successful_artifact(&self) -> Result<Option<BackupArtifact>> {
        Ok(newest_first(&self.state()?.artifacts, |a| a.created_at)
            .into_iter()
            .find(|a| a.status == OperationStatus::Success))
    }

    fn create_backup_run(&self, run: &BackupRun) -> Result<()> {
        self.state()?.backup_runs.push(run.clone());
        Ok(())
    }

    fn update_backup_run(&self, run: &BackupRun) -> Result<()> {
        let mut state = self.state()?;
        replace(&mut state.backup_runs, &run.id, |r| r.id.as_str(), run.clone())
    }

    fn list_backup_runs(&self, limit: usize) -> Result<Vec<BackupRun>> {
        let mut runs = newest_first(&self.state()?.backup_runs, |r| r.created_at);
        runs.truncate(limit);
        Ok(runs)
    }

    fn create_restore_run(&self, run: &RestoreRun) -> Result<()> {
        self.state()?.restore_runs.push(run.clone());
        Ok(())
    }

    fn update_restore_run(&self, run: &RestoreRun) -> Result<()> {
        let mut state = self.state()?;
        replace(&mut state.restore_runs, &run.id, |r| r.id.as_str(), run.clone())
    }

    fn get_restore_run(&self, id: &str) -> Result<Option<RestoreRun>> {
        Ok(self.state()?.restore_runs.iter().find(|r| r.id == id).cloned())
    }

    fn list_restore_runs(&self, limit: usize) -> Result<Vec<RestoreRun>> {
        let mut runs = newest_first(&self.state()?.restore_runs, |r| r.created_at);
        runs.truncate(limit);
        Ok(runs)
    }

    fn latest_finished_dry_run(&self) -> Result<Option<RestoreRun>> {
        Ok(newest_first(&self.state()?.restore_runs, |r| r.created_at)
            .into_iter()
            .find(|r| r.dry_run() && r.status.is_terminal()))
    }

    fn get_plan(&self) -> Result<BackupPlan> {
        Ok(self.state()?.plan.clone())
    }

    fn save_plan(&self, plan: &BackupPlan) -> Result<()> {
        self.state()?.plan = plan.clone();
        Ok(())
    }

    fn get_maintenance(&self) -> Result<MaintenanceState> {
        Ok(self.state()?.maintenance.clone())
    }

    fn set_maintenance(&self, state: &MaintenanceState) -> Result<()> {
        self.state()?.maintenance = state.clone();
        Ok(())
    }

    fn has_running_backup(&self) -> Result<bool> {
        let state = self.state()?;
        Ok(state.backup_runs.iter().any(|r| r.status.is_active())
            || state.artifacts.iter().any(|a| a.status.is_active()))
    }

    fn has_running_restore(&self) -> Result<bool> {
        Ok(self.state()?.restore_runs.iter().any(|r| r.status.is_active()))
    }

    fn reset_running_operations(&self, code: &str, message: &str) -> Result<usize> {
        let failure = FailureInfo {
            code: code.to_string(),
            message: message.to_string(),
        };
        let now = Utc::now();
        let mut state = self.state()?;
        let mut changed = 0;

        for artifact in state.artifacts.iter_mut().filter(|a| a.status.is_active()) {
            artifact.mark_failed(&failure, now);
            changed += 1;
        }
        for run in state.backup_runs.iter_mut().filter(|r| r.status.is_active()) {
            run.mark_failed(&failure, now);
            changed += 1;
        }
        for run in state.restore_runs.iter_mut().filter(|r| r.status.is_active()) {
            run.abandon(&failure, now);
            changed += 1;
        }
        Ok(changed)
    }
}
