//! Restore runs and their ordered step list.

use super::{FailureInfo, OperationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStep {
    LoadArtifact,
    OpenFile,
    DecryptBscc,
    VerifyChecksums,
    ReadManifest,
    CompatibilityCheck,
    EnterMaintenance,
    StopBackgroundJobs,
    RestoreDatabase,
    RunMigrationsIfNeeded,
    ExitMaintenance,
    Finish,
}

const VERIFY_STEPS: [RestoreStep; 6] = [
    RestoreStep::LoadArtifact,
    RestoreStep::OpenFile,
    RestoreStep::DecryptBscc,
    RestoreStep::VerifyChecksums,
    RestoreStep::ReadManifest,
    RestoreStep::CompatibilityCheck,
];

const APPLY_STEPS: [RestoreStep; 5] = [
    RestoreStep::EnterMaintenance,
    RestoreStep::StopBackgroundJobs,
    RestoreStep::RestoreDatabase,
    RestoreStep::RunMigrationsIfNeeded,
    RestoreStep::ExitMaintenance,
];

impl RestoreStep {
    /// Steps a run executes, in order. Dry runs stop after verification.
    pub fn sequence(dry_run: bool) -> Vec<RestoreStep> {
        let mut steps = VERIFY_STEPS.to_vec();
        if !dry_run {
            steps.extend_from_slice(&APPLY_STEPS);
        }
        steps.push(RestoreStep::Finish);
        steps
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStep::LoadArtifact => "load_artifact",
            RestoreStep::OpenFile => "open_file",
            RestoreStep::DecryptBscc => "decrypt_bscc",
            RestoreStep::VerifyChecksums => "verify_checksums",
            RestoreStep::ReadManifest => "read_manifest",
            RestoreStep::CompatibilityCheck => "compatibility_check",
            RestoreStep::EnterMaintenance => "enter_maintenance",
            RestoreStep::StopBackgroundJobs => "stop_background_jobs",
            RestoreStep::RestoreDatabase => "restore_database",
            RestoreStep::RunMigrationsIfNeeded => "run_migrations_if_needed",
            RestoreStep::ExitMaintenance => "exit_maintenance",
            RestoreStep::Finish => "finish",
        }
    }

    /// Whether the step touches the live system.
    pub fn mutates_live_system(&self) -> bool {
        APPLY_STEPS.contains(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: RestoreStep,
    pub status: OperationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Fixed, ordered step list addressed by [`RestoreStep`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Steps(Vec<StepRecord>);

impl Steps {
    pub fn for_run(dry_run: bool) -> Self {
        Self(
            RestoreStep::sequence(dry_run)
                .into_iter()
                .map(|step| StepRecord {
                    step,
                    status: OperationStatus::Queued,
                    started_at: None,
                    finished_at: None,
                    detail: None,
                    error_code: None,
                })
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
        self.0.iter()
    }

    pub fn order(&self) -> Vec<RestoreStep> {
        self.0.iter().map(|r| r.step).collect()
    }

    pub fn get(&self, step: RestoreStep) -> Option<&StepRecord> {
        self.0.iter().find(|r| r.step == step)
    }

    /// The step currently marked running, if any.
    pub fn running(&self) -> Option<RestoreStep> {
        self.0
            .iter()
            .find(|r| r.status == OperationStatus::Running)
            .map(|r| r.step)
    }

    fn record_mut(&mut self, step: RestoreStep) -> Option<&mut StepRecord> {
        self.0.iter_mut().find(|r| r.step == step)
    }

    pub fn start(&mut self, step: RestoreStep, now: DateTime<Utc>) {
        if let Some(record) = self.record_mut(step) {
            record.status = OperationStatus::Running;
            record.started_at = Some(now);
        }
    }

    pub fn succeed(&mut self, step: RestoreStep, detail: Option<serde_json::Value>, now: DateTime<Utc>) {
        if let Some(record) = self.record_mut(step) {
            record.status = OperationStatus::Success;
            record.finished_at = Some(now);
            record.detail = detail;
        }
    }

    pub fn fail(&mut self, step: RestoreStep, failure: &FailureInfo, now: DateTime<Utc>) {
        if let Some(record) = self.record_mut(step) {
            record.status = OperationStatus::Failed;
            record.finished_at = Some(now);
            record.error_code = Some(failure.code.clone());
            record.detail = Some(serde_json::json!({ "error": failure.message }));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRun {
    pub id: String,
    pub artifact_id: String,
    pub status: OperationStatus,
    pub steps: Steps,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Free-form run data; always carries `dry_run`.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RestoreRun {
    pub fn queued(artifact_id: &str, dry_run: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            artifact_id: artifact_id.to_string(),
            status: OperationStatus::Queued,
            steps: Steps::for_run(dry_run),
            error_code: None,
            error_message: None,
            metadata: serde_json::json!({ "dry_run": dry_run }),
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.metadata
            .get("dry_run")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
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

    /// Fail an interrupted run together with the step it was executing.
    pub fn abandon(&mut self, failure: &FailureInfo, now: DateTime<Utc>) {
        if let Some(step) = self.steps.running() {
            self.steps.fail(step, failure, now);
        }
        self.mark_failed(failure, now);
    }
}
