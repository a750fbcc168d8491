//! Restore runs: a fixed step sequence persisted at every transition.

use super::{extract_error, BackupService, PipelineToken};
use crate::crypto::{ContainerReader, CryptoError};
use crate::error::BackupError;
use crate::models::{
    BackupArtifact, FailureInfo, MaintenanceState, OperationStatus, RestoreRun, RestoreStep,
};
use crate::payload::hashing::HashingReader;
use crate::payload::{extract_payload, ExtractedPayload, DUMP_MEMBER, PAYLOAD_FORMAT_VERSION};
use crate::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const PAYLOAD_FILE: &str = "payload.tar";

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    pub dry_run: bool,
    /// Shared by all steps; the step running when it expires fails with
    /// `timeout`.
    pub deadline: Option<Duration>,
}

/// A queued restore and the task executing it.
#[derive(Debug)]
pub struct RestoreTicket {
    pub run: RestoreRun,
    pub handle: JoinHandle<RestoreRun>,
}

impl RestoreTicket {
    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<RestoreRun> {
        self.handle.await.map_err(|e| BackupError::Internal(e.into()))
    }
}

/// State carried between steps. Dropping it removes the work directory.
#[derive(Default)]
struct RestoreContext {
    artifact: Option<BackupArtifact>,
    workdir: Option<TempDir>,
    container_sha256: Option<String>,
    payload: Option<ExtractedPayload>,
    entered_maintenance: bool,
    stopped_jobs: bool,
}

impl RestoreContext {
    fn artifact(&self) -> Result<&BackupArtifact> {
        self.artifact
            .as_ref()
            .ok_or_else(|| BackupError::internal("artifact not loaded"))
    }

    fn workdir(&self) -> Result<PathBuf> {
        self.workdir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| BackupError::internal("container not decrypted"))
    }

    fn payload(&self) -> Result<&ExtractedPayload> {
        self.payload
            .as_ref()
            .ok_or_else(|| BackupError::internal("payload not verified"))
    }
}

impl BackupService {
    pub async fn start_restore(&self, artifact_id: &str) -> Result<RestoreTicket> {
        self.start_restore_with(artifact_id, RestoreOptions::default()).await
    }

    pub async fn start_restore_dry_run(&self, artifact_id: &str) -> Result<RestoreTicket> {
        let opts = RestoreOptions {
            dry_run: true,
            deadline: None,
        };
        self.start_restore_with(artifact_id, opts).await
    }

    /// Record a queued run and execute it on a spawned task that owns the
    /// pipeline slot until the run ends.
    pub async fn start_restore_with(&self, artifact_id: &str, opts: RestoreOptions) -> Result<RestoreTicket> {
        let operation = if opts.dry_run { "restore_dry_run" } else { "restore" };
        let token = self.begin_pipeline(operation).await?;

        let run = RestoreRun::queued(artifact_id, opts.dry_run, Utc::now());
        let created = run.clone();
        self.db(move |repo| repo.create_restore_run(&created)).await?;
        info!(run_id = %run.id, artifact_id, dry_run = opts.dry_run, "Restore queued");

        let service = self.clone();
        let task_run = run.clone();
        let handle = tokio::spawn(async move { service.execute_restore(task_run, opts.deadline, token).await });
        Ok(RestoreTicket { run, handle })
    }

    async fn execute_restore(&self, mut run: RestoreRun, deadline: Option<Duration>, token: PipelineToken) -> RestoreRun {
        let started = Instant::now();
        let mut ctx = RestoreContext::default();
        run.mark_running(Utc::now());
        self.save_restore(&run).await;

        let mut failure: Option<FailureInfo> = None;
        for step in run.steps.order() {
            run.steps.start(step, Utc::now());
            self.save_restore(&run).await;

            let outcome = match deadline.map(|limit| limit.saturating_sub(started.elapsed())) {
                Some(remaining) if remaining.is_zero() => Err(BackupError::Timeout),
                Some(remaining) => tokio::time::timeout(remaining, self.run_step(step, &mut ctx, &run))
                    .await
                    .unwrap_or(Err(BackupError::Timeout)),
                None => self.run_step(step, &mut ctx, &run).await,
            };

            match outcome {
                Ok(detail) => {
                    run.steps.succeed(step, detail, Utc::now());
                    self.save_restore(&run).await;
                }
                Err(err) => {
                    let info = FailureInfo::from(&err);
                    run.steps.fail(step, &info, Utc::now());
                    error!(run_id = %run.id, step = step.as_str(), code = err.code(), "Restore step failed: {err}");
                    failure = Some(info);
                    break;
                }
            }
        }

        match failure {
            Some(info) => {
                self.recover_live_system(&mut run, &mut ctx).await;
                run.mark_failed(&info, Utc::now());
            }
            None => {
                run.mark_success(Utc::now());
                info!(run_id = %run.id, dry_run = run.dry_run(), "Restore finished");
            }
        }
        self.save_restore(&run).await;
        drop(ctx);
        drop(token);
        run
    }

    async fn run_step(&self, step: RestoreStep, ctx: &mut RestoreContext, run: &RestoreRun) -> Result<Option<Value>> {
        let run_id = run.id.as_str();
        match step {
            RestoreStep::LoadArtifact => {
                let artifact = self.get_artifact(&run.artifact_id).await?;
                if artifact.status != OperationStatus::Success {
                    return Err(BackupError::NotReady);
                }
                if artifact.storage_path.is_none() {
                    return Err(BackupError::FileMissing);
                }
                let detail = json!({
                    "filename": artifact.filename,
                    "origin": artifact.origin,
                    "size_bytes": artifact.size_bytes,
                });
                ctx.artifact = Some(artifact);
                Ok(Some(detail))
            }
            RestoreStep::OpenFile => {
                let path = container_path(ctx.artifact()?)?;
                let file = tokio::fs::File::open(&path).await.map_err(super::open_error)?;
                let size = file.metadata().await.map_err(super::open_error)?.len();
                Ok(Some(json!({ "size_bytes": size })))
            }
            RestoreStep::DecryptBscc => {
                let key = self.config.key()?;
                let path = container_path(ctx.artifact()?)?;
                let workdir = self.workdir("restore")?;
                let payload_path = workdir.path().join(PAYLOAD_FILE);
                ctx.workdir = Some(workdir);

                let (sha256, container_bytes, plaintext_bytes) = tokio::task::spawn_blocking(move || -> Result<_> {
                    let file = File::open(&path).map_err(super::open_error)?;
                    let mut reader = ContainerReader::new(HashingReader::new(BufReader::new(file)), &key)?;
                    let mut out = BufWriter::new(File::create(&payload_path)?);
                    let plaintext = io::copy(&mut reader, &mut out).map_err(CryptoError::from_io)?;
                    out.flush()?;
                    let (sha256, read) = reader.into_inner().finish();
                    Ok((sha256, read, plaintext))
                })
                .await
                .map_err(|e| BackupError::Internal(e.into()))??;

                ctx.container_sha256 = Some(sha256);
                Ok(Some(json!({
                    "container_bytes": container_bytes,
                    "payload_bytes": plaintext_bytes,
                })))
            }
            RestoreStep::VerifyChecksums => {
                let workdir = ctx.workdir()?;
                let payload = tokio::task::spawn_blocking(move || -> Result<ExtractedPayload> {
                    let tar = BufReader::new(File::open(workdir.join(PAYLOAD_FILE))?);
                    let payload = extract_payload(tar, &workdir.join(DUMP_MEMBER)).map_err(extract_error)?;
                    if let Err(e) = std::fs::remove_file(workdir.join(PAYLOAD_FILE)) {
                        warn!("Failed to remove decrypted payload: {e}");
                    }
                    Ok(payload)
                })
                .await
                .map_err(|e| BackupError::Internal(e.into()))??;

                let mismatches = payload.mismatches();
                if !mismatches.is_empty() {
                    return Err(BackupError::ChecksumMismatch(mismatches.join(", ")));
                }
                let recorded = ctx.artifact()?.checksum.clone().unwrap_or_default();
                let actual = ctx.container_sha256.clone().unwrap_or_default();
                if !recorded.eq_ignore_ascii_case(&actual) {
                    return Err(BackupError::ChecksumMismatch("container".into()));
                }
                let detail = json!({ "dump_bytes": payload.dump_size });
                ctx.payload = Some(payload);
                Ok(Some(detail))
            }
            RestoreStep::ReadManifest => {
                let manifest = &ctx.payload()?.manifest;
                Ok(Some(serde_json::to_value(manifest).map_err(|e| BackupError::Internal(e.into()))?))
            }
            RestoreStep::CompatibilityCheck => {
                let manifest = &ctx.payload()?.manifest;
                if manifest.db_engine != self.config.db_engine {
                    return Err(BackupError::Incompatible(format!(
                        "backup is for {:?}, this system runs {:?}",
                        manifest.db_engine, self.config.db_engine
                    )));
                }
                if manifest.format_version != PAYLOAD_FORMAT_VERSION {
                    return Err(BackupError::Incompatible(format!(
                        "payload format version {} is not supported",
                        manifest.format_version
                    )));
                }
                if manifest.schema_version > self.config.schema_version {
                    return Err(BackupError::Incompatible(format!(
                        "backup schema version {} is newer than {}",
                        manifest.schema_version, self.config.schema_version
                    )));
                }
                Ok(Some(json!({
                    "schema_version": manifest.schema_version,
                    "live_schema_version": self.config.schema_version,
                    "migrations_needed": manifest.schema_version < self.config.schema_version,
                })))
            }
            RestoreStep::EnterMaintenance => {
                let state = MaintenanceState::for_restore(run_id, Utc::now());
                ctx.entered_maintenance = true;
                self.db(move |repo| repo.set_maintenance(&state)).await?;
                warn!(run_id, "Maintenance mode enabled for restore");
                Ok(None)
            }
            RestoreStep::StopBackgroundJobs => {
                ctx.stopped_jobs = true;
                self.hooks.stop_background_jobs().await?;
                Ok(None)
            }
            RestoreStep::RestoreDatabase => {
                let dump_path = ctx.payload()?.dump_path.clone();
                self.dump.restore(&dump_path).await?;
                Ok(None)
            }
            RestoreStep::RunMigrationsIfNeeded => {
                let needed = ctx.payload()?.manifest.schema_version < self.config.schema_version;
                if needed {
                    self.hooks.run_migrations().await.map_err(|e| match e {
                        BackupError::MigrationFailed(_) => e,
                        other => BackupError::MigrationFailed(other.to_string()),
                    })?;
                }
                Ok(Some(json!({ "migrated": needed })))
            }
            RestoreStep::ExitMaintenance => {
                self.hooks.resume_background_jobs().await?;
                ctx.stopped_jobs = false;
                self.db(|repo| repo.set_maintenance(&MaintenanceState::default())).await?;
                ctx.entered_maintenance = false;
                info!(run_id, "Maintenance mode released");
                Ok(None)
            }
            RestoreStep::Finish => Ok(Some(json!({ "artifact_id": ctx.artifact()?.id }))),
        }
    }

    /// Undo live-system changes left by a failed real restore. Best-effort.
    async fn recover_live_system(&self, run: &mut RestoreRun, ctx: &mut RestoreContext) {
        if ctx.stopped_jobs {
            let resumed = match self.hooks.resume_background_jobs().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(run_id = %run.id, "Failed to resume background jobs: {e}");
                    false
                }
            };
            ctx.stopped_jobs = !resumed;
            run.set_metadata("jobs_resumed", json!(resumed));
        }
        if ctx.entered_maintenance {
            let released = match self.db(|repo| repo.set_maintenance(&MaintenanceState::default())).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(run_id = %run.id, "Failed to release maintenance mode: {e}");
                    false
                }
            };
            ctx.entered_maintenance = !released;
            run.set_metadata("maintenance_released", json!(released));
        }
    }

    async fn save_restore(&self, run: &RestoreRun) {
        let snapshot = run.clone();
        if let Err(e) = self.db(move |repo| repo.update_restore_run(&snapshot)).await {
            warn!(run_id = %run.id, "Failed to persist restore run: {e}");
        }
    }
}

fn container_path(artifact: &BackupArtifact) -> Result<PathBuf> {
    artifact
        .storage_path
        .as_deref()
        .map(PathBuf::from)
        .ok_or(BackupError::FileMissing)
}
