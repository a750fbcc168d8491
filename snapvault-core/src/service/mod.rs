//! The backup orchestrator.
//!
//! `BackupService` composes the codec, payload and repository into the
//! operations exposed to hosts. Every pipeline operation (create, import,
//! restore) holds the single pipeline slot for its whole duration and also
//! checks the repository for queued/running rows, so work left by another
//! process is respected.

pub mod auto;
pub mod guard;
pub mod integrity;
pub mod restore;
pub mod retention;

pub use guard::{
    ArtifactDownload, DeleteClaim, DownloadLease, DownloadTracker, PipelineGuard, PipelineToken,
};
pub use integrity::{IntegrityLevel, IntegrityStatus};
pub use restore::{RestoreOptions, RestoreTicket};
pub use retention::RetentionReport;

use crate::config::BackupConfig;
use crate::crypto::{CryptoError, ContainerHeader, ContainerReader, ContainerWriter, EncryptionKey};
use crate::dump::DumpTool;
use crate::error::BackupError;
use crate::hooks::SystemHooks;
use crate::models::{
    ArtifactOrigin, BackupArtifact, BackupPlan, BackupRun, FailureInfo, MaintenanceState,
    OperationStatus, PlanUpdate, RestoreRun, RunTrigger,
};
use crate::payload::hashing::{finish_hashing_writer, hashing_writer};
use crate::payload::{
    build_payload, extract_payload, ExtractError, Manifest, DUMP_MEMBER, PAYLOAD_FORMAT_VERSION,
};
use crate::repository::BackupRepository;
use crate::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Error code written on rows swept by crash recovery.
pub const RECOVERED_CODE: &str = "recovered";

const UPLOAD_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub trigger: RunTrigger,
    pub include_files: bool,
    /// Overall time limit; exceeding it fails the run with `timeout`.
    pub deadline: Option<Duration>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            trigger: RunTrigger::Manual,
            include_files: false,
            deadline: None,
        }
    }
}

#[derive(Clone)]
pub struct BackupService {
    repo: Arc<dyn BackupRepository>,
    dump: Arc<dyn DumpTool>,
    hooks: Arc<dyn SystemHooks>,
    config: Arc<BackupConfig>,
    pipeline: PipelineGuard,
    downloads: DownloadTracker,
}

/// A sealed container waiting to be moved into storage.
struct SealedContainer {
    file: NamedTempFile,
    checksum: String,
    size: u64,
    manifest: Manifest,
}

impl BackupService {
    /// Prepare storage and sweep operations interrupted by a previous
    /// process before accepting work.
    pub async fn start(
        repo: Arc<dyn BackupRepository>,
        dump: Arc<dyn DumpTool>,
        hooks: Arc<dyn SystemHooks>,
        config: BackupConfig,
    ) -> Result<Self> {
        let service = Self::open(repo, dump, hooks, config).await?;
        let swept = service
            .db(|repo| {
                repo.reset_running_operations(RECOVERED_CODE, "Interrupted by a process restart")
            })
            .await?;
        if swept > 0 {
            warn!(rows = swept, "Marked interrupted backup operations as failed");
        }
        info!(storage_dir = %service.config.storage_dir.display(), "Backup service ready");
        Ok(service)
    }

    /// Prepare storage without crash recovery, for short-lived callers that
    /// may run beside a long-lived host process.
    pub async fn open(
        repo: Arc<dyn BackupRepository>,
        dump: Arc<dyn DumpTool>,
        hooks: Arc<dyn SystemHooks>,
        config: BackupConfig,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage_dir)
            .await
            .map_err(|e| BackupError::StorageUnavailable(e.to_string()))?;

        Ok(Self {
            repo,
            dump,
            hooks,
            config: Arc::new(config),
            pipeline: PipelineGuard::new(),
            downloads: DownloadTracker::new(),
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &PipelineGuard {
        &self.pipeline
    }

    pub fn downloads(&self) -> &DownloadTracker {
        &self.downloads
    }

    /// Run a repository call on the blocking pool.
    pub(crate) async fn db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn BackupRepository) -> anyhow::Result<T> + Send + 'static,
    {
        let repo = self.repo.clone();
        let value = tokio::task::spawn_blocking(move || f(repo.as_ref()))
            .await
            .map_err(|e| BackupError::Internal(e.into()))??;
        Ok(value)
    }

    /// Take the pipeline slot, then confirm no maintenance window and no
    /// durable in-flight operation.
    pub(crate) async fn begin_pipeline(&self, operation: &'static str) -> Result<PipelineToken> {
        let token = self.pipeline.begin_run(operation)?;
        let (maintenance, busy) = self
            .db(|repo| {
                let maintenance = repo.get_maintenance()?;
                let busy = repo.has_running_backup()? || repo.has_running_restore()?;
                Ok((maintenance, busy))
            })
            .await?;
        if maintenance.enabled {
            return Err(BackupError::MaintenanceActive);
        }
        if busy {
            return Err(BackupError::Concurrent);
        }
        Ok(token)
    }

    // ---- create ----

    pub async fn create_backup(&self) -> Result<BackupArtifact> {
        self.create_backup_with_options(BackupOptions::default()).await
    }

    pub async fn create_backup_with_options(&self, opts: BackupOptions) -> Result<BackupArtifact> {
        let token = self.begin_pipeline("create_backup").await?;
        let key = self.config.key()?;

        let now = Utc::now();
        let mut artifact = BackupArtifact::queued(container_filename("backup", now), ArtifactOrigin::Local, now);
        let mut run = BackupRun::queued(&artifact.id, opts.trigger, now);
        artifact.mark_running(now);
        run.mark_running(now);
        {
            let (a, r) = (artifact.clone(), run.clone());
            self.db(move |repo| {
                repo.create_artifact(&a)?;
                repo.create_backup_run(&r)
            })
            .await?;
        }
        info!(artifact_id = %artifact.id, run_id = %run.id, trigger = opts.trigger.as_str(), "Backup started");

        let produce = self.produce_container(key, opts.include_files);
        let outcome = match opts.deadline {
            Some(limit) => tokio::time::timeout(limit, produce)
                .await
                .unwrap_or(Err(BackupError::Timeout)),
            None => produce.await,
        };
        let outcome = match outcome {
            Ok(sealed) => self
                .persist_container(sealed.file, &artifact.filename)
                .await
                .map(|path| (path, sealed.checksum, sealed.size, sealed.manifest)),
            Err(err) => Err(err),
        };

        let now = Utc::now();
        let result = match outcome {
            Ok((path, checksum, size, manifest)) => {
                artifact.metadata = serde_json::json!({ "manifest": manifest });
                artifact.mark_success(path.display().to_string(), checksum, size as i64, now);
                run.mark_success(now);
                info!(artifact_id = %artifact.id, size, "Backup finished");
                Ok(())
            }
            Err(err) => {
                let failure = FailureInfo::from(&err);
                artifact.mark_failed(&failure, now);
                run.mark_failed(&failure, now);
                error!(artifact_id = %artifact.id, code = err.code(), "Backup failed: {err}");
                Err(err)
            }
        };

        let (a, r) = (artifact.clone(), run.clone());
        let saved = self
            .db(move |repo| {
                repo.update_artifact(&a)?;
                repo.update_backup_run(&r)
            })
            .await;
        self.pipeline.end_run(token);

        result?;
        saved?;
        Ok(artifact)
    }

    /// Dump the database and seal it into a temp container inside storage.
    async fn produce_container(&self, key: EncryptionKey, include_files: bool) -> Result<SealedContainer> {
        let workdir = self.workdir("dump")?;
        let dump_path = workdir.path().join(DUMP_MEMBER);
        self.dump.dump(&dump_path).await?;

        let manifest = Manifest {
            format_version: PAYLOAD_FORMAT_VERSION,
            created_at: Utc::now(),
            app_version: self.config.app_version.clone(),
            db_engine: self.config.db_engine.clone(),
            schema_version: self.config.schema_version,
            include_files,
        };
        let storage_dir = self.config.storage_dir.clone();
        let chunk_size = self.config.chunk_size;

        let sealed = tokio::task::spawn_blocking(move || -> Result<SealedContainer> {
            let mut file = NamedTempFile::new_in(&storage_dir)
                .map_err(|e| BackupError::StorageUnavailable(e.to_string()))?;
            let checksum = {
                let out = hashing_writer(BufWriter::new(file.as_file_mut()));
                let container = ContainerWriter::new(out, &key, chunk_size)?;
                let (container, _) =
                    build_payload(container, &manifest, &dump_path).map_err(CryptoError::from_io)?;
                let out = container.finish()?;
                let (buffered, checksum) = finish_hashing_writer(out);
                buffered.into_inner().map_err(|e| e.into_error())?;
                checksum
            };
            file.as_file().sync_all()?;
            let size = file.as_file().metadata()?.len();
            drop(workdir);
            Ok(SealedContainer {
                file,
                checksum,
                size,
                manifest,
            })
        })
        .await
        .map_err(|e| BackupError::Internal(e.into()))??;
        Ok(sealed)
    }

    /// Atomically move a verified temp file into storage as `filename`.
    async fn persist_container(&self, file: NamedTempFile, filename: &str) -> Result<PathBuf> {
        let path = self.config.storage_dir.join(filename);
        let target = path.clone();
        tokio::task::spawn_blocking(move || file.persist(&target))
            .await
            .map_err(|e| BackupError::Internal(e.into()))?
            .map_err(|e| BackupError::StorageUnavailable(e.error.to_string()))?;
        Ok(path)
    }

    pub(crate) fn workdir(&self, purpose: &str) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(&format!(".{purpose}-"))
            .tempdir_in(&self.config.storage_dir)
            .map_err(|e| BackupError::StorageUnavailable(e.to_string()))
    }

    // ---- import ----

    /// Accept an externally produced container. Nothing reaches storage or
    /// the repository unless every check passes.
    pub async fn import_backup<R>(&self, mut upload: R, original_name: Option<&str>) -> Result<BackupArtifact>
    where
        R: AsyncRead + Unpin + Send,
    {
        let token = self.begin_pipeline("import_backup").await?;

        let (tmp, checksum, size) = self.receive_upload(&mut upload).await?;
        let config = self.config.clone();
        let (tmp, manifest) = tokio::task::spawn_blocking(move || verify_import(tmp, &config))
            .await
            .map_err(|e| BackupError::Internal(e.into()))??;

        let now = Utc::now();
        let filename = container_filename("imported", now);
        let path = self.persist_container(tmp, &filename).await?;

        let mut artifact = BackupArtifact::queued(filename, ArtifactOrigin::Imported, now);
        artifact.metadata = serde_json::json!({
            "manifest": manifest,
            "original_filename": original_name,
        });
        artifact.mark_success(path.display().to_string(), checksum, size as i64, now);
        let mut run = BackupRun::queued(&artifact.id, RunTrigger::Import, now);
        run.mark_running(now);
        run.mark_success(now);

        let (a, r) = (artifact.clone(), run.clone());
        let recorded = self
            .db(move |repo| {
                repo.create_artifact(&a)?;
                repo.create_backup_run(&r)
            })
            .await;
        self.pipeline.end_run(token);

        if let Err(err) = recorded {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), "Failed to remove unrecorded import: {e}");
            }
            return Err(err);
        }
        info!(artifact_id = %artifact.id, size, "Backup imported");
        Ok(artifact)
    }

    /// Copy the upload into a temp file under the byte cap, hashing it.
    async fn receive_upload<R>(&self, upload: &mut R) -> Result<(NamedTempFile, String, u64)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let limit = self.config.max_upload_bytes;
        let tmp = NamedTempFile::new_in(&self.config.storage_dir)
            .map_err(|e| BackupError::StorageUnavailable(e.to_string()))?;
        let mut out = tokio::fs::File::from_std(tmp.reopen()?);

        let mut hasher = Sha256::new();
        let mut total: u64 = 0;
        let mut buf = vec![0u8; UPLOAD_BUFFER];
        loop {
            let n = upload.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > limit {
                return Err(BackupError::UploadTooLarge { limit });
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
        }
        out.flush().await?;
        out.sync_all().await?;

        if total == 0 {
            return Err(BackupError::InvalidFormat("upload is empty".into()));
        }
        Ok((tmp, hex::encode(hasher.finalize()), total))
    }

    // ---- download / delete ----

    /// Open a finished container for reading. The artifact counts as busy
    /// until the returned reader is dropped.
    pub async fn download_artifact(&self, id: &str) -> Result<ArtifactDownload> {
        let lease = self.downloads.acquire(id)?;
        let artifact = self.get_artifact(id).await?;
        if artifact.status != OperationStatus::Success {
            return Err(BackupError::NotReady);
        }
        let path = artifact.storage_path.clone().ok_or(BackupError::FileMissing)?;

        let file = tokio::fs::File::open(&path).await.map_err(open_error)?;
        let size = file.metadata().await.map_err(open_error)?.len();
        Ok(ArtifactDownload::new(artifact, size, file, lease))
    }

    /// Remove a backup's file and row. Downloads of the same id are refused
    /// until this returns.
    pub async fn delete_backup(&self, id: &str) -> Result<()> {
        let _claim = self.downloads.claim_delete(id)?;
        let artifact = self.get_artifact(id).await?;
        if artifact.status.is_active() {
            return Err(BackupError::Concurrent);
        }

        if let Some(path) = artifact.storage_path.as_deref() {
            remove_container(Path::new(path)).await;
        }
        let owned = id.to_string();
        self.db(move |repo| repo.delete_artifact(&owned)).await?;
        info!(artifact_id = %id, "Backup deleted");
        Ok(())
    }

    // ---- inspection ----

    pub async fn list_artifacts(&self) -> Result<Vec<BackupArtifact>> {
        self.db(|repo| repo.list_artifacts()).await
    }

    pub async fn get_artifact(&self, id: &str) -> Result<BackupArtifact> {
        let owned = id.to_string();
        self.db(move |repo| repo.get_artifact(&owned))
            .await?
            .ok_or(BackupError::NotFound)
    }

    pub async fn list_backup_runs(&self, limit: usize) -> Result<Vec<BackupRun>> {
        self.db(move |repo| repo.list_backup_runs(limit)).await
    }

    pub async fn list_restore_runs(&self, limit: usize) -> Result<Vec<RestoreRun>> {
        self.db(move |repo| repo.list_restore_runs(limit)).await
    }

    pub async fn get_restore_run(&self, id: &str) -> Result<RestoreRun> {
        let owned = id.to_string();
        self.db(move |repo| repo.get_restore_run(&owned))
            .await?
            .ok_or(BackupError::NotFound)
    }

    pub async fn maintenance_state(&self) -> Result<MaintenanceState> {
        self.db(|repo| repo.get_maintenance()).await
    }

    // ---- plan ----

    pub async fn get_plan(&self) -> Result<BackupPlan> {
        self.db(|repo| repo.get_plan()).await
    }

    pub async fn update_plan(&self, update: PlanUpdate) -> Result<BackupPlan> {
        let current = self.get_plan().await?;
        let next = update.apply(&current, Utc::now())?;
        let saved = next.clone();
        self.db(move |repo| repo.save_plan(&saved)).await?;
        info!(
            enabled = next.enabled,
            schedule = next.schedule_type.as_str(),
            "Backup plan updated"
        );
        Ok(next)
    }
}

/// `<prefix>-YYYYmmdd-HHMMSS-<8 hex>.bscc`
fn container_filename(prefix: &str, now: DateTime<Utc>) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}-{}.bscc", now.format("%Y%m%d-%H%M%S"), &id[..8])
}

fn open_error(err: io::Error) -> BackupError {
    match err.kind() {
        io::ErrorKind::NotFound => BackupError::FileMissing,
        _ => BackupError::CannotOpenFile(err),
    }
}

/// Remove a container file. Already-missing files are fine.
pub(crate) async fn remove_container(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove backup file: {e}"),
    }
}

/// Codec failures surface through the tar reader as I/O errors.
pub(crate) fn extract_error(err: ExtractError) -> BackupError {
    match err {
        ExtractError::Io(e) => CryptoError::from_io(e).into(),
        other => other.into(),
    }
}

/// Header, key, decryption, payload layout and checksums of an upload.
fn verify_import(mut tmp: NamedTempFile, config: &BackupConfig) -> Result<(NamedTempFile, Manifest)> {
    let file = tmp.as_file_mut();
    file.seek(SeekFrom::Start(0))?;
    ContainerHeader::read_from(BufReader::new(&mut *file))
        .and_then(|header| header.validate())
        .map_err(|e| match e {
            CryptoError::Io(io) => BackupError::Internal(io.into()),
            other => BackupError::InvalidFormat(other.to_string()),
        })?;

    let key = config.key()?;
    file.seek(SeekFrom::Start(0))?;

    let workdir = tempfile::Builder::new()
        .prefix(".import-")
        .tempdir_in(&config.storage_dir)
        .map_err(|e| BackupError::StorageUnavailable(e.to_string()))?;
    let mut reader = ContainerReader::new(BufReader::new(&mut *file), &key)?;
    let payload = extract_payload(&mut reader, &workdir.path().join(DUMP_MEMBER)).map_err(extract_error)?;
    io::copy(&mut reader, &mut io::sink()).map_err(CryptoError::from_io)?;

    let mismatches = payload.mismatches();
    if !mismatches.is_empty() {
        return Err(BackupError::ChecksumImport(mismatches.join(", ")));
    }
    let manifest = payload.manifest;
    if manifest.format_version != PAYLOAD_FORMAT_VERSION {
        return Err(BackupError::InvalidFormat(format!(
            "unsupported payload format version {}",
            manifest.format_version
        )));
    }
    if manifest.db_engine != config.db_engine {
        return Err(BackupError::InvalidFormat(format!(
            "backup is for database engine {:?}",
            manifest.db_engine
        )));
    }
    drop(reader);
    Ok((tmp, manifest))
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;
