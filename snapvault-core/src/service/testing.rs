//! Fakes for service tests.

use super::BackupService;
use crate::config::BackupConfig;
use crate::dump::DumpTool;
use crate::error::BackupError;
use crate::hooks::SystemHooks;
use crate::repository::{BackupRepository, MemoryRepository};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const TEST_KEY: &str = "correct horse battery staple, long enough for a key";

/// Writes a fixed dump and remembers what it was asked to restore.
pub struct FakeDump {
    pub content: Vec<u8>,
    pub fail_dump: AtomicBool,
    pub fail_restore: AtomicBool,
    pub restored: Mutex<Option<Vec<u8>>>,
}

impl FakeDump {
    pub fn new() -> Self {
        Self {
            content: (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect(),
            fail_dump: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            restored: Mutex::new(None),
        }
    }

    pub fn restored(&self) -> Option<Vec<u8>> {
        self.restored.lock().unwrap().clone()
    }
}

#[async_trait]
impl DumpTool for FakeDump {
    async fn dump(&self, path: &Path) -> Result<(), BackupError> {
        if self.fail_dump.load(Ordering::SeqCst) {
            return Err(BackupError::PgDumpFailed("connection refused".into()));
        }
        tokio::fs::write(path, &self.content).await?;
        Ok(())
    }

    async fn restore(&self, path: &Path) -> Result<(), BackupError> {
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(BackupError::PgRestoreFailed("relation already exists".into()));
        }
        let bytes = tokio::fs::read(path).await?;
        *self.restored.lock().unwrap() = Some(bytes);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHooks {
    pub stopped: AtomicUsize,
    pub resumed: AtomicUsize,
    pub migrations: AtomicUsize,
}

#[async_trait]
impl SystemHooks for RecordingHooks {
    async fn stop_background_jobs(&self) -> Result<(), BackupError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume_background_jobs(&self) -> Result<(), BackupError> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), BackupError> {
        self.migrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub service: BackupService,
    pub repo: Arc<MemoryRepository>,
    pub dump: Arc<FakeDump>,
    pub hooks: Arc<RecordingHooks>,
    pub dir: tempfile::TempDir,
}

pub fn test_config(dir: &Path) -> BackupConfig {
    let mut config = BackupConfig::new(dir.join("backups")).with_key(TEST_KEY);
    config.chunk_size = 4096;
    config.schema_version = 3;
    config
}

pub async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    harness_with(dir, Arc::new(MemoryRepository::new()), config).await
}

pub async fn harness_with(dir: tempfile::TempDir, repo: Arc<MemoryRepository>, config: BackupConfig) -> Harness {
    let dump = Arc::new(FakeDump::new());
    let hooks = Arc::new(RecordingHooks::default());
    let service = BackupService::start(
        repo.clone() as Arc<dyn BackupRepository>,
        dump.clone(),
        hooks.clone(),
        config,
    )
    .await
    .unwrap();
    Harness {
        service,
        repo,
        dump,
        hooks,
        dir,
    }
}

/// Container files currently in storage.
pub fn stored_containers(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".bscc"))
        .collect();
    names.sort();
    names
}

/// Any leftover temp files or work directories in storage.
pub fn stray_entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.ends_with(".bscc"))
        .collect()
}
