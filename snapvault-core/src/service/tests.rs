use super::testing::*;
use super::*;
use crate::crypto::container::{MAGIC, NONCE_LEN, TAG_LEN};
use crate::crypto::encrypt_stream;
use crate::models::{RestoreStep, ScheduleType};
use crate::payload::{sha256_hex, Checksums, CHECKSUMS_MEMBER, MANIFEST_MEMBER};
use chrono::Duration as ChronoDuration;
use std::sync::atomic::Ordering;

async fn read_download(service: &BackupService, id: &str) -> Vec<u8> {
    let mut download = service.download_artifact(id).await.unwrap();
    let mut bytes = Vec::new();
    download.read_to_end(&mut bytes).await.unwrap();
    bytes
}

fn manifest(schema_version: i64) -> Manifest {
    Manifest {
        format_version: PAYLOAD_FORMAT_VERSION,
        created_at: Utc::now(),
        app_version: "1.0.0".into(),
        db_engine: "postgres".into(),
        schema_version,
        include_files: false,
    }
}

/// Hand-assembled container, so the payload can lie about its checksums.
fn forged_container(manifest: &Manifest, dump: &[u8], checksums: &Checksums) -> Vec<u8> {
    let manifest_bytes = serde_json::to_vec(manifest).unwrap();
    let checksum_bytes = serde_json::to_vec(checksums).unwrap();
    let mut builder = tar::Builder::new(Vec::new());
    for (name, bytes) in [
        (MANIFEST_MEMBER, manifest_bytes.as_slice()),
        (DUMP_MEMBER, dump),
        (CHECKSUMS_MEMBER, checksum_bytes.as_slice()),
    ] {
        let mut header = tar::Header::new_ustar();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o600);
        builder.append_data(&mut header, name, bytes).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let key = EncryptionKey::derive(TEST_KEY.as_bytes()).unwrap();
    let mut out = Vec::new();
    encrypt_stream(&key, tar.as_slice(), &mut out, 4096).unwrap();
    out
}

// ---- create / download / delete ----

#[tokio::test]
async fn test_create_backup_stores_verified_container() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();

    assert_eq!(artifact.status, OperationStatus::Success);
    assert!(artifact.is_consistent());
    assert_eq!(artifact.origin, ArtifactOrigin::Local);
    assert!(artifact.filename.starts_with("backup-") && artifact.filename.ends_with(".bscc"));
    assert_eq!(artifact.metadata["manifest"]["schema_version"], 3);

    let storage = h.service.config().storage_dir.clone();
    assert_eq!(stored_containers(&storage), [artifact.filename.clone()]);
    assert!(stray_entries(&storage).is_empty());

    let bytes = read_download(&h.service, &artifact.id).await;
    assert_eq!(bytes.len() as i64, artifact.size_bytes);
    assert_eq!(Some(sha256_hex(&bytes)), artifact.checksum);
    assert_eq!(&bytes[..4], b"BSCC");

    let runs = h.service.list_backup_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, OperationStatus::Success);
    assert_eq!(runs[0].trigger, RunTrigger::Manual);
}

#[tokio::test]
async fn test_dump_failure_recorded_on_artifact_and_run() {
    let h = harness().await;
    h.dump.fail_dump.store(true, Ordering::SeqCst);

    let err = h.service.create_backup().await.unwrap_err();
    assert_eq!(err.code(), "pg_dump_failed");

    let artifacts = h.service.list_artifacts().await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].status, OperationStatus::Failed);
    assert_eq!(artifacts[0].error_code.as_deref(), Some("pg_dump_failed"));
    assert!(artifacts[0].is_consistent());
    let runs = h.service.list_backup_runs(10).await.unwrap();
    assert_eq!(runs[0].error_code.as_deref(), Some("pg_dump_failed"));

    let storage = h.service.config().storage_dir.clone();
    assert!(stored_containers(&storage).is_empty());
    assert!(stray_entries(&storage).is_empty());
    assert!(!h.service.pipeline().is_held());
}

#[tokio::test]
async fn test_missing_key_refuses_backup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.encryption_key = None;
    let h = harness_with(dir, Arc::new(crate::repository::MemoryRepository::new()), config).await;

    let err = h.service.create_backup().await.unwrap_err();
    assert!(matches!(err, BackupError::InvalidEncKey));
    assert!(h.service.list_artifacts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_blocked_while_download_open() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();

    let download = h.service.download_artifact(&artifact.id).await.unwrap();
    let second = h.service.download_artifact(&artifact.id).await.unwrap();
    assert_eq!(h.service.downloads().open_count(&artifact.id), 2);
    assert!(matches!(h.service.delete_backup(&artifact.id).await, Err(BackupError::FileBusy)));

    drop(download);
    assert!(matches!(h.service.delete_backup(&artifact.id).await, Err(BackupError::FileBusy)));
    drop(second);

    h.service.delete_backup(&artifact.id).await.unwrap();
    assert!(stored_containers(&h.service.config().storage_dir).is_empty());
    assert!(matches!(h.service.get_artifact(&artifact.id).await, Err(BackupError::NotFound)));
    assert!(matches!(h.service.delete_backup(&artifact.id).await, Err(BackupError::NotFound)));
}

#[tokio::test]
async fn test_delete_tolerates_missing_file() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();
    std::fs::remove_file(artifact.storage_path.as_ref().unwrap()).unwrap();

    assert!(matches!(
        h.service.download_artifact(&artifact.id).await,
        Err(BackupError::FileMissing)
    ));
    assert_eq!(h.service.downloads().open_count(&artifact.id), 0);
    h.service.delete_backup(&artifact.id).await.unwrap();
}

#[tokio::test]
async fn test_download_refused_while_delete_in_progress() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();

    let claim = h.service.downloads().claim_delete(&artifact.id).unwrap();
    assert!(matches!(h.service.download_artifact(&artifact.id).await, Err(BackupError::FileBusy)));
    assert!(matches!(h.service.delete_backup(&artifact.id).await, Err(BackupError::FileBusy)));
    assert_eq!(h.service.downloads().open_count(&artifact.id), 0);
    drop(claim);

    assert_eq!(read_download(&h.service, &artifact.id).await.len() as i64, artifact.size_bytes);
    assert!(!h.service.downloads().is_busy(&artifact.id));
}

#[tokio::test]
async fn test_concurrent_delete_and_download_never_overlap() {
    let h = harness().await;
    for round in 0..6 {
        let artifact = h.service.create_backup().await.unwrap();
        let id = artifact.id.as_str();
        let (deleted, download) = if round % 2 == 0 {
            tokio::join!(h.service.delete_backup(id), h.service.download_artifact(id))
        } else {
            let (download, deleted) = tokio::join!(h.service.download_artifact(id), h.service.delete_backup(id));
            (deleted, download)
        };

        match (deleted, download) {
            (Ok(()), Ok(_)) => panic!("round {round}: download open on a deleted backup"),
            (Ok(()), Err(err)) => {
                assert!(matches!(err, BackupError::FileBusy | BackupError::NotFound), "round {round}: {err:?}");
                assert!(matches!(h.service.get_artifact(id).await, Err(BackupError::NotFound)));
            }
            (Err(err), Ok(mut download)) => {
                assert!(matches!(err, BackupError::FileBusy), "round {round}: {err:?}");
                let mut bytes = Vec::new();
                download.read_to_end(&mut bytes).await.unwrap();
                assert_eq!(bytes.len() as u64, download.size);
                drop(download);
                h.service.delete_backup(id).await.unwrap();
            }
            (Err(a), Err(b)) => panic!("round {round}: both failed: {a:?} / {b:?}"),
        }
    }
    assert!(stored_containers(&h.service.config().storage_dir).is_empty());
}

#[tokio::test]
async fn test_download_requires_success() {
    let h = harness().await;
    h.dump.fail_dump.store(true, Ordering::SeqCst);
    let _ = h.service.create_backup().await;
    let failed = h.service.list_artifacts().await.unwrap().remove(0);

    assert!(matches!(h.service.download_artifact(&failed.id).await, Err(BackupError::NotReady)));
    assert!(matches!(h.service.download_artifact("nope").await, Err(BackupError::NotFound)));
}

// ---- pipeline exclusivity ----

#[tokio::test]
async fn test_pipeline_held_rejects_backup_import_and_restore() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();

    let token = h.service.pipeline().begin_run("create_backup").unwrap();
    assert!(matches!(h.service.pipeline().begin_run("create_backup"), Err(BackupError::Concurrent)));
    assert!(matches!(h.service.create_backup().await, Err(BackupError::Concurrent)));
    assert!(matches!(h.service.start_restore(&artifact.id).await, Err(BackupError::Concurrent)));
    assert!(matches!(
        h.service.import_backup(&b"BSCC"[..], None).await,
        Err(BackupError::Concurrent)
    ));
    h.service.pipeline().end_run(token);

    let ticket = h.service.start_restore_dry_run(&artifact.id).await.unwrap();
    ticket.wait().await.unwrap();
}

#[tokio::test]
async fn test_durable_running_row_rejects_new_work() {
    let h = harness().await;
    let now = Utc::now();
    let mut stuck = BackupArtifact::queued("stuck.bscc".into(), ArtifactOrigin::Local, now);
    stuck.mark_running(now);
    h.repo.create_artifact(&stuck).unwrap();

    assert!(matches!(h.service.create_backup().await, Err(BackupError::Concurrent)));
    assert!(!h.service.pipeline().is_held());
    assert!(matches!(h.service.delete_backup(&stuck.id).await, Err(BackupError::Concurrent)));
}

#[tokio::test]
async fn test_maintenance_blocks_backup() {
    let h = harness().await;
    h.repo
        .set_maintenance(&MaintenanceState::for_restore("r1", Utc::now()))
        .unwrap();
    assert!(matches!(h.service.create_backup().await, Err(BackupError::MaintenanceActive)));
}

#[tokio::test]
async fn test_start_recovers_interrupted_rows() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(crate::repository::MemoryRepository::new());
    let now = Utc::now();
    let mut artifact = BackupArtifact::queued("a.bscc".into(), ArtifactOrigin::Local, now);
    artifact.mark_running(now);
    repo.create_artifact(&artifact).unwrap();
    let mut restore = RestoreRun::queued(&artifact.id, false, now);
    restore.mark_running(now);
    repo.create_restore_run(&restore).unwrap();

    let config = test_config(dir.path());
    let h = harness_with(dir, repo, config).await;

    let artifact = h.service.get_artifact(&artifact.id).await.unwrap();
    assert_eq!(artifact.status, OperationStatus::Failed);
    assert_eq!(artifact.error_code.as_deref(), Some(RECOVERED_CODE));
    let restore = h.service.get_restore_run(&restore.id).await.unwrap();
    assert_eq!(restore.error_code.as_deref(), Some(RECOVERED_CODE));

    h.service.create_backup().await.unwrap();
}

#[tokio::test]
async fn test_open_leaves_running_rows_alone() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(crate::repository::MemoryRepository::new());
    let now = Utc::now();
    let mut artifact = BackupArtifact::queued("a.bscc".into(), ArtifactOrigin::Local, now);
    artifact.mark_running(now);
    repo.create_artifact(&artifact).unwrap();

    let service = BackupService::open(
        repo.clone(),
        Arc::new(FakeDump::new()),
        Arc::new(crate::hooks::NoopHooks),
        test_config(dir.path()),
    )
    .await
    .unwrap();
    assert_eq!(
        service.get_artifact(&artifact.id).await.unwrap().status,
        OperationStatus::Running
    );
    assert!(matches!(service.create_backup().await, Err(BackupError::Concurrent)));
}

// ---- import ----

#[tokio::test]
async fn test_import_round_trip() {
    let source = harness().await;
    let original = source.service.create_backup().await.unwrap();
    let bytes = read_download(&source.service, &original.id).await;

    let target = harness().await;
    let imported = target
        .service
        .import_backup(bytes.as_slice(), Some("nightly.bscc"))
        .await
        .unwrap();
    assert_eq!(imported.origin, ArtifactOrigin::Imported);
    assert_eq!(imported.status, OperationStatus::Success);
    assert_eq!(imported.checksum, original.checksum);
    assert_eq!(imported.metadata["original_filename"], "nightly.bscc");
    assert!(imported.filename.starts_with("imported-"));

    let runs = target.service.list_backup_runs(10).await.unwrap();
    assert_eq!(runs[0].trigger, RunTrigger::Import);

    let storage = target.service.config().storage_dir.clone();
    assert_eq!(stored_containers(&storage).len(), 1);
    assert!(stray_entries(&storage).is_empty());
}

#[tokio::test]
async fn test_import_rejects_empty_and_oversized() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.max_upload_bytes = 64;
    let h = harness_with(dir, Arc::new(crate::repository::MemoryRepository::new()), config).await;

    let err = h.service.import_backup(&b""[..], None).await.unwrap_err();
    assert!(matches!(err, BackupError::InvalidFormat(_)));

    let big = vec![7u8; 65];
    let err = h.service.import_backup(big.as_slice(), None).await.unwrap_err();
    assert!(matches!(err, BackupError::UploadTooLarge { limit: 64 }));

    let storage = h.service.config().storage_dir.clone();
    assert!(stored_containers(&storage).is_empty());
    assert!(stray_entries(&storage).is_empty());
    assert!(h.service.list_artifacts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_import_rejects_garbage_and_bad_versions() {
    let h = harness().await;
    let err = h.service.import_backup(&b"not a container at all"[..], None).await.unwrap_err();
    assert_eq!(err.code(), "invalid_format");

    let source = harness().await;
    let original = source.service.create_backup().await.unwrap();
    let mut bytes = read_download(&source.service, &original.id).await;
    bytes[5] = 9;
    let err = h.service.import_backup(bytes.as_slice(), None).await.unwrap_err();
    assert_eq!(err.code(), "invalid_format");
}

#[tokio::test]
async fn test_import_with_wrong_key_fails_to_decrypt() {
    let source = harness().await;
    let original = source.service.create_backup().await.unwrap();
    let bytes = read_download(&source.service, &original.id).await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path()).with_key("a different key that is also long enough!!");
    let h = harness_with(dir, Arc::new(crate::repository::MemoryRepository::new()), config).await;

    let err = h.service.import_backup(bytes.as_slice(), None).await.unwrap_err();
    assert!(
        matches!(err, BackupError::DecryptFailed | BackupError::InvalidEncKey),
        "unexpected {err:?}"
    );
    let storage = h.service.config().storage_dir.clone();
    assert!(stored_containers(&storage).is_empty());
    assert!(stray_entries(&storage).is_empty());
}

#[tokio::test]
async fn test_import_with_tampered_checksums() {
    let h = harness().await;
    let dump = b"pretend this is a database".to_vec();
    let manifest = manifest(1);
    let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
    let lying = Checksums {
        manifest_sha256: sha256_hex(&manifest_bytes),
        db_dump_sha256: sha256_hex(b"something else"),
    };

    let err = h
        .service
        .import_backup(forged_container(&manifest, &dump, &lying).as_slice(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::ChecksumImport(ref parts) if parts == DUMP_MEMBER));

    let honest = Checksums {
        manifest_sha256: sha256_hex(&manifest_bytes),
        db_dump_sha256: sha256_hex(&dump),
    };
    let artifact = h
        .service
        .import_backup(forged_container(&manifest, &dump, &honest).as_slice(), None)
        .await
        .unwrap();
    assert_eq!(artifact.metadata["manifest"]["schema_version"], 1);
}

#[tokio::test]
async fn test_import_rejects_other_engine() {
    let h = harness().await;
    let dump = b"mysql".to_vec();
    let mut manifest = manifest(1);
    manifest.db_engine = "mysql".into();
    let checksums = Checksums {
        manifest_sha256: sha256_hex(&serde_json::to_vec(&manifest).unwrap()),
        db_dump_sha256: sha256_hex(&dump),
    };
    let err = h
        .service
        .import_backup(forged_container(&manifest, &dump, &checksums).as_slice(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_format");
}

// ---- restore ----

#[tokio::test]
async fn test_container_cut_at_chunk_boundary_is_invalid_format() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();
    let path = artifact.storage_path.clone().unwrap();
    let bytes = std::fs::read(&path).unwrap();

    // Whole chunks only, so every remaining chunk still authenticates.
    let header_len = MAGIC.len() + 3 + NONCE_LEN + 4;
    let frame_len = 4 + 4096 + TAG_LEN;
    let cut = bytes[..header_len + 3 * frame_len].to_vec();
    assert!(cut.len() < bytes.len());

    let target = harness().await;
    let err = target.service.import_backup(cut.as_slice(), None).await.unwrap_err();
    assert_eq!(err.code(), "invalid_format", "{err}");
    let storage = target.service.config().storage_dir.clone();
    assert!(stored_containers(&storage).is_empty());
    assert!(stray_entries(&storage).is_empty());
    assert!(target.service.list_artifacts().await.unwrap().is_empty());

    std::fs::write(&path, &cut).unwrap();
    let run = h.service.start_restore_dry_run(&artifact.id).await.unwrap().wait().await.unwrap();
    assert_eq!(run.status, OperationStatus::Failed);
    assert_eq!(run.error_code.as_deref(), Some("invalid_format"));
    let step = |s| run.steps.get(s).unwrap().status;
    assert_eq!(step(RestoreStep::DecryptBscc), OperationStatus::Success);
    assert_eq!(step(RestoreStep::VerifyChecksums), OperationStatus::Failed);
    assert_eq!(step(RestoreStep::ReadManifest), OperationStatus::Queued);
}

#[tokio::test]
async fn test_dry_run_verifies_without_touching_live_system() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();

    let ticket = h.service.start_restore_dry_run(&artifact.id).await.unwrap();
    assert_eq!(ticket.run.status, OperationStatus::Queued);
    assert!(ticket.run.dry_run());
    let run = ticket.wait().await.unwrap();

    assert_eq!(run.status, OperationStatus::Success, "{run:?}");
    assert_eq!(run.steps.order(), RestoreStep::sequence(true));
    assert!(run.steps.iter().all(|s| s.status == OperationStatus::Success));
    assert!(h.dump.restored().is_none());
    assert_eq!(h.hooks.stopped.load(Ordering::SeqCst), 0);
    assert!(!h.service.maintenance_state().await.unwrap().enabled);

    let stored = h.service.get_restore_run(&run.id).await.unwrap();
    assert_eq!(stored, run);
    assert!(!h.service.pipeline().is_held());
    assert!(stray_entries(&h.service.config().storage_dir).is_empty());
}

#[tokio::test]
async fn test_real_restore_replays_dump_and_migrates() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();

    // Same storage and repository, newer live schema.
    let mut config = test_config(h.dir.path());
    config.schema_version = 4;
    let newer = BackupService::start(h.repo.clone(), h.dump.clone(), h.hooks.clone(), config)
        .await
        .unwrap();

    let run = newer.start_restore(&artifact.id).await.unwrap().wait().await.unwrap();
    assert_eq!(run.status, OperationStatus::Success, "{run:?}");
    assert_eq!(run.steps.order(), RestoreStep::sequence(false));
    assert_eq!(h.dump.restored().as_deref(), Some(h.dump.content.as_slice()));
    assert_eq!(h.hooks.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(h.hooks.resumed.load(Ordering::SeqCst), 1);
    assert_eq!(h.hooks.migrations.load(Ordering::SeqCst), 1);
    assert!(!newer.maintenance_state().await.unwrap().enabled);

    let check = run.steps.get(RestoreStep::CompatibilityCheck).unwrap();
    assert_eq!(check.detail.as_ref().unwrap()["migrations_needed"], true);
}

#[tokio::test]
async fn test_restore_same_schema_skips_migrations() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();
    let run = h.service.start_restore(&artifact.id).await.unwrap().wait().await.unwrap();
    assert_eq!(run.status, OperationStatus::Success);
    assert_eq!(h.hooks.migrations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tampered_container_fails_decrypt_step() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();
    let path = artifact.storage_path.clone().unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 20;
    bytes[last] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let run = h.service.start_restore(&artifact.id).await.unwrap().wait().await.unwrap();
    assert_eq!(run.status, OperationStatus::Failed);
    assert_eq!(run.error_code.as_deref(), Some("decrypt_failed"));
    let step = |s| run.steps.get(s).unwrap().status;
    assert_eq!(step(RestoreStep::OpenFile), OperationStatus::Success);
    assert_eq!(step(RestoreStep::DecryptBscc), OperationStatus::Failed);
    assert_eq!(step(RestoreStep::VerifyChecksums), OperationStatus::Queued);
    assert_eq!(step(RestoreStep::EnterMaintenance), OperationStatus::Queued);
    assert!(h.dump.restored().is_none());
    assert!(!h.service.maintenance_state().await.unwrap().enabled);
    assert!(stray_entries(&h.service.config().storage_dir).is_empty());
}

#[tokio::test]
async fn test_restore_of_newer_schema_is_incompatible() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();

    let mut config = test_config(h.dir.path());
    config.schema_version = 1;
    let older = BackupService::start(h.repo.clone(), h.dump.clone(), h.hooks.clone(), config)
        .await
        .unwrap();
    let run = older.start_restore_dry_run(&artifact.id).await.unwrap().wait().await.unwrap();
    assert_eq!(run.error_code.as_deref(), Some("incompatible"));
    assert_eq!(
        run.steps.get(RestoreStep::CompatibilityCheck).unwrap().status,
        OperationStatus::Failed
    );
}

#[tokio::test]
async fn test_failed_restore_releases_maintenance_and_resumes_jobs() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();
    h.dump.fail_restore.store(true, Ordering::SeqCst);

    let run = h.service.start_restore(&artifact.id).await.unwrap().wait().await.unwrap();
    assert_eq!(run.status, OperationStatus::Failed);
    assert_eq!(run.error_code.as_deref(), Some("pg_restore_failed"));
    assert_eq!(
        run.steps.get(RestoreStep::ExitMaintenance).unwrap().status,
        OperationStatus::Queued
    );
    assert_eq!(run.metadata["maintenance_released"], true);
    assert_eq!(run.metadata["jobs_resumed"], true);
    assert_eq!(h.hooks.resumed.load(Ordering::SeqCst), 1);
    assert!(!h.service.maintenance_state().await.unwrap().enabled);

    // The system accepts new work afterwards.
    h.dump.fail_restore.store(false, Ordering::SeqCst);
    h.service.create_backup().await.unwrap();
}

#[tokio::test]
async fn test_restore_of_unknown_artifact_fails_first_step() {
    let h = harness().await;
    let run = h.service.start_restore_dry_run("missing").await.unwrap().wait().await.unwrap();
    assert_eq!(run.error_code.as_deref(), Some("not_found"));
    assert_eq!(
        run.steps.get(RestoreStep::LoadArtifact).unwrap().status,
        OperationStatus::Failed
    );
    assert_eq!(run.steps.get(RestoreStep::Finish).unwrap().status, OperationStatus::Queued);
}

#[tokio::test]
async fn test_expired_restore_deadline_fails_current_step() {
    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();

    let opts = RestoreOptions {
        dry_run: true,
        deadline: Some(Duration::ZERO),
    };
    let run = h.service.start_restore_with(&artifact.id, opts).await.unwrap().wait().await.unwrap();
    assert_eq!(run.status, OperationStatus::Failed);
    assert_eq!(run.error_code.as_deref(), Some("timeout"));
    let load = run.steps.get(RestoreStep::LoadArtifact).unwrap();
    assert_eq!(load.status, OperationStatus::Failed);
    assert_eq!(load.error_code.as_deref(), Some("timeout"));
    for later in [RestoreStep::OpenFile, RestoreStep::DecryptBscc, RestoreStep::Finish] {
        assert_eq!(run.steps.get(later).unwrap().status, OperationStatus::Queued);
    }
    assert!(stray_entries(&h.service.config().storage_dir).is_empty());
}

#[tokio::test]
async fn test_hung_database_restore_times_out_and_releases_system() {
    struct HangingRestore;

    #[async_trait::async_trait]
    impl DumpTool for HangingRestore {
        async fn dump(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        async fn restore(&self, _path: &Path) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    let h = harness().await;
    let artifact = h.service.create_backup().await.unwrap();
    let hung = BackupService::start(
        h.repo.clone(),
        Arc::new(HangingRestore),
        h.hooks.clone(),
        test_config(h.dir.path()),
    )
    .await
    .unwrap();

    let opts = RestoreOptions {
        dry_run: false,
        deadline: Some(Duration::from_millis(500)),
    };
    let run = hung.start_restore_with(&artifact.id, opts).await.unwrap().wait().await.unwrap();
    assert_eq!(run.error_code.as_deref(), Some("timeout"));
    let step = |s| run.steps.get(s).unwrap().clone();
    assert_eq!(step(RestoreStep::StopBackgroundJobs).status, OperationStatus::Success);
    assert_eq!(step(RestoreStep::RestoreDatabase).status, OperationStatus::Failed);
    assert_eq!(step(RestoreStep::RestoreDatabase).error_code.as_deref(), Some("timeout"));
    assert_eq!(step(RestoreStep::RunMigrationsIfNeeded).status, OperationStatus::Queued);
    assert_eq!(step(RestoreStep::ExitMaintenance).status, OperationStatus::Queued);

    assert!(!hung.maintenance_state().await.unwrap().enabled);
    assert_eq!(h.hooks.resumed.load(Ordering::SeqCst), 1);
    assert!(!hung.pipeline().is_held());
}

// ---- plan, retention and automation ----

#[tokio::test]
async fn test_update_plan_validates() {
    let h = harness().await;
    let plan = h
        .service
        .update_plan(PlanUpdate {
            schedule_type: Some(ScheduleType::Weekly),
            weekday: Some(3),
            hour: Some(30),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(plan.hour, 23);
    assert_eq!(h.service.get_plan().await.unwrap(), plan);

    let err = h
        .service
        .update_plan(PlanUpdate {
            retention_days: Some(0),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_plan");
}

#[tokio::test]
async fn test_retention_keeps_floor_and_skips_busy() {
    let h = harness().await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(h.service.create_backup().await.unwrap().id);
    }
    h.service
        .update_plan(PlanUpdate {
            retention_days: Some(1),
            keep_last_successful: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    // Hold the oldest open so its deletion fails.
    let busy = h.service.download_artifact(&ids[0]).await.unwrap();
    let report = h
        .service
        .apply_retention(Utc::now() + ChronoDuration::days(10))
        .await
        .unwrap();
    drop(busy);

    assert_eq!(report.kept, 1);
    assert_eq!(report.deleted, [ids[1].clone()]);
    assert_eq!(report.failed, [ids[0].clone()]);
    assert!(h.service.get_artifact(&ids[2]).await.is_ok());
}

#[tokio::test]
async fn test_scheduled_backup_runs_once_per_day() {
    let h = harness().await;
    let now = Utc::now();
    let mut plan = h.service.get_plan().await.unwrap();
    plan.schedule_type = ScheduleType::Daily;
    plan.updated_at = now - ChronoDuration::days(2);
    h.repo.save_plan(&plan).unwrap();

    let first = h.service.run_scheduled_backup_in(&Utc, now).await.unwrap();
    assert!(first.ran());
    assert_eq!(h.service.get_plan().await.unwrap().last_auto_run_at, Some(now));
    assert_eq!(
        h.service.list_backup_runs(1).await.unwrap()[0].trigger,
        RunTrigger::Scheduled
    );

    let again = h
        .service
        .run_scheduled_backup_in(&Utc, now + ChronoDuration::minutes(1))
        .await
        .unwrap();
    assert!(matches!(again, auto::AutoOutcome::Skipped("already_ran_today")));
}

#[tokio::test]
async fn test_scheduled_backup_backs_off_after_failure() {
    let h = harness().await;
    let now = Utc::now();
    let mut plan = h.service.get_plan().await.unwrap();
    plan.updated_at = now - ChronoDuration::days(2);
    h.repo.save_plan(&plan).unwrap();

    h.dump.fail_dump.store(true, Ordering::SeqCst);
    let err = h.service.run_scheduled_backup_in(&Utc, now).await.unwrap_err();
    assert_eq!(err.code(), "pg_dump_failed");

    let retry = h
        .service
        .run_scheduled_backup_in(&Utc, now + ChronoDuration::minutes(1))
        .await
        .unwrap();
    assert!(matches!(retry, auto::AutoOutcome::Skipped("backing_off")));
    assert_eq!(h.service.list_backup_runs(10).await.unwrap().len(), 1);

    h.dump.fail_dump.store(false, Ordering::SeqCst);
    let later = h
        .service
        .run_scheduled_backup_in(&Utc, now + ChronoDuration::minutes(31))
        .await
        .unwrap();
    assert!(later.ran());
}

#[tokio::test]
async fn test_scheduled_backup_respects_disabled_plan_and_maintenance() {
    let h = harness().await;
    let now = Utc::now();
    let mut plan = h.service.get_plan().await.unwrap();
    plan.updated_at = now - ChronoDuration::days(2);
    plan.enabled = false;
    h.repo.save_plan(&plan).unwrap();
    let outcome = h.service.run_scheduled_backup_in(&Utc, now).await.unwrap();
    assert!(matches!(outcome, auto::AutoOutcome::Skipped("disabled")));

    plan.enabled = true;
    h.repo.save_plan(&plan).unwrap();
    h.repo
        .set_maintenance(&MaintenanceState::for_restore("r1", now))
        .unwrap();
    let outcome = h.service.run_scheduled_backup_in(&Utc, now).await.unwrap();
    assert!(matches!(outcome, auto::AutoOutcome::Skipped("maintenance")));
    assert!(h.service.list_artifacts().await.unwrap().is_empty());
    assert_eq!(h.service.get_plan().await.unwrap().last_auto_run_at, None);
}

#[tokio::test]
async fn test_auto_backup_skips_when_pipeline_held() {
    let h = harness().await;
    let _token = h.service.pipeline().begin_run("restore").unwrap();
    let outcome = h.service.run_auto_backup(Utc::now()).await.unwrap();
    assert!(matches!(outcome, auto::AutoOutcome::Skipped("busy")));
}

#[tokio::test]
async fn test_auto_backup_deadline_marks_timeout() {
    struct SlowDump;

    #[async_trait::async_trait]
    impl DumpTool for SlowDump {
        async fn dump(&self, _path: &Path) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn restore(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.auto_deadline = Duration::from_millis(50);
    let repo = Arc::new(crate::repository::MemoryRepository::new());
    let service = BackupService::start(repo, Arc::new(SlowDump), Arc::new(crate::hooks::NoopHooks), config)
        .await
        .unwrap();

    let err = service.run_auto_backup(Utc::now()).await.unwrap_err();
    assert!(matches!(err, BackupError::Timeout));
    let artifact = service.list_artifacts().await.unwrap().remove(0);
    assert_eq!(artifact.error_code.as_deref(), Some("timeout"));
    assert_eq!(service.get_plan().await.unwrap().last_auto_run_at, None);
}

#[tokio::test]
async fn test_auto_restore_test_only_when_overdue() {
    let h = harness().await;
    let now = Utc::now();

    let outcome = h.service.run_auto_restore_test(now).await;
    assert!(matches!(outcome, auto::AutoOutcome::Skipped("not_due")));

    h.service.create_backup().await.unwrap();
    let outcome = h.service.run_auto_restore_test(now).await;
    assert!(matches!(outcome, auto::AutoOutcome::Skipped("not_due")));

    let later = now + ChronoDuration::days(8);
    let before = h.service.integrity_status(later).await.unwrap();
    assert!(before.overdue);
    assert_eq!(before.reason, Some(integrity::REASON_NO_RESTORE_TEST));

    let auto::AutoOutcome::Ran(ticket) = h.service.run_auto_restore_test(later).await else {
        panic!("restore test did not start");
    };
    let run = ticket.wait().await.unwrap();
    assert!(run.dry_run());
    assert_eq!(run.status, OperationStatus::Success);

    let after = h.service.integrity_status(Utc::now()).await.unwrap();
    assert_eq!(after.status, IntegrityLevel::Ok);
    assert!(!after.overdue);
}
