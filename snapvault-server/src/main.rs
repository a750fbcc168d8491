mod config;
mod db;
mod hooks;
mod logger;
mod models;
mod scheduler;

use crate::config::AppConfig;
use crate::db::connection::{close_pool, create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::db::repository::SqliteRepository;
use crate::hooks::{PauseFlag, ServerHooks};
use crate::scheduler::BackupScheduler;
use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use snapvault_core::dump::PgTools;
use snapvault_core::models::{OperationStatus, PlanUpdate, ScheduleType};
use snapvault_core::service::{BackupOptions, RestoreOptions};
use snapvault_core::{BackupError, BackupService};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover interrupted work, then run the scheduler until SIGINT/SIGTERM
    Serve,
    /// Create a backup now
    Backup {
        #[arg(long)]
        include_files: bool,
    },
    /// Verify and store an externally produced container
    Import { file: PathBuf },
    /// Copy a stored container out of the backup directory
    Export {
        id: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Delete a backup and its container
    Delete { id: String },
    /// Restore a backup, or only verify it with --dry-run
    Restore {
        id: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// List backups
    List {
        #[arg(long, default_value_t = 20)]
        runs: usize,
    },
    /// Integrity, maintenance and plan state
    Status,
    /// Show the backup plan, or change it when any flag is given
    Plan(PlanArgs),
}

#[derive(clap::Args, Debug, Default)]
struct PlanArgs {
    #[arg(long)]
    enabled: Option<bool>,
    /// daily, weekly, monthly_start or monthly_end
    #[arg(long)]
    schedule: Option<String>,
    /// 0 = Sunday
    #[arg(long)]
    weekday: Option<i64>,
    #[arg(long)]
    hour: Option<i64>,
    #[arg(long)]
    minute: Option<i64>,
    #[arg(long)]
    retention_days: Option<i64>,
    #[arg(long)]
    keep_last: Option<i64>,
    #[arg(long)]
    include_files: Option<bool>,
}

impl PlanArgs {
    fn into_update(self) -> anyhow::Result<Option<PlanUpdate>> {
        let schedule_type = self
            .schedule
            .as_deref()
            .map(str::parse::<ScheduleType>)
            .transpose()?;
        let update = PlanUpdate {
            enabled: self.enabled,
            schedule_type,
            weekday: self.weekday,
            hour: self.hour,
            minute: self.minute,
            retention_days: self.retention_days,
            keep_last_successful: self.keep_last,
            include_files: self.include_files,
        };
        let empty = update.enabled.is_none()
            && update.schedule_type.is_none()
            && update.weekday.is_none()
            && update.hour.is_none()
            && update.minute.is_none()
            && update.retention_days.is_none()
            && update.keep_last_successful.is_none()
            && update.include_files.is_none();
        Ok((!empty).then_some(update))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    logger::init(cli.log_level.as_deref().unwrap_or(&config.log_level))?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("cannot create {}", config.data_dir.display()))?;
    let pool = create_pool(&config.db_path)?;
    migrate(&pool)?;

    let pause = PauseFlag::default();
    let result = match cli.command {
        Command::Serve => serve(&config, pool.clone(), pause).await,
        command => {
            let service = build_service(&config, pool.clone(), pause, false).await?;
            run_command(&service, command).await
        }
    };

    close_pool(&pool);
    result
}

async fn build_service(config: &AppConfig, pool: DbPool, pause: PauseFlag, recover: bool) -> anyhow::Result<BackupService> {
    if config.database_url.is_none() {
        tracing::debug!("DATABASE_URL is not set; pg_dump and pg_restore use libpq defaults");
    }
    let repo = Arc::new(SqliteRepository::new(pool));
    let dump = Arc::new(PgTools::new(
        config.pg_dump_bin.clone(),
        config.pg_restore_bin.clone(),
        config.database_url.clone().unwrap_or_default(),
    ));
    let hooks = Arc::new(ServerHooks::new(pause, config.migrate_command.clone()));

    let service = if recover {
        BackupService::start(repo, dump, hooks, config.backup.clone()).await
    } else {
        BackupService::open(repo, dump, hooks, config.backup.clone()).await
    };
    service.map_err(failure)
}

async fn serve(config: &AppConfig, pool: DbPool, pause: PauseFlag) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting snapvault");
    let service = build_service(config, pool, pause.clone(), true).await?;
    if config.backup.encryption_key.is_none() {
        tracing::warn!("BACKUP_ENCRYPTION_KEY is not set; backups and restores will fail");
    }

    let scheduler = match BackupScheduler::new(service.clone(), pause).await {
        Ok(s) => {
            if let Err(e) = s.schedule_backup_tick(&config.backup_tick_cron).await {
                tracing::warn!(cron = %config.backup_tick_cron, "Failed to schedule backup tick: {}", e);
            }
            if let Err(e) = s.schedule_restore_test(&config.restore_test_cron).await {
                tracing::warn!(cron = %config.restore_test_cron, "Failed to schedule restore test: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    shutdown_signal().await;
    tracing::info!("Shutting down...");

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }
    if service.pipeline().is_held() {
        tracing::warn!("Exiting with a backup or restore in progress; it will be marked failed on next start");
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn run_command(service: &BackupService, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve => anyhow::bail!("serve is not a one-off command"),
        Command::Backup { include_files } => {
            let opts = BackupOptions {
                include_files,
                ..Default::default()
            };
            let artifact = service.create_backup_with_options(opts).await.map_err(failure)?;
            print_json(&artifact)
        }
        Command::Import { file } => {
            let upload = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("cannot open {}", file.display()))?;
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned());
            let artifact = service.import_backup(upload, name.as_deref()).await.map_err(failure)?;
            print_json(&artifact)
        }
        Command::Export { id, output } => {
            let mut download = service.download_artifact(&id).await.map_err(failure)?;
            let mut out = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("cannot create {}", output.display()))?;
            let copied = tokio::io::copy(&mut download, &mut out).await?;
            out.sync_all().await?;
            tracing::info!(artifact_id = %id, bytes = copied, output = %output.display(), "Backup exported");
            Ok(())
        }
        Command::Delete { id } => service.delete_backup(&id).await.map_err(failure),
        Command::Restore { id, dry_run } => {
            let opts = RestoreOptions {
                dry_run,
                deadline: None,
            };
            let ticket = service.start_restore_with(&id, opts).await.map_err(failure)?;
            tracing::info!(run_id = %ticket.run.id, "Restore started");
            let run = ticket.wait().await.map_err(failure)?;
            print_json(&run)?;
            if run.status != OperationStatus::Success {
                anyhow::bail!(
                    "restore failed: {}",
                    run.error_code.as_deref().unwrap_or("unknown")
                );
            }
            Ok(())
        }
        Command::List { runs } => {
            #[derive(Serialize)]
            struct Listing {
                artifacts: Vec<snapvault_core::models::BackupArtifact>,
                backup_runs: Vec<snapvault_core::models::BackupRun>,
                restore_runs: Vec<snapvault_core::models::RestoreRun>,
            }
            let listing = Listing {
                artifacts: service.list_artifacts().await.map_err(failure)?,
                backup_runs: service.list_backup_runs(runs).await.map_err(failure)?,
                restore_runs: service.list_restore_runs(runs).await.map_err(failure)?,
            };
            print_json(&listing)
        }
        Command::Status => {
            let status = serde_json::json!({
                "integrity": service.integrity_status(Utc::now()).await.map_err(failure)?,
                "maintenance": service.maintenance_state().await.map_err(failure)?,
                "plan": service.get_plan().await.map_err(failure)?,
            });
            print_json(&status)
        }
        Command::Plan(args) => {
            let plan = match args.into_update()? {
                Some(update) => service.update_plan(update).await.map_err(failure)?,
                None => service.get_plan().await.map_err(failure)?,
            };
            print_json(&plan)
        }
    }
}

/// Keep the stable code visible in CLI errors.
fn failure(err: BackupError) -> anyhow::Error {
    let code = err.code();
    anyhow::Error::new(err).context(format!("[{code}]"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
