use snapvault_core::BackupConfig;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_level: String,
    /// Connection string handed to pg_dump/pg_restore. Never logged.
    pub database_url: Option<String>,
    pub pg_dump_bin: PathBuf,
    pub pg_restore_bin: PathBuf,
    pub migrate_command: Option<String>,
    pub backup_tick_cron: String,
    pub restore_test_cron: String,
    pub backup: BackupConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| "./data".into()));
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut backup = BackupConfig::from_vars(&lookup);
        if lookup("BACKUP_STORAGE_DIR").is_none() {
            backup.storage_dir = data_dir.join("backups");
        }

        Self {
            db_path: data_dir.join("snapvault.db"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            database_url: non_empty("DATABASE_URL"),
            pg_dump_bin: non_empty("PG_DUMP_BIN").unwrap_or_else(|| "pg_dump".into()).into(),
            pg_restore_bin: non_empty("PG_RESTORE_BIN")
                .unwrap_or_else(|| "pg_restore".into())
                .into(),
            migrate_command: non_empty("MIGRATE_COMMAND"),
            backup_tick_cron: non_empty("BACKUP_TICK_CRON").unwrap_or_else(|| "0 * * * * *".into()),
            restore_test_cron: non_empty("RESTORE_TEST_CRON").unwrap_or_else(|| "0 0 * * * *".into()),
            data_dir,
            backup,
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("data_dir", &self.data_dir)
            .field("db_path", &self.db_path)
            .field("log_level", &self.log_level)
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("pg_dump_bin", &self.pg_dump_bin)
            .field("pg_restore_bin", &self.pg_restore_bin)
            .field("migrate_command", &self.migrate_command)
            .field("backup_tick_cron", &self.backup_tick_cron)
            .field("restore_test_cron", &self.restore_test_cron)
            .field("backup", &self.backup)
            .finish()
    }
}
