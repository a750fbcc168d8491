use crate::db::connection::DbPool;
use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_artifacts (
  id TEXT PRIMARY KEY,
  status TEXT NOT NULL CHECK(status IN ('queued','running','success','failed','canceled')),
  size_bytes INTEGER NOT NULL DEFAULT 0,
  checksum TEXT,
  filename TEXT NOT NULL,
  storage_path TEXT,
  origin TEXT NOT NULL DEFAULT 'local' CHECK(origin IN ('local','imported')),
  error_code TEXT,
  error_message TEXT,
  metadata TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  finished_at TEXT
);

CREATE TABLE IF NOT EXISTS backup_runs (
  id TEXT PRIMARY KEY,
  artifact_id TEXT NOT NULL,
  trigger TEXT NOT NULL CHECK(trigger IN ('manual','scheduled','import')),
  status TEXT NOT NULL CHECK(status IN ('queued','running','success','failed','canceled')),
  error_code TEXT,
  error_message TEXT,
  created_at TEXT NOT NULL,
  started_at TEXT,
  finished_at TEXT
);

CREATE TABLE IF NOT EXISTS restore_runs (
  id TEXT PRIMARY KEY,
  artifact_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK(status IN ('queued','running','success','failed','canceled')),
  steps TEXT NOT NULL DEFAULT '[]',
  error_code TEXT,
  error_message TEXT,
  metadata TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  started_at TEXT,
  finished_at TEXT
);

CREATE TABLE IF NOT EXISTS backup_plan (
  id INTEGER PRIMARY KEY CHECK(id = 1),
  enabled INTEGER NOT NULL DEFAULT 1,
  schedule_type TEXT NOT NULL DEFAULT 'daily' CHECK(schedule_type IN ('daily','weekly','monthly_start','monthly_end')),
  weekday INTEGER NOT NULL DEFAULT 0,
  hour INTEGER NOT NULL DEFAULT 2,
  minute INTEGER NOT NULL DEFAULT 0,
  retention_days INTEGER NOT NULL DEFAULT 30,
  keep_last_successful INTEGER NOT NULL DEFAULT 7,
  include_files INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS maintenance_state (
  id INTEGER PRIMARY KEY CHECK(id = 1),
  enabled INTEGER NOT NULL DEFAULT 0,
  reason TEXT,
  restore_run_id TEXT,
  since TEXT
);

CREATE INDEX IF NOT EXISTS idx_backup_artifacts_created ON backup_artifacts(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_backup_artifacts_status ON backup_artifacts(status);
CREATE INDEX IF NOT EXISTS idx_backup_runs_created ON backup_runs(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_restore_runs_created ON restore_runs(created_at DESC);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("Starting database migration");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for existing databases
    if !has_column(&conn, "backup_plan", "last_auto_run_at")? {
        conn.execute_batch("ALTER TABLE backup_plan ADD COLUMN last_auto_run_at TEXT")?;
    }

    tracing::info!("Database migration completed");
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(columns.iter().any(|c| c == column))
}
