use super::{get_enum, get_time, get_time_opt, ts, ts_opt};
use rusqlite::{params, Connection, Row};
use snapvault_core::models::BackupRun;

fn row_to_run(row: &Row) -> rusqlite::Result<BackupRun> {
    Ok(BackupRun {
        id: row.get("id")?,
        artifact_id: row.get("artifact_id")?,
        trigger: get_enum(row, "trigger")?,
        status: get_enum(row, "status")?,
        error_code: row.get("error_code")?,
        error_message: row.get("error_message")?,
        created_at: get_time(row, "created_at")?,
        started_at: get_time_opt(row, "started_at")?,
        finished_at: get_time_opt(row, "finished_at")?,
    })
}

pub fn find_recent(conn: &Connection, limit: usize) -> anyhow::Result<Vec<BackupRun>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_runs ORDER BY created_at DESC, rowid DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit as i64], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_active(conn: &Connection) -> anyhow::Result<Vec<BackupRun>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_runs WHERE status IN ('queued','running')")?;
    let rows = stmt.query_map([], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn any_active(conn: &Connection) -> anyhow::Result<bool> {
    let active: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM backup_runs WHERE status IN ('queued','running'))",
        [],
        |row| row.get(0),
    )?;
    Ok(active)
}

pub fn create(conn: &Connection, r: &BackupRun) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO backup_runs (id, artifact_id, trigger, status, error_code, error_message,
           created_at, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            r.id,
            r.artifact_id,
            r.trigger.as_str(),
            r.status.as_str(),
            r.error_code,
            r.error_message,
            ts(&r.created_at),
            ts_opt(&r.started_at),
            ts_opt(&r.finished_at),
        ],
    )?;
    Ok(())
}

pub fn update(conn: &Connection, r: &BackupRun) -> anyhow::Result<()> {
    let changed = conn.execute(
        "UPDATE backup_runs SET status = ?2, error_code = ?3, error_message = ?4, started_at = ?5,
           finished_at = ?6
         WHERE id = ?1",
        params![
            r.id,
            r.status.as_str(),
            r.error_code,
            r.error_message,
            ts_opt(&r.started_at),
            ts_opt(&r.finished_at),
        ],
    )?;
    if changed == 0 {
        anyhow::bail!("no backup run with id {}", r.id);
    }
    Ok(())
}
