use super::{get_enum, get_json, get_time, get_time_opt, ts, ts_opt};
use rusqlite::{params, Connection, OptionalExtension, Row};
use snapvault_core::models::RestoreRun;

fn row_to_restore(row: &Row) -> rusqlite::Result<RestoreRun> {
    Ok(RestoreRun {
        id: row.get("id")?,
        artifact_id: row.get("artifact_id")?,
        status: get_enum(row, "status")?,
        steps: get_json(row, "steps")?,
        error_code: row.get("error_code")?,
        error_message: row.get("error_message")?,
        metadata: get_json(row, "metadata")?,
        created_at: get_time(row, "created_at")?,
        started_at: get_time_opt(row, "started_at")?,
        finished_at: get_time_opt(row, "finished_at")?,
    })
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<RestoreRun>> {
    let run = conn
        .query_row("SELECT * FROM restore_runs WHERE id = ?", params![id], row_to_restore)
        .optional()?;
    Ok(run)
}

pub fn find_recent(conn: &Connection, limit: usize) -> anyhow::Result<Vec<RestoreRun>> {
    let mut stmt = conn.prepare("SELECT * FROM restore_runs ORDER BY created_at DESC, rowid DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit as i64], row_to_restore)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_active(conn: &Connection) -> anyhow::Result<Vec<RestoreRun>> {
    let mut stmt = conn.prepare("SELECT * FROM restore_runs WHERE status IN ('queued','running')")?;
    let rows = stmt.query_map([], row_to_restore)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_latest_finished_dry_run(conn: &Connection) -> anyhow::Result<Option<RestoreRun>> {
    let run = conn
        .query_row(
            "SELECT * FROM restore_runs
             WHERE json_extract(metadata, '$.dry_run') = 1 AND status NOT IN ('queued','running')
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            [],
            row_to_restore,
        )
        .optional()?;
    Ok(run)
}

pub fn any_active(conn: &Connection) -> anyhow::Result<bool> {
    let active: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM restore_runs WHERE status IN ('queued','running'))",
        [],
        |row| row.get(0),
    )?;
    Ok(active)
}

pub fn create(conn: &Connection, r: &RestoreRun) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO restore_runs (id, artifact_id, status, steps, error_code, error_message, metadata,
           created_at, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            r.id,
            r.artifact_id,
            r.status.as_str(),
            serde_json::to_string(&r.steps)?,
            r.error_code,
            r.error_message,
            r.metadata.to_string(),
            ts(&r.created_at),
            ts_opt(&r.started_at),
            ts_opt(&r.finished_at),
        ],
    )?;
    Ok(())
}

pub fn update(conn: &Connection, r: &RestoreRun) -> anyhow::Result<()> {
    let changed = conn.execute(
        "UPDATE restore_runs SET status = ?2, steps = ?3, error_code = ?4, error_message = ?5,
           metadata = ?6, started_at = ?7, finished_at = ?8
         WHERE id = ?1",
        params![
            r.id,
            r.status.as_str(),
            serde_json::to_string(&r.steps)?,
            r.error_code,
            r.error_message,
            r.metadata.to_string(),
            ts_opt(&r.started_at),
            ts_opt(&r.finished_at),
        ],
    )?;
    if changed == 0 {
        anyhow::bail!("no restore run with id {}", r.id);
    }
    Ok(())
}
