use super::{get_enum, get_json, get_time, get_time_opt, ts, ts_opt};
use rusqlite::{params, Connection, OptionalExtension, Row};
use snapvault_core::models::BackupArtifact;

fn row_to_artifact(row: &Row) -> rusqlite::Result<BackupArtifact> {
    Ok(BackupArtifact {
        id: row.get("id")?,
        status: get_enum(row, "status")?,
        size_bytes: row.get("size_bytes")?,
        checksum: row.get("checksum")?,
        filename: row.get("filename")?,
        storage_path: row.get("storage_path")?,
        origin: get_enum(row, "origin")?,
        error_code: row.get("error_code")?,
        error_message: row.get("error_message")?,
        metadata: get_json(row, "metadata")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
        finished_at: get_time_opt(row, "finished_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<BackupArtifact>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_artifacts ORDER BY created_at DESC, rowid DESC")?;
    let rows = stmt.query_map([], row_to_artifact)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupArtifact>> {
    let artifact = conn
        .query_row("SELECT * FROM backup_artifacts WHERE id = ?", params![id], row_to_artifact)
        .optional()?;
    Ok(artifact)
}

pub fn find_latest_successful(conn: &Connection) -> anyhow::Result<Option<BackupArtifact>> {
    let artifact = conn
        .query_row(
            "SELECT * FROM backup_artifacts WHERE status = 'success' ORDER BY created_at DESC, rowid DESC LIMIT 1",
            [],
            row_to_artifact,
        )
        .optional()?;
    Ok(artifact)
}

pub fn find_active(conn: &Connection) -> anyhow::Result<Vec<BackupArtifact>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_artifacts WHERE status IN ('queued','running')")?;
    let rows = stmt.query_map([], row_to_artifact)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn any_active(conn: &Connection) -> anyhow::Result<bool> {
    let active: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM backup_artifacts WHERE status IN ('queued','running'))",
        [],
        |row| row.get(0),
    )?;
    Ok(active)
}

pub fn create(conn: &Connection, a: &BackupArtifact) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO backup_artifacts (id, status, size_bytes, checksum, filename, storage_path, origin,
           error_code, error_message, metadata, created_at, updated_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            a.id,
            a.status.as_str(),
            a.size_bytes,
            a.checksum,
            a.filename,
            a.storage_path,
            a.origin.as_str(),
            a.error_code,
            a.error_message,
            a.metadata.to_string(),
            ts(&a.created_at),
            ts(&a.updated_at),
            ts_opt(&a.finished_at),
        ],
    )?;
    Ok(())
}

pub fn update(conn: &Connection, a: &BackupArtifact) -> anyhow::Result<()> {
    let changed = conn.execute(
        "UPDATE backup_artifacts SET status = ?2, size_bytes = ?3, checksum = ?4, filename = ?5,
           storage_path = ?6, origin = ?7, error_code = ?8, error_message = ?9, metadata = ?10,
           updated_at = ?11, finished_at = ?12
         WHERE id = ?1",
        params![
            a.id,
            a.status.as_str(),
            a.size_bytes,
            a.checksum,
            a.filename,
            a.storage_path,
            a.origin.as_str(),
            a.error_code,
            a.error_message,
            a.metadata.to_string(),
            ts(&a.updated_at),
            ts_opt(&a.finished_at),
        ],
    )?;
    if changed == 0 {
        anyhow::bail!("no artifact with id {}", a.id);
    }
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM backup_artifacts WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
