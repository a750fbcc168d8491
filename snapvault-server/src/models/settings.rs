//! Singleton rows: the backup plan and the maintenance flag.

use super::{get_enum, get_time, get_time_opt, ts, ts_opt};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use snapvault_core::models::{BackupPlan, MaintenanceState};

fn row_to_plan(row: &Row) -> rusqlite::Result<BackupPlan> {
    Ok(BackupPlan {
        enabled: row.get("enabled")?,
        schedule_type: get_enum(row, "schedule_type")?,
        weekday: row.get("weekday")?,
        hour: row.get("hour")?,
        minute: row.get("minute")?,
        retention_days: row.get("retention_days")?,
        keep_last_successful: row.get("keep_last_successful")?,
        include_files: row.get("include_files")?,
        last_auto_run_at: get_time_opt(row, "last_auto_run_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

/// The plan row, created with defaults on first read.
pub fn get_plan(conn: &Connection) -> anyhow::Result<BackupPlan> {
    let found = conn
        .query_row("SELECT * FROM backup_plan WHERE id = 1", [], row_to_plan)
        .optional()?;
    match found {
        Some(plan) => Ok(plan),
        None => {
            let plan = BackupPlan::default_at(Utc::now());
            save_plan(conn, &plan)?;
            Ok(plan)
        }
    }
}

pub fn save_plan(conn: &Connection, plan: &BackupPlan) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO backup_plan (id, enabled, schedule_type, weekday, hour, minute, retention_days,
           keep_last_successful, include_files, last_auto_run_at, updated_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
           enabled = excluded.enabled,
           schedule_type = excluded.schedule_type,
           weekday = excluded.weekday,
           hour = excluded.hour,
           minute = excluded.minute,
           retention_days = excluded.retention_days,
           keep_last_successful = excluded.keep_last_successful,
           include_files = excluded.include_files,
           last_auto_run_at = excluded.last_auto_run_at,
           updated_at = excluded.updated_at",
        params![
            plan.enabled,
            plan.schedule_type.as_str(),
            plan.weekday,
            plan.hour,
            plan.minute,
            plan.retention_days,
            plan.keep_last_successful,
            plan.include_files,
            ts_opt(&plan.last_auto_run_at),
            ts(&plan.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_maintenance(conn: &Connection) -> anyhow::Result<MaintenanceState> {
    let state = conn
        .query_row("SELECT * FROM maintenance_state WHERE id = 1", [], |row| {
            Ok(MaintenanceState {
                enabled: row.get("enabled")?,
                reason: row.get("reason")?,
                restore_run_id: row.get("restore_run_id")?,
                since: get_time_opt(row, "since")?,
            })
        })
        .optional()?;
    Ok(state.unwrap_or_default())
}

pub fn set_maintenance(conn: &Connection, state: &MaintenanceState) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO maintenance_state (id, enabled, reason, restore_run_id, since)
         VALUES (1, ?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
           enabled = excluded.enabled,
           reason = excluded.reason,
           restore_run_id = excluded.restore_run_id,
           since = excluded.since",
        params![state.enabled, state.reason, state.restore_run_id, ts_opt(&state.since)],
    )?;
    Ok(())
}
