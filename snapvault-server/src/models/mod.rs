//! Row mapping between SQLite and the engine's records.
//!
//! Timestamps are stored as RFC 3339 text with nanosecond precision so
//! that text ordering matches time ordering.

pub mod artifact;
pub mod restore_run;
pub mod run;
pub mod settings;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use std::str::FromStr;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn ts_opt(at: &Option<DateTime<Utc>>) -> Option<String> {
    at.as_ref().map(ts)
}

fn conversion(row: &Row, col: &str, err: impl Into<BoxError>) -> rusqlite::Error {
    let idx = row.as_ref().column_index(col).unwrap_or_default();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
}

pub fn get_time(row: &Row, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    parse_time(&raw).map_err(|e| conversion(row, col, e))
}

pub fn get_time_opt(row: &Row, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|r| parse_time(&r).map_err(|e| conversion(row, col, e)))
        .transpose()
}

pub fn get_enum<T>(row: &Row, col: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(col)?;
    raw.parse::<T>().map_err(|e| conversion(row, col, e))
}

pub fn get_json<T: DeserializeOwned>(row: &Row, col: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw).map_err(|e| conversion(row, col, e))
}
