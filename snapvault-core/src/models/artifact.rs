use super::{FailureInfo, OperationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    Local,
    Imported,
}

impl ArtifactOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactOrigin::Local => "local",
            ArtifactOrigin::Imported => "imported",
        }
    }
}

impl FromStr for ArtifactOrigin {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ArtifactOrigin::Local),
            "imported" => Ok(ArtifactOrigin::Imported),
            other => anyhow::bail!("Unknown artifact origin {other:?}"),
        }
    }
}

/// One encrypted container on disk (or the attempt to produce one).
///
/// `storage_path` and `checksum` are set exactly when the status is
/// `success`; the transition helpers keep that invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub id: String,
    pub status: OperationStatus,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub filename: String,
    pub storage_path: Option<String>,
    pub origin: ArtifactOrigin,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupArtifact {
    pub fn queued(filename: String, origin: ArtifactOrigin, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: OperationStatus::Queued,
            size_bytes: 0,
            checksum: None,
            filename,
            storage_path: None,
            origin,
            error_code: None,
            error_message: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Running;
        self.updated_at = now;
    }

    pub fn mark_success(
        &mut self,
        storage_path: String,
        checksum: String,
        size_bytes: i64,
        now: DateTime<Utc>,
    ) {
        self.status = OperationStatus::Success;
        self.storage_path = Some(storage_path);
        self.checksum = Some(checksum);
        self.size_bytes = size_bytes;
        self.error_code = None;
        self.error_message = None;
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    pub fn mark_failed(&mut self, failure: &FailureInfo, now: DateTime<Utc>) {
        self.status = OperationStatus::Failed;
        self.storage_path = None;
        self.checksum = None;
        self.error_code = Some(failure.code.clone());
        self.error_message = Some(failure.message.clone());
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// The invariant between status and storage fields.
    pub fn is_consistent(&self) -> bool {
        let stored = self.storage_path.is_some() && self.checksum.is_some();
        let empty = self.storage_path.is_none() && self.checksum.is_none();
        match self.status {
            OperationStatus::Success => stored,
            _ => empty,
        }
    }

    /// When the artifact's content was produced.
    pub fn completed_at(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_keep_invariant() {
        let now = Utc::now();
        let mut artifact = BackupArtifact::queued("a.bscc".into(), ArtifactOrigin::Local, now);
        assert!(artifact.is_consistent());

        artifact.mark_running(now);
        assert!(artifact.is_consistent());

        artifact.mark_success("/tmp/a.bscc".into(), "abc".into(), 10, now);
        assert!(artifact.is_consistent());
        assert_eq!(artifact.finished_at, Some(now));

        artifact.mark_failed(
            &FailureInfo {
                code: "internal".into(),
                message: "boom".into(),
            },
            now,
        );
        assert!(artifact.is_consistent());
        assert!(artifact.storage_path.is_none());
        assert_eq!(artifact.error_code.as_deref(), Some("internal"));
    }
}
