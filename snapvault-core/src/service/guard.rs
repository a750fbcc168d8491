//! In-process concurrency primitives: the pipeline slot and per-artifact
//! download leases.

use crate::error::BackupError;
use crate::models::BackupArtifact;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Single slot shared by backup creation, import and restore.
#[derive(Clone)]
pub struct PipelineGuard {
    slot: Arc<Semaphore>,
}

/// Proof of holding the pipeline slot. Released when dropped.
#[derive(Debug)]
pub struct PipelineToken {
    operation: &'static str,
    _permit: OwnedSemaphorePermit,
}

impl PipelineToken {
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl Drop for PipelineToken {
    fn drop(&mut self) {
        debug!(operation = self.operation, "Pipeline released");
    }
}

impl Default for PipelineGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineGuard {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the slot or fail immediately with `Concurrent`.
    pub fn begin_run(&self, operation: &'static str) -> Result<PipelineToken, BackupError> {
        let permit = self
            .slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| BackupError::Concurrent)?;
        debug!(operation, "Pipeline acquired");
        Ok(PipelineToken {
            operation,
            _permit: permit,
        })
    }

    pub fn end_run(&self, token: PipelineToken) {
        drop(token);
    }

    pub fn is_held(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

/// Per-artifact state: open downloads, or a delete in progress. Both are
/// changed under the map's entry lock, so the two never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Open(usize),
    Deleting,
}

/// Open download handles and in-flight deletes per artifact id.
#[derive(Clone, Default)]
pub struct DownloadTracker {
    claims: Arc<DashMap<String, Claim>>,
}

/// One open download. Decrements the artifact's count when dropped.
#[derive(Debug)]
pub struct DownloadLease {
    artifact_id: String,
    claims: Arc<DashMap<String, Claim>>,
}

/// Exclusive right to delete an artifact. Released when dropped.
#[derive(Debug)]
pub struct DeleteClaim {
    artifact_id: String,
    claims: Arc<DashMap<String, Claim>>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open download. Fails with `FileBusy` while the artifact
    /// is being deleted.
    pub fn acquire(&self, artifact_id: &str) -> Result<DownloadLease, BackupError> {
        match self.claims.entry(artifact_id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                Claim::Deleting => return Err(BackupError::FileBusy),
                Claim::Open(count) => *count += 1,
            },
            Entry::Vacant(entry) => {
                entry.insert(Claim::Open(1));
            }
        }
        Ok(DownloadLease {
            artifact_id: artifact_id.to_string(),
            claims: self.claims.clone(),
        })
    }

    /// Reserve the artifact for deletion. Fails with `FileBusy` while any
    /// download is open or another delete holds it.
    pub fn claim_delete(&self, artifact_id: &str) -> Result<DeleteClaim, BackupError> {
        match self.claims.entry(artifact_id.to_string()) {
            Entry::Occupied(_) => Err(BackupError::FileBusy),
            Entry::Vacant(entry) => {
                entry.insert(Claim::Deleting);
                Ok(DeleteClaim {
                    artifact_id: artifact_id.to_string(),
                    claims: self.claims.clone(),
                })
            }
        }
    }

    pub fn open_count(&self, artifact_id: &str) -> usize {
        match self.claims.get(artifact_id).map(|claim| *claim) {
            Some(Claim::Open(count)) => count,
            _ => 0,
        }
    }

    pub fn is_busy(&self, artifact_id: &str) -> bool {
        self.claims.contains_key(artifact_id)
    }
}

impl Drop for DownloadLease {
    fn drop(&mut self) {
        self.claims.remove_if_mut(&self.artifact_id, |_, claim| match claim {
            Claim::Open(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            Claim::Deleting => false,
        });
    }
}

impl Drop for DeleteClaim {
    fn drop(&mut self) {
        self.claims
            .remove_if(&self.artifact_id, |_, claim| *claim == Claim::Deleting);
    }
}

/// Reader over a finished container. The artifact stays busy until this is
/// dropped.
pub struct ArtifactDownload {
    pub artifact: BackupArtifact,
    pub size: u64,
    file: tokio::fs::File,
    _lease: DownloadLease,
}

impl ArtifactDownload {
    pub(crate) fn new(artifact: BackupArtifact, size: u64, file: tokio::fs::File, lease: DownloadLease) -> Self {
        Self {
            artifact,
            size,
            file,
            _lease: lease,
        }
    }
}

impl AsyncRead for ArtifactDownload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}
