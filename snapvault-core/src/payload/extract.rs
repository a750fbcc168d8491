//! Single-pass payload extraction.
//!
//! The extractor reports what it computed next to what the payload declared;
//! deciding whether a mismatch is fatal is left to the caller so that missing
//! members and bad checksums stay distinguishable.

use super::{
    sha256_hex, Checksums, Manifest, CHECKSUMS_MEMBER, DUMP_MEMBER, MANIFEST_MEMBER,
    REQUIRED_MEMBERS,
};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tar::Archive;
use thiserror::Error;

use super::hashing::TeeWriter;
use crate::crypto::CryptoError;

/// Manifest and checksum members are small; anything bigger is hostile.
const MAX_METADATA_BYTES: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Payload is missing required parts: {}", .0.join(", "))]
    MissingParts(Vec<&'static str>),

    #[error("Payload contains unexpected member {0}")]
    UnexpectedMember(String),

    #[error("Payload member {0} appears more than once")]
    DuplicateMember(&'static str),

    #[error("Payload member {0} exceeds the size limit")]
    MemberTooLarge(&'static str),

    #[error("Payload member {0} is truncated")]
    TruncatedMember(&'static str),

    #[error("Payload archive is damaged: {0}")]
    Malformed(io::Error),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(serde_json::Error),

    #[error("Invalid checksums: {0}")]
    InvalidChecksums(serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub struct ExtractedPayload {
    pub manifest: Manifest,
    /// Checksums as recorded inside the payload.
    pub declared: Checksums,
    /// Checksums recomputed from the bytes actually read.
    pub computed: Checksums,
    pub dump_path: PathBuf,
    pub dump_size: u64,
}

impl ExtractedPayload {
    /// Members whose recomputed hash differs from the declared one.
    pub fn mismatches(&self) -> Vec<&'static str> {
        self.declared.mismatches(&self.computed)
    }
}

/// Stream the payload once, writing `db.dump` to `dump_path` while hashing it.
pub fn extract_payload<R: Read>(reader: R, dump_path: &Path) -> Result<ExtractedPayload, ExtractError> {
    let mut archive = Archive::new(reader);

    let mut manifest_bytes: Option<Vec<u8>> = None;
    let mut checksum_bytes: Option<Vec<u8>> = None;
    let mut dump: Option<(String, u64)> = None;

    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        let name = entry.path().map_err(archive_error)?.to_string_lossy().into_owned();
        let declared_size = entry.header().size().map_err(archive_error)?;
        match name.as_str() {
            MANIFEST_MEMBER => {
                if manifest_bytes.is_some() {
                    return Err(ExtractError::DuplicateMember(MANIFEST_MEMBER));
                }
                manifest_bytes = Some(read_small(&mut entry, MANIFEST_MEMBER, declared_size)?);
            }
            CHECKSUMS_MEMBER => {
                if checksum_bytes.is_some() {
                    return Err(ExtractError::DuplicateMember(CHECKSUMS_MEMBER));
                }
                checksum_bytes = Some(read_small(&mut entry, CHECKSUMS_MEMBER, declared_size)?);
            }
            DUMP_MEMBER => {
                if dump.is_some() {
                    return Err(ExtractError::DuplicateMember(DUMP_MEMBER));
                }
                dump = Some(write_dump(&mut entry, dump_path, declared_size)?);
            }
            _ => return Err(ExtractError::UnexpectedMember(name)),
        }
    }

    let missing: Vec<&'static str> = REQUIRED_MEMBERS
        .iter()
        .zip([manifest_bytes.is_some(), dump.is_some(), checksum_bytes.is_some()])
        .filter(|(_, present)| !present)
        .map(|(name, _)| *name)
        .collect();
    let (Some(manifest_bytes), Some((dump_sha256, dump_size)), Some(checksum_bytes)) =
        (manifest_bytes, dump, checksum_bytes)
    else {
        return Err(ExtractError::MissingParts(missing));
    };

    let manifest: Manifest =
        serde_json::from_slice(&manifest_bytes).map_err(ExtractError::InvalidManifest)?;
    let declared: Checksums =
        serde_json::from_slice(&checksum_bytes).map_err(ExtractError::InvalidChecksums)?;

    Ok(ExtractedPayload {
        manifest,
        declared,
        computed: Checksums {
            manifest_sha256: sha256_hex(&manifest_bytes),
            db_dump_sha256: dump_sha256,
        },
        dump_path: dump_path.to_path_buf(),
        dump_size,
    })
}

/// Errors raised while walking the archive. Codec failures keep their own
/// identity; anything else the tar reader reports means the stream is damaged.
fn archive_error(err: io::Error) -> ExtractError {
    if err.get_ref().is_some_and(|inner| inner.is::<CryptoError>()) {
        ExtractError::Io(err)
    } else {
        ExtractError::Malformed(err)
    }
}

fn read_small<R: Read>(entry: &mut R, member: &'static str, declared_size: u64) -> Result<Vec<u8>, ExtractError> {
    if declared_size > MAX_METADATA_BYTES {
        return Err(ExtractError::MemberTooLarge(member));
    }
    let mut bytes = Vec::new();
    entry
        .take(MAX_METADATA_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(archive_error)?;
    if (bytes.len() as u64) < declared_size {
        return Err(ExtractError::TruncatedMember(member));
    }
    Ok(bytes)
}

fn write_dump<R: Read>(entry: &mut R, dump_path: &Path, declared_size: u64) -> Result<(String, u64), ExtractError> {
    let file = create_private(dump_path)?;
    let mut tee = TeeWriter::new(BufWriter::new(file), Sha256::new());
    let size = io::copy(entry, &mut tee)?;
    if size < declared_size {
        return Err(ExtractError::TruncatedMember(DUMP_MEMBER));
    }
    tee.flush()?;
    let (file, hasher) = tee.into_parts();
    file.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok((hex::encode(hasher.finalize()), size))
}

fn create_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}
