//! Tar payload sealed inside every container.
//!
//! Exactly three members, in order: `manifest.json`, `db.dump`,
//! `checksums.json`. The checksums cover the manifest bytes as stored and the
//! dump contents.

pub mod builder;
pub mod extract;
pub mod hashing;

pub use builder::build_payload;
pub use extract::{extract_payload, ExtractError, ExtractedPayload};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MANIFEST_MEMBER: &str = "manifest.json";
pub const DUMP_MEMBER: &str = "db.dump";
pub const CHECKSUMS_MEMBER: &str = "checksums.json";
pub const REQUIRED_MEMBERS: [&str; 3] = [MANIFEST_MEMBER, DUMP_MEMBER, CHECKSUMS_MEMBER];

pub const PAYLOAD_FORMAT_VERSION: u32 = 1;

/// Describes what a payload contains and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub app_version: String,
    pub db_engine: String,
    pub schema_version: i64,
    #[serde(default)]
    pub include_files: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub manifest_sha256: String,
    pub db_dump_sha256: String,
}

impl Checksums {
    /// Names of the members whose hashes differ from `other`.
    pub fn mismatches(&self, other: &Checksums) -> Vec<&'static str> {
        let mut out = Vec::new();
        if !self.manifest_sha256.eq_ignore_ascii_case(&other.manifest_sha256) {
            out.push(MANIFEST_MEMBER);
        }
        if !self.db_dump_sha256.eq_ignore_ascii_case(&other.db_dump_sha256) {
            out.push(DUMP_MEMBER);
        }
        out
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
