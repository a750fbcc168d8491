use super::hashing::HashingReader;
use super::{sha256_hex, Checksums, Manifest, CHECKSUMS_MEMBER, DUMP_MEMBER, MANIFEST_MEMBER};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tar::{Builder, EntryType, Header};

const MEMBER_MODE: u32 = 0o600;

/// Write the three-member payload tar into `writer`.
///
/// The dump is hashed while it streams into the archive, so it is read once.
/// Returns the writer (to finish any wrapping encoder) and the checksums
/// that were stored.
pub fn build_payload<W: Write>(
    writer: W,
    manifest: &Manifest,
    dump_path: &Path,
) -> io::Result<(W, Checksums)> {
    let manifest_bytes = serde_json::to_vec_pretty(manifest)?;
    let mtime = manifest.created_at.timestamp().max(0) as u64;

    let mut archive = Builder::new(writer);
    append_member(
        &mut archive,
        MANIFEST_MEMBER,
        mtime,
        manifest_bytes.len() as u64,
        manifest_bytes.as_slice(),
    )?;

    let dump = File::open(dump_path)?;
    let dump_len = dump.metadata()?.len();
    let mut hashed = HashingReader::new(dump.take(dump_len));
    append_member(&mut archive, DUMP_MEMBER, mtime, dump_len, &mut hashed)?;
    let (dump_sha256, copied) = hashed.finish();
    if copied != dump_len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{DUMP_MEMBER} shrank while archiving ({copied} of {dump_len} bytes)"),
        ));
    }

    let checksums = Checksums {
        manifest_sha256: sha256_hex(&manifest_bytes),
        db_dump_sha256: dump_sha256,
    };
    let checksum_bytes = serde_json::to_vec_pretty(&checksums)?;
    append_member(
        &mut archive,
        CHECKSUMS_MEMBER,
        mtime,
        checksum_bytes.len() as u64,
        checksum_bytes.as_slice(),
    )?;

    let writer = archive.into_inner()?;
    Ok((writer, checksums))
}

fn append_member<W: Write, R: Read>(
    archive: &mut Builder<W>,
    name: &str,
    mtime: u64,
    size: u64,
    data: R,
) -> io::Result<()> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(MEMBER_MODE);
    header.set_mtime(mtime);
    archive.append_data(&mut header, name, data)
}
