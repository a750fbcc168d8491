//! Chunked authenticated encryption for BSCC containers.
//!
//! A container is a small versioned header followed by length-prefixed
//! AES-256-GCM chunks. Chunk nonces come from one random base nonce with the
//! low 32 bits replaced by the chunk index, so nonces never repeat within a
//! file.

pub mod container;
pub mod stream;

pub use container::{ContainerHeader, CRYPTO_VERSION, DEFAULT_CHUNK_SIZE, FORMAT_VERSION, MAGIC};
pub use stream::{decrypt_stream, encrypt_stream, ContainerReader, ContainerWriter};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption key is empty or shorter than 32 bytes")]
    InvalidKey,

    #[error("Not a BSCC container")]
    InvalidMagic,

    #[error("Unsupported container format version {0}")]
    UnsupportedFormatVersion(u8),

    #[error("Unsupported crypto version {0}")]
    UnsupportedCryptoVersion(u8),

    #[error("Invalid nonce length {0}")]
    InvalidNonceLength(u8),

    #[error("Invalid chunk size {0}")]
    InvalidChunkSize(u32),

    #[error("Container header is truncated")]
    TruncatedHeader,

    #[error("Chunk {index} is truncated")]
    TruncatedChunk { index: u32 },

    #[error("Chunk {index} declares {len} bytes, limit is {max}")]
    ChunkTooLarge { index: u32, len: u32, max: u32 },

    #[error("Chunk {index} failed authentication")]
    Authentication { index: u32 },

    #[error("Container has too many chunks")]
    ChunkLimit,

    #[error("Chunk encryption failed")]
    Encrypt,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CryptoError {
    /// Recovers a codec error that travelled through an `io::Error`
    /// (the `Read`/`Write` adapters can only report `io::Error`).
    pub fn from_io(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<CryptoError>()) {
            return CryptoError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<CryptoError>()) {
            Some(Ok(crypto)) => *crypto,
            Some(Err(other)) => CryptoError::Io(io::Error::other(other)),
            None => CryptoError::Io(io::Error::other("unknown I/O failure")),
        }
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            CryptoError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

/// 256-bit container key. Wiped on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Derive a key from configured material.
    ///
    /// Accepts hex, padded or unpadded standard base64, or raw bytes. The first
    /// encoding that decodes to at least 32 bytes wins; otherwise the raw
    /// bytes are used. Exactly 32 bytes are used as-is, longer material is
    /// reduced with SHA-256.
    pub fn derive(material: &[u8]) -> Result<Self, CryptoError> {
        let trimmed = material.trim_ascii();
        if trimmed.is_empty() {
            return Err(CryptoError::InvalidKey);
        }

        let decoded = decode_material(trimmed);
        let bytes: &[u8] = match &decoded {
            Some(bytes) => bytes,
            None => trimmed,
        };
        Self::from_bytes(bytes)
    }

    /// Build a key from already-decoded bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        match bytes.len() {
            n if n < KEY_LEN => return Err(CryptoError::InvalidKey),
            KEY_LEN => key.copy_from_slice(bytes),
            _ => key.copy_from_slice(&Sha256::digest(bytes)),
        }
        Ok(Self(key))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

fn decode_material(text: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    let candidates: [fn(&[u8]) -> Option<Vec<u8>>; 3] = [
        |t| hex::decode(t).ok(),
        |t| STANDARD.decode(t).ok(),
        |t| STANDARD_NO_PAD.decode(t).ok(),
    ];
    for decode in candidates {
        if let Some(bytes) = decode(text).map(Zeroizing::new) {
            if bytes.len() >= KEY_LEN {
                return Some(bytes);
            }
        }
    }
    None
}
