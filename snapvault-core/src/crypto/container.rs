//! BSCC container header framing.
//!
//! ```text
//! magic "BSCC" | format u8 | crypto u8 | nonce_len u8 | nonce | chunk_size u32 BE
//! { len u32 BE | ciphertext }*
//! ```

use super::CryptoError;
use std::io::{self, Read, Write};

pub const MAGIC: [u8; 4] = *b"BSCC";
pub const FORMAT_VERSION: u8 = 1;
/// AES-256-GCM with 96-bit nonces.
pub const CRYPTO_VERSION: u8 = 1;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub format_version: u8,
    pub crypto_version: u8,
    pub nonce: Vec<u8>,
    pub chunk_size: u32,
}

impl ContainerHeader {
    pub fn new(nonce: [u8; NONCE_LEN], chunk_size: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            crypto_version: CRYPTO_VERSION,
            nonce: nonce.to_vec(),
            chunk_size,
        }
    }

    pub fn encoded_len(&self) -> usize {
        MAGIC.len() + 3 + self.nonce.len() + 4
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&MAGIC);
        out.push(self.format_version);
        out.push(self.crypto_version);
        out.push(self.nonce.len() as u8);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.chunk_size.to_be_bytes());
        out
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.encode())
    }

    /// Parse a header from the start of `buf`, returning it with the number
    /// of bytes consumed. Only the framing is checked here; see [`validate`].
    ///
    /// [`validate`]: ContainerHeader::validate
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CryptoError> {
        let mut cursor = buf;
        let header = Self::read_from(&mut cursor)?;
        Ok((header, buf.len() - cursor.len()))
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, CryptoError> {
        let mut fixed = [0u8; 7];
        read_header_bytes(&mut reader, &mut fixed)?;
        if fixed[..4] != MAGIC {
            return Err(CryptoError::InvalidMagic);
        }

        let mut nonce = vec![0u8; fixed[6] as usize];
        read_header_bytes(&mut reader, &mut nonce)?;

        let mut size = [0u8; 4];
        read_header_bytes(&mut reader, &mut size)?;

        Ok(Self {
            format_version: fixed[4],
            crypto_version: fixed[5],
            nonce,
            chunk_size: u32::from_be_bytes(size),
        })
    }

    /// Check versions, nonce length and chunk size against what this build
    /// can decrypt.
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.format_version != FORMAT_VERSION {
            return Err(CryptoError::UnsupportedFormatVersion(self.format_version));
        }
        if self.crypto_version != CRYPTO_VERSION {
            return Err(CryptoError::UnsupportedCryptoVersion(self.crypto_version));
        }
        if self.nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonceLength(self.nonce.len() as u8));
        }
        validate_chunk_size(self.chunk_size)
    }

    /// Associated data bound into every chunk.
    pub fn aad(&self) -> [u8; 3] {
        [self.format_version, self.crypto_version, self.nonce.len() as u8]
    }

    /// Nonce for chunk `index`: the base nonce with its low 32 bits replaced.
    pub fn chunk_nonce(&self, index: u32) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        let len = self.nonce.len().min(NONCE_LEN);
        nonce[..len].copy_from_slice(&self.nonce[..len]);
        nonce[NONCE_LEN - 4..].copy_from_slice(&index.to_be_bytes());
        nonce
    }

    /// Largest ciphertext a single chunk may declare.
    pub fn max_chunk_len(&self) -> u32 {
        self.chunk_size.saturating_add(TAG_LEN as u32)
    }
}

pub(crate) fn validate_chunk_size(chunk_size: u32) -> Result<(), CryptoError> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(CryptoError::InvalidChunkSize(chunk_size));
    }
    Ok(())
}

fn read_header_bytes<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), CryptoError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CryptoError::TruncatedHeader,
        _ => CryptoError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContainerHeader {
        ContainerHeader::new([0xAB; NONCE_LEN], 64 * 1024)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample();
        let mut bytes = header.encode();
        assert_eq!(bytes.len(), header.encoded_len());
        assert_eq!(&bytes[..4], b"BSCC");
        assert_eq!(bytes[6], NONCE_LEN as u8);

        bytes.extend_from_slice(b"trailing chunk data");
        let (decoded, used) = ContainerHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(used, header.encoded_len());
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_chunk_size_is_big_endian() {
        let header = ContainerHeader::new([0; NONCE_LEN], 0x0102_0304);
        let bytes = header.encode();
        assert_eq!(&bytes[bytes.len() - 4..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(
            ContainerHeader::decode(&bytes),
            Err(CryptoError::InvalidMagic)
        ));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = sample().encode();
        for cut in [0, 3, 7, 12, bytes.len() - 1] {
            assert!(
                matches!(
                    ContainerHeader::decode(&bytes[..cut]),
                    Err(CryptoError::TruncatedHeader)
                ),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_validate_versions_and_nonce() {
        let mut header = sample();
        header.format_version = 2;
        assert!(matches!(
            header.validate(),
            Err(CryptoError::UnsupportedFormatVersion(2))
        ));

        let mut header = sample();
        header.crypto_version = 9;
        assert!(matches!(
            header.validate(),
            Err(CryptoError::UnsupportedCryptoVersion(9))
        ));

        let mut header = sample();
        header.nonce.truncate(8);
        assert!(matches!(header.validate(), Err(CryptoError::InvalidNonceLength(8))));

        let mut header = sample();
        header.chunk_size = 0;
        assert!(matches!(header.validate(), Err(CryptoError::InvalidChunkSize(0))));
    }

    #[test]
    fn test_chunk_nonce_overwrites_low_bits() {
        let header = sample();
        let n0 = header.chunk_nonce(0);
        let n1 = header.chunk_nonce(1);
        assert_eq!(&n0[..8], &[0xAB; 8]);
        assert_eq!(&n0[8..], &[0, 0, 0, 0]);
        assert_eq!(&n1[8..], &[0, 0, 0, 1]);
        assert_ne!(n0, n1);
    }
}
