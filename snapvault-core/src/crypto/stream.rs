//! Streaming encryption and decryption of container bodies.

use super::container::{validate_chunk_size, ContainerHeader, NONCE_LEN, TAG_LEN};
use super::{CryptoError, EncryptionKey};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use std::io::{self, Read, Write};

fn cipher_for(key: &EncryptionKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

/// `Write` adapter that seals everything written to it into a container.
///
/// Plaintext is buffered up to one chunk; call [`finish`](Self::finish) to
/// seal the final partial chunk. Dropping the writer without finishing
/// loses the buffered tail.
pub struct ContainerWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    header: ContainerHeader,
    buf: Vec<u8>,
    chunk_size: usize,
    next_index: Option<u32>,
}

impl<W: Write> ContainerWriter<W> {
    /// Pick a random base nonce and write the header.
    pub fn new(mut inner: W, key: &EncryptionKey, chunk_size: u32) -> Result<Self, CryptoError> {
        validate_chunk_size(chunk_size)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let header = ContainerHeader::new(nonce, chunk_size);
        header.write_to(&mut inner)?;

        Ok(Self {
            inner,
            cipher: cipher_for(key),
            header,
            buf: Vec::with_capacity(chunk_size as usize),
            chunk_size: chunk_size as usize,
            next_index: Some(0),
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    fn seal_chunk(&mut self) -> Result<(), CryptoError> {
        let index = self.next_index.ok_or(CryptoError::ChunkLimit)?;
        let nonce = self.header.chunk_nonce(index);
        let aad = self.header.aad();
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &self.buf,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;

        self.inner.write_all(&(sealed.len() as u32).to_be_bytes())?;
        self.inner.write_all(&sealed)?;
        self.buf.clear();
        self.next_index = index.checked_add(1);
        Ok(())
    }

    /// Seal any buffered plaintext and hand back the inner writer.
    pub fn finish(mut self) -> Result<W, CryptoError> {
        if !self.buf.is_empty() {
            self.seal_chunk()?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ContainerWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.chunk_size - self.buf.len();
        let take = room.min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        if self.buf.len() == self.chunk_size {
            self.seal_chunk().map_err(CryptoError::into_io)?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial chunks are only sealed by `finish`, keeping chunk
        // boundaries independent of how callers flush.
        self.inner.flush()
    }
}

/// `Read` adapter that yields verified plaintext from a container.
///
/// Chunks are authenticated strictly in order; nothing from a chunk is
/// returned until its tag checks out.
pub struct ContainerReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    header: ContainerHeader,
    index: u32,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> ContainerReader<R> {
    /// Read and validate the header.
    pub fn new(mut inner: R, key: &EncryptionKey) -> Result<Self, CryptoError> {
        let header = ContainerHeader::read_from(&mut inner)?;
        header.validate()?;
        Ok(Self {
            inner,
            cipher: cipher_for(key),
            header,
            index: 0,
            plain: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Number of chunks authenticated so far.
    pub fn chunks_read(&self) -> u32 {
        self.index
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn next_chunk(&mut self) -> Result<bool, CryptoError> {
        let index = self.index;
        let mut len_buf = [0u8; 4];
        match read_full(&mut self.inner, &mut len_buf)? {
            0 => return Ok(false),
            4 => {}
            _ => return Err(CryptoError::TruncatedChunk { index }),
        }

        let len = u32::from_be_bytes(len_buf);
        let max = self.header.max_chunk_len();
        if len > max {
            return Err(CryptoError::ChunkTooLarge { index, len, max });
        }
        if (len as usize) < TAG_LEN {
            return Err(CryptoError::TruncatedChunk { index });
        }

        let mut sealed = vec![0u8; len as usize];
        if read_full(&mut self.inner, &mut sealed)? != sealed.len() {
            return Err(CryptoError::TruncatedChunk { index });
        }

        let nonce = self.header.chunk_nonce(index);
        let aad = self.header.aad();
        self.plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Authentication { index })?;
        self.pos = 0;
        self.index = index.checked_add(1).ok_or(CryptoError::ChunkLimit)?;
        Ok(true)
    }
}

impl<R: Read> Read for ContainerReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.done {
                return Ok(0);
            }
            match self.next_chunk() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return Ok(0);
                }
                Err(e) => return Err(e.into_io()),
            }
        }

        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Fill `buf` as far as the reader allows; returns bytes read (short only at EOF).
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt everything from `reader` into `writer`. Returns plaintext bytes consumed.
pub fn encrypt_stream<R: Read, W: Write>(
    key: &EncryptionKey,
    mut reader: R,
    writer: W,
    chunk_size: u32,
) -> Result<u64, CryptoError> {
    let mut sealer = ContainerWriter::new(writer, key, chunk_size)?;
    let copied = io::copy(&mut reader, &mut sealer).map_err(CryptoError::from_io)?;
    sealer.finish()?;
    Ok(copied)
}

/// Decrypt a whole container from `reader` into `writer`. Returns plaintext bytes written.
pub fn decrypt_stream<R: Read, W: Write>(
    key: &EncryptionKey,
    reader: R,
    mut writer: W,
) -> Result<u64, CryptoError> {
    let mut opener = ContainerReader::new(reader, key)?;
    let copied = io::copy(&mut opener, &mut writer).map_err(CryptoError::from_io)?;
    writer.flush()?;
    Ok(copied)
}
