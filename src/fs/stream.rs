//! The authenticated block stream backing every object.
//!
//! An object's payload is a logical byte array of length `L`, stored as
//! `ceil(L / B)` AES-256-GCM blocks of plaintext size `B`. Ciphertext bytes
//! live in the data file at the same offsets as their plaintext (GCM keeps
//! lengths equal); each block's 12-byte nonce and 16-byte tag live in a
//! table in the meta file. The meta file layout is:
//!
//! ```text
//! magic(4) version(4) block_size(4) flags(4)     plaintext stream header
//! nonce(12) header_ct(72) tag(16)               encrypted object header
//! [nonce(12) tag(16)] * block_count             per-block table
//! ```
//!
//! Every rewrite of a block draws a fresh random nonce. The authentication
//! tag binds the object id and the block index, so ciphertext cannot be
//! transplanted between objects or positions. A failed authentication on
//! any touched block is fatal for the operation.

use crate::config::{
    FORMAT_VERSION, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NONCE_SIZE, OBJECT_MAGIC, TAG_SIZE,
};
use crate::crypto::BlockCipher;
use crate::error::{Error, Result};
use crate::fs::types::{FileHeader, FileId, HEADER_PLAIN_LEN};
use crate::storage::{self, ObjectFiles};
use rand::RngCore;
use tracing::warn;

/// Plaintext stream header length.
const STREAM_HEADER_LEN: u64 = 16;

/// Offset of the encrypted object header record.
const HEADER_RECORD_OFF: u64 = STREAM_HEADER_LEN;

/// Length of the encrypted object header record.
const HEADER_RECORD_LEN: usize = NONCE_SIZE + HEADER_PLAIN_LEN + TAG_SIZE;

/// Offset of the per-block nonce/tag table.
const TABLE_OFF: u64 = HEADER_RECORD_OFF + HEADER_RECORD_LEN as u64;

/// Bytes per table entry: nonce followed by tag.
const TABLE_ENTRY_LEN: usize = NONCE_SIZE + TAG_SIZE;

/// Block index sentinel reserved for the object header record. No payload
/// block can reach this index.
const HEADER_INDEX: u64 = u64::MAX;

fn table_entry_off(index: u64) -> u64 {
    TABLE_OFF + index * TABLE_ENTRY_LEN as u64
}

fn aad_for(id: &FileId, index: u64) -> [u8; 40] {
    let mut aad = [0u8; 40];
    aad[..32].copy_from_slice(id.as_bytes());
    aad[32..].copy_from_slice(&index.to_le_bytes());
    aad
}

fn fresh_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Map a short read on an object file to a corruption error.
fn map_short_read(e: Error) -> Error {
    match e {
        Error::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            Error::Corrupted("object file shorter than recorded size".to_string())
        }
        other => other,
    }
}

/// Random-access authenticated byte stream over one object's host files.
pub struct BlockStream {
    id: FileId,
    files: ObjectFiles,
    cipher: BlockCipher,
    block_size: u32,
    len: u64,
}

impl BlockStream {
    /// Initialize the stream for a freshly created object: writes the
    /// plaintext stream header and the encrypted object header record.
    pub fn create(
        id: FileId,
        files: ObjectFiles,
        cipher: BlockCipher,
        block_size: u32,
        header: &FileHeader,
    ) -> Result<Self> {
        let mut stream_header = [0u8; STREAM_HEADER_LEN as usize];
        stream_header[..4].copy_from_slice(&OBJECT_MAGIC);
        stream_header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        stream_header[8..12].copy_from_slice(&block_size.to_le_bytes());
        stream_header[12..16].copy_from_slice(&0u32.to_le_bytes());
        storage::write_all_at(&files.meta, 0, &stream_header)?;

        let mut stream = Self {
            id,
            files,
            cipher,
            block_size,
            len: header.size,
        };
        stream.write_header(header)?;
        Ok(stream)
    }

    /// Open the stream of an existing object, decrypting its header.
    pub fn open(id: FileId, files: ObjectFiles, cipher: BlockCipher) -> Result<(Self, FileHeader)> {
        let mut stream_header = [0u8; STREAM_HEADER_LEN as usize];
        storage::read_exact_at(&files.meta, 0, &mut stream_header).map_err(map_short_read)?;

        if stream_header[..4] != OBJECT_MAGIC {
            return Err(Error::Corrupted(format!(
                "bad magic in meta file of object {}",
                id
            )));
        }
        let version = u32::from_le_bytes(stream_header[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(Error::VersionMismatch {
                expected: FORMAT_VERSION,
                found: version,
            });
        }
        let block_size = u32::from_le_bytes(stream_header[8..12].try_into().unwrap());
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(Error::Corrupted(format!(
                "implausible block size {} in object {}",
                block_size, id
            )));
        }

        let mut record = [0u8; HEADER_RECORD_LEN];
        storage::read_exact_at(&files.meta, HEADER_RECORD_OFF, &mut record)
            .map_err(map_short_read)?;

        let nonce: [u8; NONCE_SIZE] = record[..NONCE_SIZE].try_into().unwrap();
        let tag: [u8; TAG_SIZE] = record[NONCE_SIZE + HEADER_PLAIN_LEN..].try_into().unwrap();
        let ct = &record[NONCE_SIZE..NONCE_SIZE + HEADER_PLAIN_LEN];

        let plain = cipher
            .open(&nonce, &aad_for(&id, HEADER_INDEX), ct, &tag)
            .map_err(|_| {
                warn!(object = %id, "object header authentication failed");
                Error::AuthFailed(id.to_hex())
            })?;
        let header: FileHeader = bincode::deserialize(&plain)
            .map_err(|_| Error::Corrupted(format!("malformed header in object {}", id)))?;

        let len = header.size;
        Ok((
            Self {
                id,
                files,
                cipher,
                block_size,
                len,
            },
            header,
        ))
    }

    /// Plaintext block size of this stream.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Logical payload length.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn block_count(&self) -> u64 {
        let b = self.block_size as u64;
        self.len.div_ceil(b)
    }

    /// Re-encrypt and persist the object header record with a fresh nonce.
    ///
    /// The caller keeps `header.size` equal to the stream length.
    pub fn write_header(&mut self, header: &FileHeader) -> Result<()> {
        let plain = bincode::serialize(header)?;
        debug_assert_eq!(plain.len(), HEADER_PLAIN_LEN);

        let nonce = fresh_nonce();
        let (ct, tag) = self
            .cipher
            .seal(&nonce, &aad_for(&self.id, HEADER_INDEX), &plain)?;

        let mut record = Vec::with_capacity(HEADER_RECORD_LEN);
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ct);
        record.extend_from_slice(&tag);
        storage::write_all_at(&self.files.meta, HEADER_RECORD_OFF, &record)?;
        Ok(())
    }

    /// Decrypt one full block. `index` must lie within the stream.
    fn read_block(&self, index: u64) -> Result<Vec<u8>> {
        let b = self.block_size as u64;
        let span = std::cmp::min(b, self.len - index * b) as usize;

        let mut ct = vec![0u8; span];
        storage::read_exact_at(&self.files.data, index * b, &mut ct).map_err(map_short_read)?;

        let mut entry = [0u8; TABLE_ENTRY_LEN];
        storage::read_exact_at(&self.files.meta, table_entry_off(index), &mut entry)
            .map_err(map_short_read)?;
        let nonce: [u8; NONCE_SIZE] = entry[..NONCE_SIZE].try_into().unwrap();
        let tag: [u8; TAG_SIZE] = entry[NONCE_SIZE..].try_into().unwrap();

        self.cipher
            .open(&nonce, &aad_for(&self.id, index), &ct, &tag)
            .map_err(|_| {
                warn!(object = %self.id, block = index, "block authentication failed");
                Error::AuthFailed(self.id.to_hex())
            })
    }

    /// Encrypt `plaintext` as block `index` under a fresh nonce and persist
    /// ciphertext and table entry.
    fn write_block(&mut self, index: u64, plaintext: &[u8]) -> Result<()> {
        let nonce = fresh_nonce();
        let (ct, tag) = self
            .cipher
            .seal(&nonce, &aad_for(&self.id, index), plaintext)?;

        storage::write_all_at(&self.files.data, index * self.block_size as u64, &ct)?;

        let mut entry = [0u8; TABLE_ENTRY_LEN];
        entry[..NONCE_SIZE].copy_from_slice(&nonce);
        entry[NONCE_SIZE..].copy_from_slice(&tag);
        storage::write_all_at(&self.files.meta, table_entry_off(index), &entry)?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; reads at or past the end return 0.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || offset >= self.len {
            return Ok(0);
        }
        let b = self.block_size as u64;
        let end = std::cmp::min(offset + buf.len() as u64, self.len);

        let mut filled = 0usize;
        let mut pos = offset;
        while pos < end {
            let index = pos / b;
            let block_off = (pos % b) as usize;
            let block = self.read_block(index)?;
            let take = std::cmp::min(block.len() - block_off, (end - pos) as usize);
            buf[filled..filled + take].copy_from_slice(&block[block_off..block_off + take]);
            filled += take;
            pos += take as u64;
        }
        Ok(filled)
    }

    /// Write `data` at `offset`, extending the stream as needed. Writes
    /// past the end zero-fill the gap first.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if offset > self.len {
            self.grow(offset)?;
        }

        let b = self.block_size as u64;
        let end = offset + data.len() as u64;
        let mut pos = offset;
        let mut consumed = 0usize;
        while pos < end {
            let index = pos / b;
            let block_off = (pos % b) as usize;
            let take = std::cmp::min(b as usize - block_off, (end - pos) as usize);
            let chunk = &data[consumed..consumed + take];

            if block_off == 0 && take == b as usize {
                self.write_block(index, chunk)?;
            } else {
                // Read-modify-write at the edges.
                let mut block = if index * b < self.len {
                    self.read_block(index)?
                } else {
                    Vec::new()
                };
                if block.len() < block_off + take {
                    block.resize(block_off + take, 0);
                }
                block[block_off..block_off + take].copy_from_slice(chunk);
                self.write_block(index, &block)?;
            }

            pos += take as u64;
            consumed += take;
            if pos > self.len {
                self.len = pos;
            }
        }
        Ok(())
    }

    /// Extend the stream to `new_len` with zero plaintext.
    fn grow(&mut self, new_len: u64) -> Result<()> {
        let b = self.block_size as u64;
        while self.len < new_len {
            let index = self.len / b;
            let block_off = (self.len % b) as usize;
            let take = std::cmp::min(b - block_off as u64, new_len - self.len) as usize;

            if block_off == 0 {
                self.write_block(index, &vec![0u8; take])?;
            } else {
                let mut block = self.read_block(index)?;
                block.resize(block_off + take, 0);
                self.write_block(index, &block)?;
            }
            self.len += take as u64;
        }
        Ok(())
    }

    /// Shrink or grow the stream to exactly `new_len` bytes.
    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        if new_len == self.len {
            return Ok(());
        }
        if new_len > self.len {
            return self.grow(new_len);
        }

        let b = self.block_size as u64;
        // A block cut short changes its ciphertext length, so the new last
        // block must be re-encrypted before the files are truncated.
        if new_len % b != 0 {
            let last = new_len / b;
            let mut block = self.read_block(last)?;
            block.truncate((new_len - last * b) as usize);
            self.write_block(last, &block)?;
        }
        self.len = new_len;
        storage::truncate(&self.files.data, new_len)?;
        storage::truncate(&self.files.meta, table_entry_off(self.block_count()))?;
        Ok(())
    }

    /// Force all payload and table bytes to durable storage.
    pub fn flush(&mut self) -> Result<()> {
        storage::sync(&self.files.data)?;
        storage::sync(&self.files.meta)?;
        Ok(())
    }
}
