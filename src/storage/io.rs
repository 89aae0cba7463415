//! Low-level positioned read/write operations on host files.

use crate::error::Result;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Read up to `len` bytes at `offset`. Short reads at end-of-file return
/// fewer bytes.
pub fn read_at(file: &File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;

    let mut buffer = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = f.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);

    Ok(buffer)
}

/// Read exactly `buf.len()` bytes at `offset`.
pub fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)?;
    Ok(())
}

/// Write all of `data` at `offset`, extending the file if necessary.
pub fn write_all_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(data)?;
    Ok(())
}

/// Truncate or extend the file to `len` bytes.
pub fn truncate(file: &File, len: u64) -> Result<()> {
    file.set_len(len)?;
    Ok(())
}

/// Force file contents and metadata to durable storage.
pub fn sync(file: &File) -> Result<()> {
    file.sync_all()?;
    Ok(())
}
