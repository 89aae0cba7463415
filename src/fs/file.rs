//! In-memory representative of one object: header, stream, and mutex.
//!
//! A [`FileObject`] is the live form of an object of any flavor. The
//! flavor is a closed enum rather than a trait hierarchy; flavor-specific
//! operations check the kind and fail with a type mismatch otherwise, the
//! same signal the operation layer maps to EPERM.
//!
//! All header and stream access goes through the object's own mutex. The
//! [`FileTable`](crate::fs::table::FileTable) guarantees there is at most
//! one `FileObject` per id, so this mutex is the only exclusion needed.

use crate::crypto::NameCipher;
use crate::error::{Error, Result};
use crate::fs::dir::DirIndex;
use crate::fs::stream::BlockStream;
use crate::fs::types::{FileHeader, FileId, FileKind, FileStat, Timespec};
use parking_lot::Mutex;
use std::sync::Arc;

struct FileState {
    header: FileHeader,
    stream: BlockStream,
    header_dirty: bool,
}

/// One live object. Shared through `Arc` by the file table; interior
/// mutability behind a single mutex.
pub struct FileObject {
    id: FileId,
    kind: FileKind,
    names: Arc<NameCipher>,
    state: Mutex<FileState>,
}

impl FileObject {
    pub(crate) fn new(
        id: FileId,
        kind: FileKind,
        names: Arc<NameCipher>,
        header: FileHeader,
        stream: BlockStream,
    ) -> Self {
        Self {
            id,
            kind,
            names,
            state: Mutex::new(FileState {
                header,
                stream,
                header_dirty: false,
            }),
        }
    }

    /// The object's id.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// The object's flavor.
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    fn require_kind(&self, expected: FileKind) -> Result<()> {
        if self.kind == expected {
            return Ok(());
        }
        if expected == FileKind::Regular && self.kind == FileKind::Directory {
            return Err(Error::IsADirectory(self.id.to_hex()));
        }
        Err(Error::TypeMismatch {
            id: self.id.to_hex(),
            expected: expected.as_str(),
            actual: self.kind.as_str(),
        })
    }

    /// Snapshot the object's attributes.
    pub fn stat(&self) -> FileStat {
        let state = self.state.lock();
        FileStat {
            kind: self.kind,
            mode: state.header.mode,
            nlink: state.header.nlink,
            uid: state.header.uid,
            gid: state.header.gid,
            size: state.header.size,
            atime: state.header.atime,
            mtime: state.header.mtime,
            ctime: state.header.ctime,
            birthtime: state.header.birthtime,
        }
    }

    /// Current link count.
    pub fn nlink(&self) -> u32 {
        self.state.lock().header.nlink
    }

    /// Replace the permission bits, preserving the type nibble.
    pub fn set_mode(&self, mode: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.header.mode = (mode & 0o7777) | self.kind.mode_bits();
        touch_ctime(&mut state);
        Ok(())
    }

    /// Set the owning user and group.
    pub fn set_owner(&self, uid: u32, gid: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.header.uid = uid;
        state.header.gid = gid;
        touch_ctime(&mut state);
        Ok(())
    }

    /// Set the link count.
    pub fn set_nlink(&self, nlink: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.header.nlink = nlink;
        touch_ctime(&mut state);
        Ok(())
    }

    /// Update access and/or modification times.
    pub fn set_times(&self, atime: Option<Timespec>, mtime: Option<Timespec>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(t) = atime {
            state.header.atime = t;
        }
        if let Some(t) = mtime {
            state.header.mtime = t;
        }
        touch_ctime(&mut state);
        Ok(())
    }

    /// Mark the object for deletion at last close.
    pub fn unlink(&self) {
        let mut state = self.state.lock();
        state.header.nlink = 0;
        state.header_dirty = true;
    }

    /// Persist a dirty header and force the streams to durable storage.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.header_dirty {
            let header = state.header.clone();
            state.stream.write_header(&header)?;
            state.header_dirty = false;
        }
        state.stream.flush()
    }

    // ---- regular file ----

    /// Read up to `buf.len()` bytes at `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.require_kind(FileKind::Regular)?;
        let mut state = self.state.lock();
        state.stream.read(offset, buf)
    }

    /// Write `data` at `offset`, extending the file as needed.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.require_kind(FileKind::Regular)?;
        let mut state = self.state.lock();
        state.stream.write(offset, data)?;
        sync_size_and_touch(&mut state);
        Ok(data.len())
    }

    /// Truncate or extend the file to exactly `size` bytes.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.require_kind(FileKind::Regular)?;
        let mut state = self.state.lock();
        state.stream.resize(size)?;
        sync_size_and_touch(&mut state);
        Ok(())
    }

    // ---- directory ----

    /// Look up a name in this directory.
    pub fn get_entry(&self, name: &str) -> Result<Option<(FileId, FileKind)>> {
        self.require_kind(FileKind::Directory)?;
        let mut state = self.state.lock();
        let state = &mut *state;
        DirIndex::new(&mut state.stream, &self.names).get_entry(name)
    }

    /// Add a directory entry. Returns `false` if the name already exists.
    pub fn add_entry(&self, name: &str, id: FileId, kind: FileKind) -> Result<bool> {
        self.require_kind(FileKind::Directory)?;
        let mut state = self.state.lock();
        let state = &mut *state;
        let added = DirIndex::new(&mut state.stream, &self.names).add_entry(name, id, kind)?;
        if added {
            sync_size_and_touch(state);
        }
        Ok(added)
    }

    /// Remove a directory entry, returning what it referenced.
    pub fn remove_entry(&self, name: &str) -> Result<Option<(FileId, FileKind)>> {
        self.require_kind(FileKind::Directory)?;
        let mut state = self.state.lock();
        let state = &mut *state;
        let removed = DirIndex::new(&mut state.stream, &self.names).remove_entry(name)?;
        if removed.is_some() {
            sync_size_and_touch(state);
        }
        Ok(removed)
    }

    /// Add or overwrite a directory entry, returning the replaced target.
    pub fn replace_entry(
        &self,
        name: &str,
        id: FileId,
        kind: FileKind,
    ) -> Result<Option<(FileId, FileKind)>> {
        self.require_kind(FileKind::Directory)?;
        let mut state = self.state.lock();
        let state = &mut *state;
        let replaced =
            DirIndex::new(&mut state.stream, &self.names).replace_entry(name, id, kind)?;
        sync_size_and_touch(state);
        Ok(replaced)
    }

    /// Number of entries in this directory.
    pub fn entry_count(&self) -> Result<usize> {
        self.require_kind(FileKind::Directory)?;
        let mut state = self.state.lock();
        let state = &mut *state;
        DirIndex::new(&mut state.stream, &self.names).entry_count()
    }

    /// Visit each entry; the callback returns `false` to stop early.
    pub fn iterate_over_entries(
        &self,
        callback: impl FnMut(&str, FileId, FileKind) -> bool,
    ) -> Result<()> {
        self.require_kind(FileKind::Directory)?;
        let mut state = self.state.lock();
        let state = &mut *state;
        DirIndex::new(&mut state.stream, &self.names).iterate_over_entries(callback)
    }

    // ---- symlink ----

    /// Store the link target.
    pub fn set_target(&self, target: &str) -> Result<()> {
        self.require_kind(FileKind::Symlink)?;
        let mut state = self.state.lock();
        state.stream.write(0, target.as_bytes())?;
        state.stream.resize(target.len() as u64)?;
        sync_size_and_touch(&mut state);
        Ok(())
    }

    /// Read the link target.
    pub fn target(&self) -> Result<String> {
        self.require_kind(FileKind::Symlink)?;
        let mut state = self.state.lock();
        let len = state.stream.len() as usize;
        let mut bytes = vec![0u8; len];
        let read = state.stream.read(0, &mut bytes)?;
        bytes.truncate(read);
        String::from_utf8(bytes)
            .map_err(|_| Error::Corrupted(format!("non-UTF-8 symlink target in {}", self.id)))
    }
}

fn touch_ctime(state: &mut FileState) {
    state.header.ctime = Timespec::now();
    state.header_dirty = true;
}

fn sync_size_and_touch(state: &mut FileState) {
    state.header.size = state.stream.len();
    let now = Timespec::now();
    state.header.mtime = now;
    state.header.ctime = now;
    state.header_dirty = true;
}
