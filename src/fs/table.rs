//! The file table: registry of live objects with reference counting.
//!
//! The table guarantees at most one [`FileObject`] per id. Handles are
//! [`FileGuard`]s that close through the table on drop; when an object's
//! reference count reaches zero it leaves the table, and if its link count
//! is also zero its host files are deleted.
//!
//! Lock hierarchy: the table mutex is always taken before any object
//! mutex, never after.

use crate::crypto::{derive_file_key, BlockCipher, NameCipher};
use crate::error::{Error, Result};
use crate::fs::file::FileObject;
use crate::fs::stream::BlockStream;
use crate::fs::types::{FileHeader, FileId, FileKind};
use crate::storage::{current_gid, current_uid, DataDir, RepoStatistics};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tracing::warn;

struct Slot {
    file: Arc<FileObject>,
    refcount: usize,
}

/// Registry mapping ids to live objects.
pub struct FileTable {
    data_dir: DataDir,
    master_key: [u8; 32],
    names: Arc<NameCipher>,
    block_size: u32,
    readonly: bool,
    live: Mutex<HashMap<FileId, Slot>>,
}

impl FileTable {
    pub fn new(
        data_dir: DataDir,
        master_key: [u8; 32],
        name_key: [u8; 32],
        block_size: u32,
        readonly: bool,
    ) -> Self {
        Self {
            data_dir,
            master_key,
            names: Arc::new(NameCipher::new(name_key)),
            block_size,
            readonly,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the mount refuses mutation.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// The repository's plaintext block size.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn cipher_for(&self, id: &FileId) -> BlockCipher {
        BlockCipher::new(derive_file_key(&self.master_key, id.as_bytes()))
    }

    /// Open the object `id`, expecting flavor `kind`.
    ///
    /// Returns the existing live instance with its reference count bumped,
    /// or loads the object from its host files. `NotFound` if the host
    /// files are absent; `TypeMismatch` if the on-disk flavor disagrees.
    pub fn open_as(&self, id: FileId, kind: FileKind) -> Result<FileGuard<'_>> {
        let mut live = self.live.lock();
        let file = self.open_as_locked(&mut live, id, kind)?;
        Ok(FileGuard {
            table: self,
            file: Some(file),
        })
    }

    fn open_as_locked(
        &self,
        live: &mut HashMap<FileId, Slot>,
        id: FileId,
        kind: FileKind,
    ) -> Result<Arc<FileObject>> {
        if let Some(slot) = live.get_mut(&id) {
            if slot.file.kind() != kind {
                return Err(Error::TypeMismatch {
                    id: id.to_hex(),
                    expected: kind.as_str(),
                    actual: slot.file.kind().as_str(),
                });
            }
            slot.refcount += 1;
            return Ok(Arc::clone(&slot.file));
        }

        let files = self.data_dir.open_object(&id, !self.readonly)?;
        let (stream, header) = BlockStream::open(id, files, self.cipher_for(&id))?;
        let actual = header
            .kind()
            .ok_or_else(|| Error::Corrupted(format!("unknown type nibble in object {}", id)))?;
        if actual != kind {
            return Err(Error::TypeMismatch {
                id: id.to_hex(),
                expected: kind.as_str(),
                actual: actual.as_str(),
            });
        }

        let file = Arc::new(FileObject::new(
            id,
            kind,
            Arc::clone(&self.names),
            header,
            stream,
        ));
        live.insert(
            id,
            Slot {
                file: Arc::clone(&file),
                refcount: 1,
            },
        );
        Ok(file)
    }

    /// Create a brand-new object of flavor `kind` under a fresh random id.
    ///
    /// The object starts with `nlink = 0` and a type-bit-only mode; the
    /// caller links it into a directory and raises the link count, or
    /// unlinks it on failure so the close path deletes the host files.
    pub fn create_as(&self, kind: FileKind) -> Result<FileGuard<'_>> {
        self.create_with_id(FileId::random(), kind)
    }

    /// Create a new object under a caller-chosen id (repository
    /// initialization uses this for the root directory).
    pub(crate) fn create_with_id(&self, id: FileId, kind: FileKind) -> Result<FileGuard<'_>> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        let mut live = self.live.lock();

        let files = self.data_dir.create_object(&id)?;
        let header = FileHeader::new(kind, current_uid(), current_gid());
        let stream =
            BlockStream::create(id, files, self.cipher_for(&id), self.block_size, &header)?;

        let file = Arc::new(FileObject::new(
            id,
            kind,
            Arc::clone(&self.names),
            header,
            stream,
        ));
        live.insert(
            id,
            Slot {
                file: Arc::clone(&file),
                refcount: 1,
            },
        );
        Ok(FileGuard {
            table: self,
            file: Some(file),
        })
    }

    /// Drop one reference to `file`. At zero the object leaves the table;
    /// with `nlink == 0` its host files are deleted, otherwise it is
    /// flushed a final time.
    fn close(&self, file: &Arc<FileObject>) {
        let mut live = self.live.lock();
        self.close_locked(&mut live, file);
    }

    fn close_locked(&self, live: &mut HashMap<FileId, Slot>, file: &Arc<FileObject>) {
        let id = file.id();

        let remove = match live.get_mut(&id) {
            Some(slot) => {
                slot.refcount -= 1;
                slot.refcount == 0
            }
            None => false,
        };
        if !remove {
            return;
        }
        live.remove(&id);

        // Still under the table mutex, so no second instance of this id can
        // be loaded while the final flush or deletion runs.
        if file.nlink() == 0 {
            if let Err(e) = self.data_dir.remove_object(&id) {
                warn!(object = %id, error = %e, "failed to remove unlinked object files");
            }
        } else if let Err(e) = file.flush() {
            warn!(object = %id, error = %e, "flush on close failed");
        }
    }

    /// Wrap a handle previously detached with [`FileGuard::release`] back
    /// into a guard, without touching the reference count.
    pub fn reclaim(&self, file: Arc<FileObject>) -> FileGuard<'_> {
        FileGuard {
            table: self,
            file: Some(file),
        }
    }

    /// Atomically move the entry `src_name` of `src_parent` to `dst_name`
    /// of `dst_parent`, replacing any existing destination entry.
    ///
    /// The whole exchange runs under the table mutex, so no open, close,
    /// or concurrent rename interleaves with it. A replaced directory is
    /// only discarded if it is empty when checked here, under the mutex;
    /// otherwise both entries are restored and `NotEmpty` is returned.
    /// If the add side fails, the removal is undone.
    pub fn rename_entry(
        &self,
        src_parent: &FileObject,
        src_name: &str,
        dst_parent: &FileObject,
        dst_name: &str,
    ) -> Result<()> {
        let mut live = self.live.lock();
        let same_parent = src_parent.id() == dst_parent.id();

        let (id, kind) = src_parent
            .remove_entry(src_name)?
            .ok_or_else(|| Error::NotFound(src_name.to_string()))?;
        let target_parent = if same_parent { src_parent } else { dst_parent };

        let replaced = match target_parent.replace_entry(dst_name, id, kind) {
            Ok(replaced) => replaced,
            Err(e) => {
                src_parent.add_entry(src_name, id, kind)?;
                src_parent.flush()?;
                return Err(e);
            }
        };

        if let Some((victim_id, victim_kind)) = replaced {
            // The emptiness check must run here, under the table mutex
            // and after the swap; a pre-lock check goes stale against a
            // concurrent create into the victim, and the swap would then
            // orphan the new child.
            let verdict = match self.open_as_locked(&mut live, victim_id, victim_kind) {
                Err(e) => Err(e),
                Ok(victim) => {
                    let verdict = if victim_kind != FileKind::Directory {
                        Ok(())
                    } else {
                        match victim.entry_count() {
                            Ok(0) => Ok(()),
                            Ok(_) => Err(Error::NotEmpty(dst_name.to_string())),
                            Err(e) => Err(e),
                        }
                    };
                    if verdict.is_ok() {
                        victim.unlink();
                    }
                    self.close_locked(&mut live, &victim);
                    verdict
                }
            };

            if let Err(e) = verdict {
                // Restore both entries so the tree is unchanged.
                target_parent.replace_entry(dst_name, victim_id, victim_kind)?;
                src_parent.add_entry(src_name, id, kind)?;
                src_parent.flush()?;
                if !same_parent {
                    dst_parent.flush()?;
                }
                return Err(e);
            }
        }

        src_parent.flush()?;
        if !same_parent {
            dst_parent.flush()?;
        }
        Ok(())
    }

    /// Number of live objects (for diagnostics and tests).
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Host-filesystem statistics for the repository.
    pub fn statistics(&self) -> Result<RepoStatistics> {
        self.data_dir.statistics()
    }
}

impl Drop for FileTable {
    fn drop(&mut self) {
        // Force-unmount drains whatever handles remain.
        let live = std::mem::take(&mut *self.live.lock());
        for (id, slot) in live {
            if slot.file.nlink() == 0 {
                let _ = self.data_dir.remove_object(&id);
            } else if let Err(e) = slot.file.flush() {
                warn!(object = %id, error = %e, "flush during unmount failed");
            }
        }
    }
}

/// Scoped handle over a live object; closes through the table on drop.
pub struct FileGuard<'t> {
    table: &'t FileTable,
    file: Option<Arc<FileObject>>,
}

impl FileGuard<'_> {
    /// Detach the object from guard cleanup, keeping its reference count.
    /// Used by handle-returning operations that park the object in a
    /// driver-supplied handle slot; `FileTable::reclaim` reverses it.
    pub fn release(mut self) -> Arc<FileObject> {
        self.file.take().expect("guard already released")
    }
}

impl std::fmt::Debug for FileGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file {
            Some(file) => f
                .debug_struct("FileGuard")
                .field("id", &file.id())
                .field("kind", &file.kind())
                .finish(),
            None => f.write_str("FileGuard(released)"),
        }
    }
}

impl Deref for FileGuard<'_> {
    type Target = FileObject;

    fn deref(&self) -> &FileObject {
        self.file.as_deref().expect("guard already released")
    }
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.table.close(&file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_table(tmp: &TempDir, readonly: bool) -> FileTable {
        FileTable::new(
            DataDir::new(tmp.path()),
            [1u8; 32],
            [2u8; 32],
            512,
            readonly,
        )
    }

    #[test]
    fn test_create_then_reopen_same_instance() {
        let tmp = TempDir::new().unwrap();
        let table = make_table(&tmp, false);

        let created = table.create_as(FileKind::Regular).unwrap();
        created.set_nlink(1).unwrap();
        let id = created.id();

        let reopened = table.open_as(id, FileKind::Regular).unwrap();
        assert!(Arc::ptr_eq(
            created.file.as_ref().unwrap(),
            reopened.file.as_ref().unwrap()
        ));
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_type_mismatch_is_distinct_from_not_found() {
        let tmp = TempDir::new().unwrap();
        let table = make_table(&tmp, false);

        let dir = table.create_as(FileKind::Directory).unwrap();
        dir.set_nlink(1).unwrap();
        let id = dir.id();

        assert!(matches!(
            table.open_as(id, FileKind::Regular),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            table.open_as(FileId::from_bytes([0xEE; 32]), FileKind::Regular),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_close_removes_from_table_and_persists() {
        let tmp = TempDir::new().unwrap();
        let table = make_table(&tmp, false);

        let id = {
            let file = table.create_as(FileKind::Regular).unwrap();
            file.set_nlink(1).unwrap();
            file.write(0, b"data").unwrap();
            file.id()
        };
        assert_eq!(table.live_count(), 0);

        // Loads fresh from disk.
        let file = table.open_as(id, FileKind::Regular).unwrap();
        let mut buf = [0u8; 4];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn test_unlinked_object_deleted_at_last_close() {
        let tmp = TempDir::new().unwrap();
        let table = make_table(&tmp, false);
        let data_dir = DataDir::new(tmp.path());

        let file = table.create_as(FileKind::Regular).unwrap();
        file.set_nlink(1).unwrap();
        let id = file.id();

        let second = table.open_as(id, FileKind::Regular).unwrap();
        file.unlink();
        drop(file);

        // Still referenced: host files survive.
        assert!(data_dir.object_exists(&id));

        drop(second);
        assert!(!data_dir.object_exists(&id));
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_release_and_reclaim_keep_object_live() {
        let tmp = TempDir::new().unwrap();
        let table = make_table(&tmp, false);

        let guard = table.create_as(FileKind::Regular).unwrap();
        guard.set_nlink(1).unwrap();
        let id = guard.id();

        let handle = guard.release();
        assert_eq!(table.live_count(), 1);

        let guard = table.reclaim(handle);
        assert_eq!(guard.id(), id);
        drop(guard);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_create_on_readonly_table_fails() {
        let tmp = TempDir::new().unwrap();
        let table = make_table(&tmp, true);

        assert!(matches!(
            table.create_as(FileKind::Regular),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn test_rename_entry_moves_and_reclaims_replaced_object() {
        let tmp = TempDir::new().unwrap();
        let table = make_table(&tmp, false);
        let data_dir = DataDir::new(tmp.path());

        let src_dir = table.create_as(FileKind::Directory).unwrap();
        src_dir.set_nlink(1).unwrap();
        let dst_dir = table.create_as(FileKind::Directory).unwrap();
        dst_dir.set_nlink(1).unwrap();

        let moved = table.create_as(FileKind::Regular).unwrap();
        moved.set_nlink(1).unwrap();
        let victim = table.create_as(FileKind::Regular).unwrap();
        victim.set_nlink(1).unwrap();
        let victim_id = victim.id();
        drop(victim);

        src_dir
            .add_entry("m", moved.id(), FileKind::Regular)
            .unwrap();
        dst_dir
            .add_entry("v", victim_id, FileKind::Regular)
            .unwrap();

        table.rename_entry(&src_dir, "m", &dst_dir, "v").unwrap();

        assert_eq!(src_dir.get_entry("m").unwrap(), None);
        assert_eq!(
            dst_dir.get_entry("v").unwrap(),
            Some((moved.id(), FileKind::Regular))
        );
        assert!(!data_dir.object_exists(&victim_id));
    }

    #[test]
    fn test_rename_entry_restores_entries_when_destination_populated() {
        let tmp = TempDir::new().unwrap();
        let table = make_table(&tmp, false);

        let src_dir = table.create_as(FileKind::Directory).unwrap();
        src_dir.set_nlink(1).unwrap();
        let dst_dir = table.create_as(FileKind::Directory).unwrap();
        dst_dir.set_nlink(1).unwrap();

        let moved = table.create_as(FileKind::Regular).unwrap();
        moved.set_nlink(1).unwrap();
        let victim = table.create_as(FileKind::Directory).unwrap();
        victim.set_nlink(1).unwrap();
        let child = table.create_as(FileKind::Regular).unwrap();
        child.set_nlink(1).unwrap();
        victim
            .add_entry("c", child.id(), FileKind::Regular)
            .unwrap();

        src_dir
            .add_entry("m", moved.id(), FileKind::Regular)
            .unwrap();
        dst_dir
            .add_entry("v", victim.id(), FileKind::Directory)
            .unwrap();

        let err = table
            .rename_entry(&src_dir, "m", &dst_dir, "v")
            .unwrap_err();
        assert!(matches!(err, Error::NotEmpty(_)));

        // Both entries intact, and the populated victim keeps its child.
        assert_eq!(
            src_dir.get_entry("m").unwrap(),
            Some((moved.id(), FileKind::Regular))
        );
        assert_eq!(
            dst_dir.get_entry("v").unwrap(),
            Some((victim.id(), FileKind::Directory))
        );
        assert_eq!(
            victim.get_entry("c").unwrap(),
            Some((child.id(), FileKind::Regular))
        );
    }

    #[test]
    fn test_concurrent_opens_share_one_instance() {
        let tmp = TempDir::new().unwrap();
        let table = Arc::new(make_table(&tmp, false));

        let file = table.create_as(FileKind::Regular).unwrap();
        file.set_nlink(1).unwrap();
        let id = file.id();
        drop(file);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let table = Arc::clone(&table);
                scope.spawn(move || {
                    for _ in 0..50 {
                        let guard = table.open_as(id, FileKind::Regular).unwrap();
                        assert_eq!(guard.id(), id);
                    }
                });
            }
        });

        assert_eq!(table.live_count(), 0);
    }
}
