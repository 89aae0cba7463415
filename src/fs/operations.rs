//! The VFS operation surface consumed by driver bridges and the CLI.
//!
//! Every operation takes a textual absolute path, resolves it against the
//! root directory through the file table, performs the typed operation
//! under the object's mutex, and reports failures as [`Error`] values. A
//! driver bridge translates those to negative POSIX numbers via
//! [`Error::errno`]; anything it cannot classify it reports as `EPERM`.
//!
//! Handle-returning operations (`open`, `create`, `opendir`) hand back a
//! [`FileGuard`]; bridges that park objects in a kernel handle slot call
//! [`FileGuard::release`] and later [`Filesystem::release`].

use crate::config::RepoConfig;
use crate::error::{Error, Result};
use crate::fs::file::FileObject;
use crate::fs::path::FsPath;
use crate::fs::superblock::Superblock;
use crate::fs::table::{FileGuard, FileTable};
use crate::fs::types::{DirEntry, FileId, FileKind, FileStat, Timespec};
use crate::storage::{current_gid, current_uid, DataDir, RepoLock};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Mount-time options.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Refuse all mutation with `EROFS`.
    pub readonly: bool,
}

/// Identity of the calling user, carried per request by the bridge.
#[derive(Debug, Clone, Copy)]
pub struct OpContext {
    pub uid: u32,
    pub gid: u32,
}

impl Default for OpContext {
    fn default() -> Self {
        Self {
            uid: current_uid(),
            gid: current_gid(),
        }
    }
}

/// POSIX-style open flags, reduced to what the core acts on.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Opened for writing (`O_WRONLY`, `O_RDWR`, or `O_APPEND`).
    pub write: bool,
    /// Truncate to zero length on open (`O_TRUNC`).
    pub truncate: bool,
}

impl OpenFlags {
    /// Read-only open.
    pub fn read_only() -> Self {
        Self::default()
    }

    /// Read-write open.
    pub fn read_write() -> Self {
        Self {
            write: true,
            truncate: false,
        }
    }
}

/// Filesystem-wide statistics reported by `statfs`.
#[derive(Debug, Clone, Copy)]
pub struct FsStatistics {
    /// Plaintext block size.
    pub block_size: u32,
    /// Number of stored objects.
    pub object_count: u64,
    /// Host bytes consumed by the repository.
    pub bytes_used: u64,
}

/// A mounted encrypted filesystem.
pub struct Filesystem {
    table: FileTable,
    root_id: FileId,
    _lock: RepoLock,
}

impl Filesystem {
    /// Initialize a new repository in `dir` and mount it.
    ///
    /// Creates the metadata file and the root directory object, whose id
    /// is fixed here for the repository's lifetime.
    pub fn create(dir: &Path, password: &str, config: RepoConfig) -> Result<Self> {
        let sb = Superblock::create(dir, password, &config)?;
        let data_dir = DataDir::new(dir);
        let lock = data_dir.lock();
        let table = FileTable::new(
            data_dir,
            sb.master_key,
            sb.name_key,
            sb.block_size,
            false,
        );

        {
            let root = table.create_with_id(sb.root_id, FileKind::Directory)?;
            root.set_mode(0o755)?;
            root.set_nlink(1)?;
            root.flush()?;
        }
        info!(repository = %dir.display(), "repository initialized");

        Ok(Self {
            table,
            root_id: sb.root_id,
            _lock: lock,
        })
    }

    /// Mount an existing repository.
    pub fn mount(dir: &Path, password: &str, options: MountOptions) -> Result<Self> {
        let sb = Superblock::load(dir, password)?;
        let data_dir = DataDir::new(dir);
        let lock = data_dir.lock();
        let table = FileTable::new(
            data_dir,
            sb.master_key,
            sb.name_key,
            sb.block_size,
            options.readonly,
        );

        // Sanity: the root directory object must be present and well-typed.
        table
            .open_as(sb.root_id, FileKind::Directory)
            .map_err(|e| match e {
                Error::NotFound(_) => {
                    Error::Corrupted("root directory object missing".to_string())
                }
                other => other,
            })?;
        info!(
            repository = %dir.display(),
            readonly = options.readonly,
            "repository mounted"
        );

        Ok(Self {
            table,
            root_id: sb.root_id,
            _lock: lock,
        })
    }

    /// The repository's plaintext block size.
    pub fn block_size(&self) -> u32 {
        self.table.block_size()
    }

    /// Whether the mount refuses mutation.
    pub fn is_readonly(&self) -> bool {
        self.table.is_readonly()
    }

    fn check_writable(&self) -> Result<()> {
        if self.table.is_readonly() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    // ---- path resolution ----

    fn open_root(&self) -> Result<FileGuard<'_>> {
        self.table.open_as(self.root_id, FileKind::Directory)
    }

    /// Walk to the parent directory of `path`. Returns the parent guard
    /// and the final component, or `None` when the path is the root.
    fn open_parent<'p>(&self, path: &'p FsPath) -> Result<(FileGuard<'_>, Option<&'p str>)> {
        let mut dir = self.open_root()?;
        for component in path.parent_components() {
            let (id, kind) = dir
                .get_entry(component)?
                .ok_or_else(|| Error::NotFound(component.clone()))?;
            if kind != FileKind::Directory {
                return Err(Error::NotADirectory(component.clone()));
            }
            dir = self.table.open_as(id, kind)?;
        }
        Ok((dir, path.name()))
    }

    /// Walk to the object named by `path`, whatever its flavor.
    fn open_path(&self, path: &FsPath) -> Result<FileGuard<'_>> {
        let (dir, name) = self.open_parent(path)?;
        let name = match name {
            None => return Ok(dir),
            Some(n) => n,
        };
        let (id, kind) = dir
            .get_entry(name)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        self.table.open_as(id, kind)
    }

    /// Create an object of `kind`, link it under `path`, and return it.
    /// On any failure the fresh object is unlinked so its host files are
    /// reclaimed when the guard drops.
    fn create_linked(&self, path: &FsPath, kind: FileKind) -> Result<FileGuard<'_>> {
        self.check_writable()?;
        let (parent, name) = self.open_parent(path)?;
        let name = name.ok_or_else(|| Error::Exists("/".to_string()))?;

        let fg = self.table.create_as(kind)?;
        let linked = (|| -> Result<bool> {
            let added = parent.add_entry(name, fg.id(), kind)?;
            if added {
                parent.flush()?;
            }
            Ok(added)
        })();

        match linked {
            Ok(true) => Ok(fg),
            Ok(false) => {
                fg.unlink();
                Err(Error::Exists(path.to_string()))
            }
            Err(e) => {
                fg.unlink();
                Err(e)
            }
        }
    }

    // ---- attribute operations ----

    /// Attributes of the object at `path`.
    pub fn getattr(&self, path: &str) -> Result<FileStat> {
        let path = FsPath::parse(path)?;
        Ok(self.open_path(&path)?.stat())
    }

    /// Replace the permission bits of the object at `path`.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.check_writable()?;
        let path = FsPath::parse(path)?;
        let fg = self.open_path(&path)?;
        fg.set_mode(mode & 0o7777)?;
        fg.flush()
    }

    /// Change the owner of the object at `path`.
    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.check_writable()?;
        let path = FsPath::parse(path)?;
        let fg = self.open_path(&path)?;
        fg.set_owner(uid, gid)?;
        fg.flush()
    }

    /// Update access and modification times of the object at `path`.
    pub fn utimens(
        &self,
        path: &str,
        atime: Option<Timespec>,
        mtime: Option<Timespec>,
    ) -> Result<()> {
        self.check_writable()?;
        let path = FsPath::parse(path)?;
        let fg = self.open_path(&path)?;
        fg.set_times(atime, mtime)?;
        fg.flush()
    }

    // ---- regular files ----

    /// Create a regular file and return its handle.
    pub fn create_file(
        &self,
        path: &str,
        mode: u32,
        ctx: &OpContext,
    ) -> Result<FileGuard<'_>> {
        let parsed = FsPath::parse(path)?;
        let fg = self.create_linked(&parsed, FileKind::Regular)?;
        fg.set_owner(ctx.uid, ctx.gid)?;
        fg.set_nlink(1)?;
        fg.set_mode(mode)?;
        fg.flush()?;
        debug!(path, object = %fg.id(), "created file");
        Ok(fg)
    }

    /// Open the regular file at `path`.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<FileGuard<'_>> {
        if flags.write || flags.truncate {
            self.check_writable()?;
        }
        let parsed = FsPath::parse(path)?;
        let fg = self.open_path(&parsed)?;
        match fg.kind() {
            FileKind::Regular => {}
            FileKind::Directory => return Err(Error::IsADirectory(path.to_string())),
            FileKind::Symlink => {
                return Err(Error::TypeMismatch {
                    id: fg.id().to_hex(),
                    expected: FileKind::Regular.as_str(),
                    actual: FileKind::Symlink.as_str(),
                })
            }
        }
        if flags.truncate {
            fg.truncate(0)?;
        }
        Ok(fg)
    }

    /// Read from an open file handle.
    pub fn read(&self, file: &FileObject, offset: u64, buf: &mut [u8]) -> Result<usize> {
        file.read(offset, buf)
    }

    /// Write through an open file handle.
    pub fn write(&self, file: &FileObject, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        file.write(offset, data)
    }

    /// Flush an open handle's pending state to durable storage.
    pub fn flush(&self, file: &FileObject) -> Result<()> {
        file.flush()
    }

    /// Close a handle previously detached with [`FileGuard::release`].
    pub fn release(&self, handle: Arc<FileObject>) -> Result<()> {
        let guard = self.table.reclaim(handle);
        guard.flush()?;
        Ok(())
    }

    /// Truncate the file at `path` to `size` bytes.
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        self.check_writable()?;
        let parsed = FsPath::parse(path)?;
        let fg = self.open_path(&parsed)?;
        fg.truncate(size)?;
        fg.flush()
    }

    /// Truncate through an open file handle.
    pub fn ftruncate(&self, file: &FileObject, size: u64) -> Result<()> {
        self.check_writable()?;
        file.truncate(size)?;
        file.flush()
    }

    /// Remove the object at `path`. Directories are accepted too
    /// (`rmdir` adds the type check); a non-empty directory is refused
    /// either way.
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.remove(path, false)
    }

    // ---- directories ----

    /// Create a directory at `path`.
    pub fn mkdir(&self, path: &str, mode: u32, ctx: &OpContext) -> Result<()> {
        let parsed = FsPath::parse(path)?;
        let fg = self.create_linked(&parsed, FileKind::Directory)?;
        fg.set_owner(ctx.uid, ctx.gid)?;
        fg.set_nlink(1)?;
        fg.set_mode(mode)?;
        fg.flush()?;
        debug!(path, object = %fg.id(), "created directory");
        Ok(())
    }

    /// Remove the empty directory at `path`.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.remove(path, true)
    }

    /// Open the directory at `path` for enumeration.
    pub fn opendir(&self, path: &str) -> Result<FileGuard<'_>> {
        let parsed = FsPath::parse(path)?;
        let fg = self.open_path(&parsed)?;
        if fg.kind() != FileKind::Directory {
            return Err(Error::NotADirectory(path.to_string()));
        }
        Ok(fg)
    }

    /// List a directory handle, with `.` and `..` synthesized first.
    pub fn readdir(&self, dir: &FileObject) -> Result<Vec<DirEntry>> {
        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                id: dir.id(),
                kind: FileKind::Directory,
            },
            DirEntry {
                name: "..".to_string(),
                id: dir.id(),
                kind: FileKind::Directory,
            },
        ];
        dir.iterate_over_entries(|name, id, kind| {
            entries.push(DirEntry {
                name: name.to_string(),
                id,
                kind,
            });
            true
        })?;
        Ok(entries)
    }

    fn remove(&self, path: &str, expect_dir: bool) -> Result<()> {
        self.check_writable()?;
        let parsed = FsPath::parse(path)?;
        let (parent, name) = self.open_parent(&parsed)?;
        let name = name.ok_or_else(|| {
            Error::InvalidPath("cannot remove the root directory".to_string())
        })?;

        let (id, kind) = parent
            .get_entry(name)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if expect_dir && kind != FileKind::Directory {
            return Err(Error::NotADirectory(path.to_string()));
        }

        let target = self.table.open_as(id, kind)?;
        parent
            .remove_entry(name)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        // Structural precondition re-checked after the removal so a
        // concurrent entry insertion cannot orphan children; the parent
        // entry is restored if the directory filled up meanwhile.
        if kind == FileKind::Directory && target.entry_count()? > 0 {
            parent.add_entry(name, id, kind)?;
            parent.flush()?;
            return Err(Error::NotEmpty(path.to_string()));
        }

        parent.flush()?;
        target.unlink();
        debug!(path, object = %id, "removed");
        Ok(())
    }

    // ---- symlinks ----

    /// Create a symbolic link at `link_path` pointing to `target`.
    pub fn symlink(&self, target: &str, link_path: &str, ctx: &OpContext) -> Result<()> {
        if cfg!(windows) {
            // The Windows-family driver cannot materialize symlinks.
            return Err(Error::NotImplemented);
        }
        let parsed = FsPath::parse(link_path)?;
        let fg = self.create_linked(&parsed, FileKind::Symlink)?;
        fg.set_owner(ctx.uid, ctx.gid)?;
        fg.set_nlink(1)?;
        fg.set_mode(0o755)?;
        fg.set_target(target)?;
        fg.flush()?;
        Ok(())
    }

    /// Read the target of the symbolic link at `path`. Callers with a
    /// fixed-size buffer truncate to `size - 1` bytes.
    pub fn readlink(&self, path: &str) -> Result<String> {
        if cfg!(windows) {
            return Err(Error::NotImplemented);
        }
        let parsed = FsPath::parse(path)?;
        self.open_path(&parsed)?.target()
    }

    /// Hard links are not supported: removal-by-path would have to
    /// decrement a shared link count instead of deleting.
    pub fn link(&self, _existing: &str, _new: &str) -> Result<()> {
        Err(Error::NotImplemented)
    }

    // ---- rename ----

    /// Move `src` to `dst`, replacing any existing destination entry.
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.check_writable()?;
        let src_parsed = FsPath::parse(src)?;
        let dst_parsed = FsPath::parse(dst)?;

        let (src_parent, src_name) = self.open_parent(&src_parsed)?;
        let src_name = src_name
            .ok_or_else(|| Error::InvalidPath("cannot rename the root directory".to_string()))?;
        let (dst_parent, dst_name) = self.open_parent(&dst_parsed)?;
        let dst_name = dst_name
            .ok_or_else(|| Error::InvalidPath("cannot rename onto the root".to_string()))?;

        if src_parent.id() == dst_parent.id() && src_name == dst_name {
            return Ok(());
        }

        self.table
            .rename_entry(&src_parent, src_name, &dst_parent, dst_name)
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(src.to_string()),
                Error::NotEmpty(_) => Error::NotEmpty(dst.to_string()),
                other => other,
            })?;
        debug!(src, dst, "renamed");
        Ok(())
    }

    // ---- filesystem-wide ----

    /// Repository-wide statistics.
    pub fn statfs(&self) -> Result<FsStatistics> {
        let stats = self.table.statistics()?;
        Ok(FsStatistics {
            block_size: self.table.block_size(),
            object_count: stats.object_count,
            bytes_used: stats.bytes_used,
        })
    }
}
