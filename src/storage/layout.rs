//! Repository data directory layout.
//!
//! Every object is backed by two host files named after the lowercase hex
//! rendering of its 32-byte id: `xx/yy/<rest>` for the payload and
//! `xx/yy/<rest>.meta` for the header and tag table. The first two bytes
//! of the id form the subdirectory prefixes, bounding per-directory fanout.
//! Object host files are created and removed here and never renamed.

use crate::error::{Error, Result};
use crate::fs::types::FileId;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Meta file suffix next to each data file.
const META_SUFFIX: &str = ".meta";

/// Advisory lock file taken while a repository is mounted.
const LOCK_FILE: &str = ".veilfs.lock";

/// The open host file pair backing one object.
pub struct ObjectFiles {
    /// Payload ciphertext stream.
    pub data: File,
    /// Stream header, object header record, and tag table.
    pub meta: File,
}

/// Aggregate statistics over a repository's data directory.
#[derive(Debug, Clone, Copy)]
pub struct RepoStatistics {
    /// Number of stored objects.
    pub object_count: u64,
    /// Total host bytes consumed by object files.
    pub bytes_used: u64,
}

/// Handle to a repository data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Wrap an existing directory as a data directory.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// The repository root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_paths(&self, id: &FileId) -> (PathBuf, PathBuf) {
        let hex = id.to_hex();
        let dir = self.root.join(&hex[..2]).join(&hex[2..4]);
        let data = dir.join(&hex[4..]);
        let meta = dir.join(format!("{}{}", &hex[4..], META_SUFFIX));
        (data, meta)
    }

    /// Whether both host files for `id` are present.
    pub fn object_exists(&self, id: &FileId) -> bool {
        let (data, meta) = self.object_paths(id);
        data.is_file() && meta.is_file()
    }

    /// Create the host file pair for a new object. Both files must not
    /// already exist.
    pub fn create_object(&self, id: &FileId) -> Result<ObjectFiles> {
        let (data_path, meta_path) = self.object_paths(id);
        if let Some(parent) = data_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&data_path)?;
        let meta = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&meta_path)
        {
            Ok(f) => f,
            Err(e) => {
                let _ = std::fs::remove_file(&data_path);
                return Err(e.into());
            }
        };

        Ok(ObjectFiles { data, meta })
    }

    /// Open the host file pair for an existing object.
    ///
    /// Returns `NotFound` if either file is absent.
    pub fn open_object(&self, id: &FileId, writable: bool) -> Result<ObjectFiles> {
        let (data_path, meta_path) = self.object_paths(id);

        let open = |path: &Path| -> Result<File> {
            OpenOptions::new()
                .read(true)
                .write(writable)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        Error::NotFound(id.to_hex())
                    } else {
                        e.into()
                    }
                })
        };

        Ok(ObjectFiles {
            data: open(&data_path)?,
            meta: open(&meta_path)?,
        })
    }

    /// Remove both host files for an object.
    pub fn remove_object(&self, id: &FileId) -> Result<()> {
        let (data_path, meta_path) = self.object_paths(id);
        remove_if_present(&data_path)?;
        remove_if_present(&meta_path)?;
        Ok(())
    }

    /// Take the advisory repository lock. Best effort: if the lock file
    /// already exists (stale crash leftover or a second mount), a warning
    /// is logged and the mount proceeds without owning it.
    pub fn lock(&self) -> RepoLock {
        let path = self.root.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => RepoLock { path: Some(path) },
            Err(e) => {
                warn!(
                    lock = %path.display(),
                    error = %e,
                    "could not take repository lock; is another instance mounted?"
                );
                RepoLock { path: None }
            }
        }
    }

    /// Walk the data directory and tally object count and host bytes.
    pub fn statistics(&self) -> Result<RepoStatistics> {
        let mut object_count = 0u64;
        let mut bytes_used = 0u64;

        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if name.starts_with('.') {
                continue;
            }
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            bytes_used += len;
            if !name.ends_with(META_SUFFIX) {
                object_count += 1;
            }
        }

        Ok(RepoStatistics {
            object_count,
            bytes_used,
        })
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Advisory repository lock; the lock file is removed on drop.
pub struct RepoLock {
    path: Option<PathBuf>,
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// The calling user's uid, or 0 where the platform has no such notion.
pub fn current_uid() -> u32 {
    #[cfg(unix)]
    unsafe {
        libc::getuid()
    }
    #[cfg(not(unix))]
    0
}

/// The calling user's gid, or 0 where the platform has no such notion.
pub fn current_gid() -> u32 {
    #[cfg(unix)]
    unsafe {
        libc::getgid()
    }
    #[cfg(not(unix))]
    0
}
