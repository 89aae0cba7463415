//! The encrypted filesystem core.
//!
//! Layered bottom-up: authenticated block [`stream`]s over object host
//! files, [`file`] objects of three flavors on top of them, the [`table`]
//! guaranteeing one live object per id, and the [`operations`] surface
//! resolving paths and dispatching typed operations.

mod dir;
mod file;
mod operations;
mod path;
mod stream;
pub mod superblock;
mod table;
pub mod types;

pub use file::FileObject;
pub use operations::{Filesystem, FsStatistics, MountOptions, OpContext, OpenFlags};
pub use path::FsPath;
pub use stream::BlockStream;
pub use table::{FileGuard, FileTable};
pub use types::{DirEntry, FileId, FileKind, FileStat, Timespec};
