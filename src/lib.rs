//! Encrypted overlay filesystem.
//!
//! Stores files, directories, and symlinks as opaque encrypted objects in
//! a data directory on an untrusted host filesystem. Everything the host
//! sees is de-identified: object names are random 32-byte ids, payloads
//! are AES-256-GCM blocks authenticated per block, and directory entry
//! names are encrypted with a deterministic cipher so lookups never need
//! plaintext on disk.
//!
//! # Architecture
//!
//! ```text
//! Operations (paths, POSIX semantics)
//!   → FileTable (one live object per id, refcounting)
//!     → FileObject (file / directory / symlink over a common stream)
//!       → BlockStream (per-block AES-GCM, nonce+tag table)
//!         → host files  xx/yy/<hex-id>  +  xx/yy/<hex-id>.meta
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use veilfs::{Filesystem, OpContext, OpenFlags, RepoConfig};
//! use std::path::Path;
//!
//! let fs = Filesystem::create(Path::new("./vault"), "password", RepoConfig::default()).unwrap();
//! let ctx = OpContext::default();
//!
//! fs.mkdir("/docs", 0o755, &ctx).unwrap();
//! let file = fs.create_file("/docs/note.txt", 0o644, &ctx).unwrap();
//! fs.write(&file, 0, b"hidden away").unwrap();
//! drop(file);
//!
//! let file = fs.open("/docs/note.txt", OpenFlags::read_only()).unwrap();
//! let mut buf = [0u8; 11];
//! fs.read(&file, 0, &mut buf).unwrap();
//! assert_eq!(&buf, b"hidden away");
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod storage;

pub use config::RepoConfig;
pub use error::{Error, Result};
pub use fs::{Filesystem, MountOptions, OpContext, OpenFlags};
