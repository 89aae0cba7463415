//! Error types for the encrypted filesystem.
//!
//! Every failure surfaced by the operation layer maps to a POSIX error
//! number through [`Error::errno`]; driver bridges negate that value for
//! their callback return codes.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for filesystem operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in filesystem operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the host filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry or object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Entry already exists.
    #[error("already exists: {0}")]
    Exists(String),

    /// Traversal through something that is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Byte-level operation on a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Object flavor disagrees with what the operation expects.
    #[error("object {id} is a {actual}, expected {expected}")]
    TypeMismatch {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Directory still has entries.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Mutation attempted on a read-only mount.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Operation the platform or format does not provide.
    #[error("operation not supported")]
    NotImplemented,

    /// Block or filename MAC verification failed.
    #[error("authentication failed for object {0}")]
    AuthFailed(String),

    /// Structural invariant violated on disk.
    #[error("repository corrupted: {0}")]
    Corrupted(String),

    /// Malformed path argument.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Decryption failed (wrong password or corrupted metadata).
    #[error("decryption failed: wrong password or corrupted data")]
    Decryption,

    /// Encryption error.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Key derivation error.
    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Repository already initialized in the target directory.
    #[error("repository already exists in {0}")]
    AlreadyInitialized(PathBuf),

    /// No repository found in the target directory.
    #[error("no repository found in {0}")]
    NotInitialized(PathBuf),

    /// On-disk format version not understood.
    #[error("format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

impl Error {
    /// POSIX error number for this error.
    ///
    /// Driver bridges return the negated value from their callbacks.
    /// Errors without a natural POSIX equivalent report `EPERM`, matching
    /// the catch-all behavior at the operation boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::NotFound(_) => libc::ENOENT,
            Error::Exists(_) => libc::EEXIST,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::TypeMismatch { .. } => libc::EPERM,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::ReadOnly => libc::EROFS,
            Error::NotImplemented => libc::ENOSYS,
            Error::AuthFailed(_) => libc::EIO,
            Error::Corrupted(_) => libc::EIO,
            Error::InvalidPath(_) => libc::EINVAL,
            Error::Decryption => libc::EIO,
            _ => libc::EPERM,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound("/a".into()).errno(), libc::ENOENT);
        assert_eq!(Error::Exists("/a".into()).errno(), libc::EEXIST);
        assert_eq!(Error::ReadOnly.errno(), libc::EROFS);
        assert_eq!(Error::NotImplemented.errno(), libc::ENOSYS);
        assert_eq!(Error::AuthFailed("ab".into()).errno(), libc::EIO);
        assert_eq!(Error::NotEmpty("/d".into()).errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn test_io_errno_passthrough() {
        let e = Error::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.errno(), libc::ENOSPC);
    }

    #[test]
    fn test_catch_all_is_eperm() {
        assert_eq!(Error::Decryption.errno(), libc::EIO);
        assert_eq!(
            Error::Serialization("bad".into()).errno(),
            libc::EPERM
        );
    }
}
