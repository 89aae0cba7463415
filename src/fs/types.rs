//! Core filesystem types: object ids, flavors, headers, directory entries.

use crate::config::ID_SIZE;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// POSIX mode type nibble constants.
pub mod mode {
    /// Mask for the type nibble.
    pub const IFMT: u32 = 0o170000;
    /// Regular file.
    pub const IFREG: u32 = 0o100000;
    /// Directory.
    pub const IFDIR: u32 = 0o040000;
    /// Symbolic link.
    pub const IFLNK: u32 = 0o120000;
}

/// Opaque 32-byte object identifier.
///
/// Generated by the CSPRNG at object creation; doubles as the stem of the
/// object's host filenames (lowercase hex) and as the primary key in
/// directory indexes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId([u8; ID_SIZE]);

impl FileId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw bytes as an id.
    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering, used for host filenames.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({}…)", &self.to_hex()[..8])
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The three object flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// A byte-addressable regular file.
    Regular,
    /// A name → (id, kind) index.
    Directory,
    /// A symbolic link holding a UTF-8 target.
    Symlink,
}

impl FileKind {
    /// The mode type nibble for this flavor.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileKind::Regular => mode::IFREG,
            FileKind::Directory => mode::IFDIR,
            FileKind::Symlink => mode::IFLNK,
        }
    }

    /// Recover the flavor from a full mode value.
    pub fn from_mode(m: u32) -> Option<Self> {
        match m & mode::IFMT {
            mode::IFREG => Some(FileKind::Regular),
            mode::IFDIR => Some(FileKind::Directory),
            mode::IFLNK => Some(FileKind::Symlink),
            _ => None,
        }
    }

    /// Human-readable flavor name, used in error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Regular => "regular file",
            FileKind::Directory => "directory",
            FileKind::Symlink => "symlink",
        }
    }
}

/// A second/nanosecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    /// Seconds since the Unix epoch.
    pub sec: i64,
    /// Nanosecond remainder.
    pub nsec: u32,
}

impl Timespec {
    /// The current wall-clock time.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(_) => Self { sec: 0, nsec: 0 },
        }
    }
}

/// Per-object metadata header, encrypted and authenticated at the front of
/// the object's meta file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// POSIX permission bits plus type nibble.
    pub mode: u32,
    /// Link count; zero marks the object for deletion at last close.
    pub nlink: u32,
    /// Logical payload length in bytes.
    pub size: u64,
    /// Last access time.
    pub atime: Timespec,
    /// Last content modification time.
    pub mtime: Timespec,
    /// Last header change time.
    pub ctime: Timespec,
    /// Creation time.
    pub birthtime: Timespec,
}

/// Serialized (plaintext) size of [`FileHeader`]; the encrypted record in
/// the meta file is this plus nonce and tag.
pub const HEADER_PLAIN_LEN: usize = 72;

impl FileHeader {
    /// Fresh header for a newly created object: type-bit-only mode,
    /// `nlink = 0`, all timestamps now.
    pub fn new(kind: FileKind, uid: u32, gid: u32) -> Self {
        let now = Timespec::now();
        Self {
            uid,
            gid,
            mode: kind.mode_bits(),
            nlink: 0,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            birthtime: now,
        }
    }

    /// The flavor recorded in the mode's type nibble.
    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }
}

/// Attributes reported by `getattr`.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub kind: FileKind,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub birthtime: Timespec,
}

/// One entry yielded by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Plaintext entry name.
    pub name: String,
    /// Referenced object id.
    pub id: FileId,
    /// Flavor of the referenced object.
    pub kind: FileKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_distinct() {
        assert_ne!(FileId::random(), FileId::random());
    }

    #[test]
    fn test_hex_is_lowercase_and_64_chars() {
        let id = FileId::from_bytes([0xAB; 32]);
        let hex = id.to_hex();

        assert_eq!(hex.len(), 64);
        assert_eq!(hex, hex.to_lowercase());
        assert!(hex.starts_with("abab"));
    }

    #[test]
    fn test_kind_mode_roundtrip() {
        for kind in [FileKind::Regular, FileKind::Directory, FileKind::Symlink] {
            assert_eq!(FileKind::from_mode(kind.mode_bits() | 0o644), Some(kind));
        }
        assert_eq!(FileKind::from_mode(0o644), None);
    }

    #[test]
    fn test_new_header_defaults() {
        let h = FileHeader::new(FileKind::Directory, 1000, 100);

        assert_eq!(h.kind(), Some(FileKind::Directory));
        assert_eq!(h.mode & !mode::IFMT, 0);
        assert_eq!(h.nlink, 0);
        assert_eq!(h.size, 0);
        assert_eq!(h.uid, 1000);
        assert_eq!(h.gid, 100);
    }

    #[test]
    fn test_header_serialized_size_is_stable() {
        let h = FileHeader::new(FileKind::Regular, 0, 0);
        let bytes = bincode::serialize(&h).unwrap();

        assert_eq!(bytes.len(), HEADER_PLAIN_LEN);
    }

    #[test]
    fn test_header_bincode_roundtrip() {
        let h = FileHeader::new(FileKind::Symlink, 5, 6);
        let bytes = bincode::serialize(&h).unwrap();
        let back: FileHeader = bincode::deserialize(&bytes).unwrap();

        assert_eq!(back.uid, 5);
        assert_eq!(back.kind(), Some(FileKind::Symlink));
    }
}
