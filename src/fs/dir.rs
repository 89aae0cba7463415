//! The on-disk directory index.
//!
//! A directory's payload stream holds a bincode-encoded list of records,
//! each pairing an encrypted name with the referenced object id and flavor.
//! Names are encrypted with the deterministic [`NameCipher`], so a lookup
//! encrypts the probe name and compares ciphertext; no plaintext ever
//! reaches the index. Records are kept sorted by name ciphertext, which
//! makes the encoding canonical and lets lookups binary-search.
//!
//! Mutations rewrite the whole stream. The `.` and `..` entries are never
//! stored; the readdir adapter synthesizes them.

use crate::crypto::NameCipher;
use crate::error::{Error, Result};
use crate::fs::stream::BlockStream;
use crate::fs::types::{FileId, FileKind};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct DirRecord {
    name_ct: Vec<u8>,
    id: FileId,
    kind: FileKind,
}

/// A view over a directory's stream, borrowed for the duration of one
/// index operation.
pub struct DirIndex<'a> {
    stream: &'a mut BlockStream,
    names: &'a NameCipher,
}

impl<'a> DirIndex<'a> {
    pub fn new(stream: &'a mut BlockStream, names: &'a NameCipher) -> Self {
        Self { stream, names }
    }

    fn load(&mut self) -> Result<Vec<DirRecord>> {
        let len = self.stream.len() as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut bytes = vec![0u8; len];
        let read = self.stream.read(0, &mut bytes)?;
        if read != len {
            return Err(Error::Corrupted(
                "directory index shorter than recorded size".to_string(),
            ));
        }
        bincode::deserialize(&bytes)
            .map_err(|_| Error::Corrupted("malformed directory index".to_string()))
    }

    fn store(&mut self, records: &[DirRecord]) -> Result<()> {
        let bytes = bincode::serialize(&records)?;
        self.stream.write(0, &bytes)?;
        self.stream.resize(bytes.len() as u64)?;
        Ok(())
    }

    fn find(records: &[DirRecord], probe: &[u8]) -> std::result::Result<usize, usize> {
        records.binary_search_by(|r| r.name_ct.as_slice().cmp(probe))
    }

    /// Look up `name`. Returns the referenced (id, kind) if present.
    pub fn get_entry(&mut self, name: &str) -> Result<Option<(FileId, FileKind)>> {
        let probe = self.names.seal_name(name)?;
        let records = self.load()?;
        Ok(Self::find(&records, &probe)
            .ok()
            .map(|i| (records[i].id, records[i].kind)))
    }

    /// Add an entry. Returns `false` without changing anything if `name`
    /// already exists.
    pub fn add_entry(&mut self, name: &str, id: FileId, kind: FileKind) -> Result<bool> {
        let probe = self.names.seal_name(name)?;
        let mut records = self.load()?;
        match Self::find(&records, &probe) {
            Ok(_) => Ok(false),
            Err(pos) => {
                records.insert(
                    pos,
                    DirRecord {
                        name_ct: probe,
                        id,
                        kind,
                    },
                );
                self.store(&records)?;
                Ok(true)
            }
        }
    }

    /// Remove an entry. Returns the removed (id, kind), or `None` if the
    /// name was not present.
    pub fn remove_entry(&mut self, name: &str) -> Result<Option<(FileId, FileKind)>> {
        let probe = self.names.seal_name(name)?;
        let mut records = self.load()?;
        match Self::find(&records, &probe) {
            Ok(pos) => {
                let removed = records.remove(pos);
                self.store(&records)?;
                Ok(Some((removed.id, removed.kind)))
            }
            Err(_) => Ok(None),
        }
    }

    /// Add `name → (id, kind)`, replacing any existing entry under that
    /// name. Returns what the entry previously referenced, if anything.
    pub fn replace_entry(
        &mut self,
        name: &str,
        id: FileId,
        kind: FileKind,
    ) -> Result<Option<(FileId, FileKind)>> {
        let probe = self.names.seal_name(name)?;
        let mut records = self.load()?;
        let replaced = match Self::find(&records, &probe) {
            Ok(pos) => {
                let old = (records[pos].id, records[pos].kind);
                records[pos].id = id;
                records[pos].kind = kind;
                Some(old)
            }
            Err(pos) => {
                records.insert(
                    pos,
                    DirRecord {
                        name_ct: probe,
                        id,
                        kind,
                    },
                );
                None
            }
        };
        self.store(&records)?;
        Ok(replaced)
    }

    /// Number of stored entries (excluding the synthesized `.` and `..`).
    pub fn entry_count(&mut self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    /// Visit every entry. The callback returns `false` to stop early.
    pub fn iterate_over_entries(
        &mut self,
        mut callback: impl FnMut(&str, FileId, FileKind) -> bool,
    ) -> Result<()> {
        let records = self.load()?;
        for record in &records {
            let name = self.names.open_name(&record.name_ct).map_err(|_| {
                Error::AuthFailed(format!("directory entry for object {}", record.id))
            })?;
            if !callback(&name, record.id, record.kind) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BlockCipher;
    use crate::fs::types::FileHeader;
    use crate::storage::DataDir;
    use tempfile::TempDir;

    fn make_dir_stream(tmp: &TempDir) -> (BlockStream, NameCipher) {
        let dir = DataDir::new(tmp.path());
        let id = FileId::from_bytes([0xDD; 32]);
        let files = dir.create_object(&id).unwrap();
        let header = FileHeader::new(FileKind::Directory, 0, 0);
        let stream =
            BlockStream::create(id, files, BlockCipher::new([1u8; 32]), 512, &header).unwrap();
        (stream, NameCipher::new([2u8; 32]))
    }

    #[test]
    fn test_add_then_get() {
        let tmp = TempDir::new().unwrap();
        let (mut stream, names) = make_dir_stream(&tmp);
        let mut index = DirIndex::new(&mut stream, &names);
        let id = FileId::from_bytes([1; 32]);

        assert!(index.add_entry("a.txt", id, FileKind::Regular).unwrap());
        assert_eq!(
            index.get_entry("a.txt").unwrap(),
            Some((id, FileKind::Regular))
        );
        assert_eq!(index.get_entry("missing").unwrap(), None);
    }

    #[test]
    fn test_duplicate_add_refused_without_change() {
        let tmp = TempDir::new().unwrap();
        let (mut stream, names) = make_dir_stream(&tmp);
        let mut index = DirIndex::new(&mut stream, &names);
        let first = FileId::from_bytes([1; 32]);
        let second = FileId::from_bytes([2; 32]);

        assert!(index.add_entry("x", first, FileKind::Regular).unwrap());
        assert!(!index.add_entry("x", second, FileKind::Directory).unwrap());

        assert_eq!(
            index.get_entry("x").unwrap(),
            Some((first, FileKind::Regular))
        );
        assert_eq!(index.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_remove_returns_entry() {
        let tmp = TempDir::new().unwrap();
        let (mut stream, names) = make_dir_stream(&tmp);
        let mut index = DirIndex::new(&mut stream, &names);
        let id = FileId::from_bytes([3; 32]);

        index.add_entry("victim", id, FileKind::Symlink).unwrap();

        assert_eq!(
            index.remove_entry("victim").unwrap(),
            Some((id, FileKind::Symlink))
        );
        assert_eq!(index.remove_entry("victim").unwrap(), None);
        assert_eq!(index.get_entry("victim").unwrap(), None);
    }

    #[test]
    fn test_iterate_yields_each_entry_once() {
        let tmp = TempDir::new().unwrap();
        let (mut stream, names) = make_dir_stream(&tmp);
        let mut index = DirIndex::new(&mut stream, &names);

        for (i, name) in ["alpha", "beta", "gamma"].iter().enumerate() {
            index
                .add_entry(name, FileId::from_bytes([i as u8; 32]), FileKind::Regular)
                .unwrap();
        }

        let mut seen = Vec::new();
        index
            .iterate_over_entries(|name, _, _| {
                seen.push(name.to_string());
                true
            })
            .unwrap();

        seen.sort();
        assert_eq!(seen, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_iterate_stops_early() {
        let tmp = TempDir::new().unwrap();
        let (mut stream, names) = make_dir_stream(&tmp);
        let mut index = DirIndex::new(&mut stream, &names);

        for i in 0..10u8 {
            index
                .add_entry(
                    &format!("entry{}", i),
                    FileId::from_bytes([i; 32]),
                    FileKind::Regular,
                )
                .unwrap();
        }

        let mut visited = 0;
        index
            .iterate_over_entries(|_, _, _| {
                visited += 1;
                visited < 3
            })
            .unwrap();

        assert_eq!(visited, 3);
    }

    #[test]
    fn test_replace_entry_reports_previous_target() {
        let tmp = TempDir::new().unwrap();
        let (mut stream, names) = make_dir_stream(&tmp);
        let mut index = DirIndex::new(&mut stream, &names);
        let old = FileId::from_bytes([4; 32]);
        let new = FileId::from_bytes([5; 32]);

        assert_eq!(
            index.replace_entry("f", old, FileKind::Regular).unwrap(),
            None
        );
        assert_eq!(
            index.replace_entry("f", new, FileKind::Regular).unwrap(),
            Some((old, FileKind::Regular))
        );
        assert_eq!(
            index.get_entry("f").unwrap(),
            Some((new, FileKind::Regular))
        );
    }

    #[test]
    fn test_index_shrinks_after_removal() {
        let tmp = TempDir::new().unwrap();
        let (mut stream, names) = make_dir_stream(&tmp);

        {
            let mut index = DirIndex::new(&mut stream, &names);
            index
                .add_entry(
                    "long-name-to-make-the-index-bigger",
                    FileId::from_bytes([6; 32]),
                    FileKind::Regular,
                )
                .unwrap();
        }
        let populated = stream.len();
        {
            let mut index = DirIndex::new(&mut stream, &names);
            index
                .remove_entry("long-name-to-make-the-index-bigger")
                .unwrap();
        }

        assert!(stream.len() < populated);
    }
}
