//! The repository metadata file.
//!
//! A hidden JSON file at the repository root carries the little that must
//! be readable before any decryption: format version, block size, and the
//! Argon2 salt. Everything secret — the master key for per-object subkeys,
//! the filename key, and the root directory id — lives in a sealed blob
//! encrypted under the password-derived key-encryption key.
//!
//! Changing the password re-seals the blob under a fresh salt and KEK;
//! object data is never touched.

use crate::config::{FORMAT_VERSION, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::crypto::{BlockCipher, PasswordKdf};
use crate::error::{Error, Result};
use crate::config::RepoConfig;
use crate::fs::types::FileId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Repository metadata file name (hidden, skipped by the layout walker).
pub const REPO_FILE_NAME: &str = ".veilfs.json";

/// Associated data binding the sealed blob to its purpose.
const SEAL_AAD: &[u8] = b"veilfs.superblock.v1";

#[derive(Serialize, Deserialize)]
struct RepoFile {
    version: u32,
    block_size: u32,
    /// Argon2 salt, hex.
    salt: String,
    /// nonce || ciphertext || tag of the sealed secrets, hex.
    sealed: String,
}

#[derive(Serialize, Deserialize)]
struct Secrets {
    master_key: [u8; KEY_SIZE],
    name_key: [u8; KEY_SIZE],
    root_id: FileId,
}

/// Decrypted repository metadata.
pub struct Superblock {
    /// Plaintext block size for every object stream.
    pub block_size: u32,
    /// Master key from which per-object payload keys are derived.
    pub master_key: [u8; KEY_SIZE],
    /// Repository-wide filename encryption key.
    pub name_key: [u8; KEY_SIZE],
    /// Id of the root directory, fixed at repository creation.
    pub root_id: FileId,
    salt: [u8; 32],
    path: PathBuf,
}

impl Superblock {
    fn file_path(dir: &Path) -> PathBuf {
        dir.join(REPO_FILE_NAME)
    }

    /// Initialize a new repository: random keys and root id, sealed under
    /// the password.
    pub fn create(dir: &Path, password: &str, config: &RepoConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidPath)?;

        let path = Self::file_path(dir);
        if path.exists() {
            return Err(Error::AlreadyInitialized(dir.to_path_buf()));
        }
        std::fs::create_dir_all(dir)?;

        let mut master_key = [0u8; KEY_SIZE];
        let mut name_key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut master_key);
        rand::thread_rng().fill_bytes(&mut name_key);

        let mut sb = Self {
            block_size: config.block_size,
            master_key,
            name_key,
            root_id: FileId::random(),
            salt: [0u8; 32],
            path,
        };
        sb.reseal(password)?;
        Ok(sb)
    }

    /// Load and unseal an existing repository's metadata.
    pub fn load(dir: &Path, password: &str) -> Result<Self> {
        let path = Self::file_path(dir);
        let raw = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotInitialized(dir.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let file: RepoFile = serde_json::from_str(&raw)?;

        if file.version != FORMAT_VERSION {
            return Err(Error::VersionMismatch {
                expected: FORMAT_VERSION,
                found: file.version,
            });
        }

        let salt: [u8; 32] = decode_hex(&file.salt, "salt")?;
        let sealed = hex::decode(&file.sealed)
            .map_err(|_| Error::Corrupted("non-hex sealed blob".to_string()))?;
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Corrupted("sealed blob too short".to_string()));
        }

        let kek = PasswordKdf::from_salt(salt).derive_key(password)?;
        let nonce: [u8; NONCE_SIZE] = sealed[..NONCE_SIZE].try_into().unwrap();
        let tag: [u8; TAG_SIZE] = sealed[sealed.len() - TAG_SIZE..].try_into().unwrap();
        let ct = &sealed[NONCE_SIZE..sealed.len() - TAG_SIZE];

        let plain = BlockCipher::new(kek).open(&nonce, SEAL_AAD, ct, &tag)?;
        let secrets: Secrets = bincode::deserialize(&plain)
            .map_err(|_| Error::Corrupted("malformed sealed secrets".to_string()))?;

        Ok(Self {
            block_size: file.block_size,
            master_key: secrets.master_key,
            name_key: secrets.name_key,
            root_id: secrets.root_id,
            salt,
            path,
        })
    }

    /// Re-seal the secrets under `password` with a fresh salt, and write
    /// the metadata file.
    fn reseal(&mut self, password: &str) -> Result<()> {
        let kdf = PasswordKdf::new();
        let kek = kdf.derive_key(password)?;
        self.salt = *kdf.salt();

        let secrets = Secrets {
            master_key: self.master_key,
            name_key: self.name_key,
            root_id: self.root_id,
        };
        let plain = bincode::serialize(&secrets)?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let (ct, tag) = BlockCipher::new(kek).seal(&nonce, SEAL_AAD, &plain)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ct.len() + TAG_SIZE);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ct);
        sealed.extend_from_slice(&tag);

        let file = RepoFile {
            version: FORMAT_VERSION,
            block_size: self.block_size,
            salt: hex::encode(self.salt),
            sealed: hex::encode(sealed),
        };

        // Atomic update: this file holds the only copy of the keys, so it
        // is written to a temporary sibling and renamed into place.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Change the repository password. The caller has already proven
    /// knowledge of the old password by loading this superblock.
    pub fn change_password(&mut self, new_password: &str) -> Result<()> {
        self.reseal(new_password)
    }
}

fn decode_hex<const N: usize>(s: &str, what: &str) -> Result<[u8; N]> {
    let bytes =
        hex::decode(s).map_err(|_| Error::Corrupted(format!("non-hex {} field", what)))?;
    bytes
        .try_into()
        .map_err(|_| Error::Corrupted(format!("wrong {} length", what)))
}
