//! Configuration constants and types for the repository format.

use serde::{Deserialize, Serialize};

/// Size of an object identifier in bytes.
pub const ID_SIZE: usize = 32;

/// Size of a symmetric key in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (96 bits).
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

/// Default plaintext block size (4 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest accepted block size.
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Magic number at the start of every object meta file: "VOBJ".
pub const OBJECT_MAGIC: [u8; 4] = [0x56, 0x4F, 0x42, 0x4A];

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Argon2id parameters for deriving the key-encryption key from a password.
pub mod argon2_params {
    /// Memory cost in KiB (64 MB).
    pub const MEMORY_COST: u32 = 65536;

    /// Time cost (iterations).
    pub const TIME_COST: u32 = 3;

    /// Parallelism factor.
    pub const PARALLELISM: u32 = 4;

    /// Salt length in bytes.
    pub const SALT_LENGTH: usize = 32;
}

/// Creation-time options for a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Plaintext bytes per encrypted block.
    pub block_size: u32,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl RepoConfig {
    /// Create a configuration with a custom block size.
    pub fn new(block_size: u32) -> Self {
        Self { block_size }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.block_size.is_power_of_two() {
            return Err("Block size must be a power of 2".to_string());
        }
        if self.block_size < MIN_BLOCK_SIZE || self.block_size > MAX_BLOCK_SIZE {
            return Err(format!(
                "Block size must be between {} and {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            ));
        }
        Ok(())
    }
}
