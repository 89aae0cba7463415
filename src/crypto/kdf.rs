//! Key derivation: Argon2id for passwords, HMAC-SHA256 for object subkeys.

use crate::config::{argon2_params, KEY_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    /// Iteration count.
    pub time_cost: u32,
    /// Number of lanes.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost: argon2_params::MEMORY_COST,
            time_cost: argon2_params::TIME_COST,
            parallelism: argon2_params::PARALLELISM,
        }
    }
}

/// Fill `out` with Argon2id output for `secret` and `salt` under the
/// given cost parameters. The output length is taken from the buffer.
fn argon2_fill(secret: &[u8], salt: &[u8], params: &KdfParams, out: &mut [u8]) -> Result<()> {
    let params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(out.len()),
    )
    .map_err(|e| Error::KeyDerivation(e.to_string()))?;

    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(secret, salt, out)
        .map_err(|e| Error::KeyDerivation(e.to_string()))
}

/// Password-based derivation of the key-encryption key.
///
/// Carries the salt (stored in the repository metadata file so the same
/// key can be re-derived at mount time) and the cost parameters, which
/// default to the repository constants.
#[derive(Debug, Clone)]
pub struct PasswordKdf {
    salt: [u8; argon2_params::SALT_LENGTH],
    params: KdfParams,
}

impl PasswordKdf {
    /// Create a KDF with a fresh random salt.
    pub fn new() -> Self {
        let mut salt = [0u8; argon2_params::SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_params(salt, KdfParams::default())
    }

    /// Create a KDF from a stored salt (for mounting).
    pub fn from_salt(salt: [u8; argon2_params::SALT_LENGTH]) -> Self {
        Self::with_params(salt, KdfParams::default())
    }

    /// Create a KDF with explicit cost parameters.
    pub fn with_params(salt: [u8; argon2_params::SALT_LENGTH], params: KdfParams) -> Self {
        Self { salt, params }
    }

    /// Get the salt for storage.
    pub fn salt(&self) -> &[u8; argon2_params::SALT_LENGTH] {
        &self.salt
    }

    /// Derive the 256-bit key-encryption key from a password.
    pub fn derive_key(&self, password: &str) -> Result<[u8; KEY_SIZE]> {
        let mut key = [0u8; KEY_SIZE];
        argon2_fill(password.as_bytes(), &self.salt, &self.params, &mut key)?;
        Ok(key)
    }
}

impl Default for PasswordKdf {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive an object's payload key from the repository master key and the
/// object id: `HMAC-SHA256(master_key, id)`.
pub fn derive_file_key(master_key: &[u8; KEY_SIZE], object_id: &[u8]) -> [u8; KEY_SIZE] {
    let mut mac =
        HmacSha256::new_from_slice(master_key).expect("HMAC accepts any key length");
    mac.update(object_id);
    mac.finalize().into_bytes().into()
}
