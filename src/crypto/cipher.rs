//! AES-256-GCM authenticated encryption.
//!
//! Two cipher wrappers live here. [`BlockCipher`] encrypts payload blocks
//! and sealed metadata records with caller-supplied nonces and associated
//! data, keeping the 16-byte tag detached so it can live in the meta file's
//! tag table. [`NameCipher`] encrypts directory entry names with a nonce
//! synthesized from the name itself, so equal names always produce equal
//! ciphertext and lookups can compare ciphertext directly.

use crate::config::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// AES-256-GCM with explicit nonce and associated data, detached tag.
pub struct BlockCipher {
    cipher: Aes256Gcm,
}

impl BlockCipher {
    /// Create a cipher from a derived key.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(&key).expect("Invalid key length");
        Self { cipher }
    }

    /// Encrypt `plaintext`, binding `aad` into the authentication tag.
    ///
    /// Returns the ciphertext (same length as the plaintext) and the
    /// detached 16-byte tag.
    pub fn seal(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; TAG_SIZE])> {
        let mut combined = self
            .cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let tag_off = combined.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&combined[tag_off..]);
        combined.truncate(tag_off);

        Ok((combined, tag))
    }

    /// Decrypt and authenticate a ciphertext/tag pair.
    pub fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8; TAG_SIZE],
    ) -> Result<Vec<u8>> {
        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: &combined,
                    aad,
                },
            )
            .map_err(|_| Error::Decryption)
    }
}

/// Deterministic authenticated encryption for directory entry names.
///
/// The nonce is the first 12 bytes of `HMAC-SHA256(nonce_key, name)`, so
/// encryption is a pure function of the name. Output layout is
/// `nonce || ciphertext || tag`, `name.len() + 28` bytes total.
pub struct NameCipher {
    cipher: Aes256Gcm,
    nonce_key: [u8; KEY_SIZE],
}

impl NameCipher {
    /// Create a name cipher from the repository name key.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(&key).expect("Invalid key length");
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&key).expect("HMAC accepts any key length");
        mac.update(b"name-nonce");
        let nonce_key: [u8; KEY_SIZE] = mac.finalize().into_bytes().into();
        Self { cipher, nonce_key }
    }

    fn synthesize_nonce(&self, name: &[u8]) -> [u8; NONCE_SIZE] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.nonce_key)
            .expect("HMAC accepts any key length");
        mac.update(name);
        let digest = mac.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        nonce
    }

    /// Encrypt a name. Equal inputs produce equal outputs.
    pub fn seal_name(&self, name: &str) -> Result<Vec<u8>> {
        let nonce = self.synthesize_nonce(name.as_bytes());
        let combined = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), name.as_bytes())
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + combined.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&combined);
        Ok(out)
    }

    /// Decrypt a name record produced by [`seal_name`](Self::seal_name).
    pub fn open_name(&self, record: &[u8]) -> Result<String> {
        if record.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Decryption);
        }
        let (nonce, combined) = record.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), combined)
            .map_err(|_| Error::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| Error::Decryption)
    }
}
