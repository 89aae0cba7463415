//! Cryptographic operations for the encrypted filesystem.
//!
//! This module provides:
//! - AES-256-GCM authenticated encryption for blocks and sealed metadata
//! - Deterministic authenticated encryption for directory entry names
//! - Argon2id password-based key derivation
//! - HMAC-SHA256 per-object subkey derivation

mod cipher;
mod kdf;

pub use cipher::{BlockCipher, NameCipher};
pub use kdf::{derive_file_key, KdfParams, PasswordKdf};
