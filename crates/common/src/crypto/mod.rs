//! Cryptographic primitives for the bunker vault
//!
//! This module provides the at-rest encryption used for stored signing keys:
//!
//! - **Key derivation**: PBKDF2-HMAC-SHA256 over the admin passphrase
//! - **Encryption**: AES-256-CBC with a per-secret random salt and IV
//!
//! # On-disk layout
//!
//! The layout is fixed and shared with vault files written by earlier
//! deployments, so it must never change:
//!
//! ```text
//! iv   = hex(iv_bytes[16])
//! data = hex(salt[16] || aes256cbc(plaintext))
//! ```
//!
//! The derived key is 32 bytes, produced with 100 000 PBKDF2 iterations.
//! A wrong passphrase surfaces as [`VaultCryptoError::DecryptionFailed`]
//! (CBC padding check), while malformed hex in either field surfaces as
//! [`VaultCryptoError::CorruptEntry`].

mod vault;

pub use vault::{decrypt_secret, encrypt_secret, EncryptedSecret, VaultCryptoError};
