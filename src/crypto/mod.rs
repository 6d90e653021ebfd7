//! Cryptographic primitives for the vault.
//!
//! Provides key derivation, authenticated encryption and the password
//! verification token.

pub mod aead;
pub mod kdf;
pub mod token;

pub use aead::{EncryptedBlob, decrypt, encrypt};
pub use kdf::{KdfParams, SessionKey, derive_key, derive_key_blocking};

/// Length of the salt (16 bytes).
pub const SALT_LEN: usize = 16;
/// Length of the nonce (12 bytes / 96 bits for ChaCha20-Poly1305).
pub const NONCE_LEN: usize = 12;
/// Length of the encryption key (32 bytes / 256 bits).
pub const KEY_LEN: usize = 32;
