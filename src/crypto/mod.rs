//! Cryptographic primitives for the control channel
//!
//! This module provides:
//! - Ephemeral X25519 key agreement
//! - HKDF-SHA256 derivation of one key per direction
//! - ChaCha20-Poly1305 AEAD for frame payloads
//! - Secure random number generation

mod aead;
mod exchange;
mod kdf;
mod keys;

pub use aead::Cipher;
pub use exchange::{HandshakeRole, KeyExchange, SessionCiphers};
pub use kdf::{derive_session_keys, Hkdf, SessionKeys};
pub use keys::{EphemeralKeyPair, PublicKey, SharedSecret};

use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of an X25519 public key in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key agreement failed")]
    KeyAgreement,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Replayed or reordered nonce {0}")]
    Replay(u64),

    #[error("Random number generation failed")]
    Random,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a cryptographically secure random 32-bit value
pub fn random_u32() -> Result<u32, CryptoError> {
    let mut buf = [0u8; 4];
    random_bytes(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}
