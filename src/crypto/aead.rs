//! AEAD encryption/decryption of frame payloads
//!
//! Sealed payload layout:
//! ```text
//! +----------------+-------------------+-------------+
//! | Nonce (12B)    | Ciphertext        | Tag (16B)   |
//! +----------------+-------------------+-------------+
//! ```
//! The nonce carries a monotonic counter; the receiving side refuses any
//! counter that does not move forward.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// ChaCha20-Poly1305 cipher for one direction of a session
pub struct Cipher {
    key: LessSafeKey,
    /// Counter for the next nonce we seal with
    nonce_counter: u64,
    /// Smallest counter we will still accept when opening
    next_expected: u64,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key = UnboundKey::new(&CHACHA20_POLY1305, key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            nonce_counter: 0,
            next_expected: 0,
        })
    }

    /// Encrypt `plaintext`, returning nonce, ciphertext and tag in one buffer
    pub fn encrypt(&mut self, associated_data: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;

        let mut buffer = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(&nonce);
        let mut body = plaintext.to_vec();

        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(associated_data),
                &mut body,
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        buffer.extend_from_slice(&body);
        Ok(buffer)
    }

    /// Decrypt a sealed payload, verifying the tag and nonce ordering
    pub fn decrypt(&mut self, associated_data: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption(format!(
                "sealed payload of {} bytes is too short",
                sealed.len()
            )));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[..NONCE_LEN]);
        let counter = nonce_counter_of(&nonce);
        if counter < self.next_expected {
            return Err(CryptoError::Replay(counter));
        }

        let mut buffer = sealed[NONCE_LEN..].to_vec();
        let plaintext_len = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(associated_data),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?
            .len();

        buffer.truncate(plaintext_len);
        self.next_expected = counter.saturating_add(1);
        Ok(buffer)
    }

    /// Generate the next nonce (monotonic counter)
    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], CryptoError> {
        if self.nonce_counter == u64::MAX {
            return Err(CryptoError::Encryption("nonce space exhausted".to_string()));
        }
        let mut nonce = [0u8; NONCE_LEN];
        // Use counter in little-endian in the last 8 bytes
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        Ok(nonce)
    }

    /// Get current nonce counter value
    pub fn nonce_counter(&self) -> u64 {
        self.nonce_counter
    }
}

fn nonce_counter_of(nonce: &[u8; NONCE_LEN]) -> u64 {
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&nonce[4..12]);
    u64::from_le_bytes(counter)
}
