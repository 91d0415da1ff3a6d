//! Ephemeral key material for the control-channel key exchange

use super::{CryptoError, KEY_LEN, PUBLIC_KEY_LEN};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use std::fmt;

/// X25519 public key as sent in CRYPTO_EXCHANGE
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        let mut arr = [0u8; PUBLIC_KEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Single-use X25519 key pair
pub struct EphemeralKeyPair {
    private: EphemeralPrivateKey,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| CryptoError::KeyGeneration("X25519 generation failed".to_string()))?;
        let public = private
            .compute_public_key()
            .map_err(|_| CryptoError::KeyGeneration("public key derivation failed".to_string()))?;

        Ok(Self {
            public: PublicKey::from_bytes(public.as_ref())?,
            private,
        })
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Consume the private key and agree on a shared secret with `peer`
    pub fn agree(self, peer: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let peer = UnparsedPublicKey::new(&X25519, peer.as_bytes());
        agreement::agree_ephemeral(self.private, &peer, |material| {
            let mut secret = [0u8; KEY_LEN];
            secret.copy_from_slice(material);
            SharedSecret(secret)
        })
        .map_err(|_| CryptoError::KeyAgreement)
    }
}

/// Raw ECDH output; only ever fed into HKDF
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

// Zeroize the secret on drop
impl Drop for SharedSecret {
    fn drop(&mut self) {
        for byte in &mut self.0 {
            unsafe {
                std::ptr::write_volatile(byte, 0);
            }
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}
