//! Key Derivation Functions
//!
//! Provides HKDF-SHA256 for deriving directional keys from the ECDH output

use super::{CryptoError, PublicKey, SharedSecret, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        let prk = salt.extract(ikm);

        Self { prk }
    }

    /// Derive a key from the PRK into `output`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyGeneration("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyGeneration("HKDF fill failed".to_string()))?;

        Ok(())
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// One symmetric key per direction of the control channel
pub struct SessionKeys {
    pub client_to_server: [u8; KEY_LEN],
    pub server_to_client: [u8; KEY_LEN],
}

/// Derive the session keys from the ECDH output. The salt is the client
/// public key followed by the server public key.
pub fn derive_session_keys(
    shared: &SharedSecret,
    client_public: &PublicKey,
    server_public: &PublicKey,
) -> Result<SessionKeys, CryptoError> {
    let mut salt = Vec::with_capacity(2 * KEY_LEN);
    salt.extend_from_slice(client_public.as_bytes());
    salt.extend_from_slice(server_public.as_bytes());

    let hkdf = Hkdf::new(Some(&salt), shared.as_bytes());

    Ok(SessionKeys {
        client_to_server: hkdf.expand_key(b"conduit client to server")?,
        server_to_client: hkdf.expand_key(b"conduit server to client")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EphemeralKeyPair;

    #[test]
    fn test_hkdf_basic() {
        let ikm = b"input keying material";
        let hkdf = Hkdf::new(Some(b"salt"), ikm);

        let key1 = hkdf.expand_key(b"label1").unwrap();
        let key2 = hkdf.expand_key(b"label2").unwrap();

        // Different labels should produce different keys
        assert_ne!(key1, key2);

        // Same label should produce same key
        let key1_again = hkdf.expand_key(b"label1").unwrap();
        assert_eq!(key1, key1_again);
    }

    #[test]
    fn test_session_key_derivation() {
        let client = EphemeralKeyPair::generate().unwrap();
        let server = EphemeralKeyPair::generate().unwrap();
        let client_pub = client.public().clone();
        let server_pub = server.public().clone();

        let client_shared = client.agree(&server_pub).unwrap();
        let server_shared = server.agree(&client_pub).unwrap();

        let on_client = derive_session_keys(&client_shared, &client_pub, &server_pub).unwrap();
        let on_server = derive_session_keys(&server_shared, &client_pub, &server_pub).unwrap();

        assert_eq!(on_client.client_to_server, on_server.client_to_server);
        assert_eq!(on_client.server_to_client, on_server.server_to_client);
        assert_ne!(on_client.client_to_server, on_client.server_to_client);
    }
}
