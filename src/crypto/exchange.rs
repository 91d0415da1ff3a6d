//! Ephemeral key exchange for the control channel
//!
//! Each side sends its X25519 public key in a CRYPTO_EXCHANGE frame. Once
//! the peer's key arrives, both sides run the same agreement and derive a
//! sealing key for what they send and an opening key for what they receive.

use super::{derive_session_keys, Cipher, CryptoError, EphemeralKeyPair, PublicKey};

/// Role in the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Initiator (client)
    Initiator,
    /// Responder (server)
    Responder,
}

/// Ciphers for both directions of an established session
pub struct SessionCiphers {
    /// Encrypts frames we send
    pub sealer: Cipher,
    /// Decrypts frames we receive
    pub opener: Cipher,
}

/// Pending key exchange, waiting for the peer's public key
pub struct KeyExchange {
    keypair: EphemeralKeyPair,
    role: HandshakeRole,
}

impl KeyExchange {
    /// Generate a fresh ephemeral key pair for `role`
    pub fn new(role: HandshakeRole) -> Result<Self, CryptoError> {
        Ok(Self {
            keypair: EphemeralKeyPair::generate()?,
            role,
        })
    }

    /// Public key to send in our CRYPTO_EXCHANGE frame
    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public()
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Finish the exchange with the raw public key received from the peer
    pub fn complete(self, peer_public: &[u8]) -> Result<SessionCiphers, CryptoError> {
        let peer = PublicKey::from_bytes(peer_public)?;
        let ours = self.keypair.public().clone();
        let role = self.role;

        let shared = self.keypair.agree(&peer)?;

        let (client_public, server_public) = match role {
            HandshakeRole::Initiator => (&ours, &peer),
            HandshakeRole::Responder => (&peer, &ours),
        };
        let keys = derive_session_keys(&shared, client_public, server_public)?;

        let (seal_key, open_key) = match role {
            HandshakeRole::Initiator => (keys.client_to_server, keys.server_to_client),
            HandshakeRole::Responder => (keys.server_to_client, keys.client_to_server),
        };

        Ok(SessionCiphers {
            sealer: Cipher::new(&seal_key)?,
            opener: Cipher::new(&open_key)?,
        })
    }
}
