//! Key exchange protocol logic.
//!
//! The relay generates an ephemeral P-256 keypair once the client has
//! authenticated and sends its public key in `auth-ok`. The client answers
//! with its own ephemeral public key in `key-exchange`; both sides run ECDH
//! and derive the same AES-256-GCM key via HKDF-SHA256.
//!
//! Public keys travel as base64 of the uncompressed SEC1 point, which is what
//! WebCrypto produces for `exportKey("raw", ...)` on an ECDH P-256 key.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use p256::PublicKey;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;

use crate::error::CryptoError;
use crate::session::CryptoSession;

/// State of a key exchange in progress.
pub struct KeyExchangeState {
    /// Our ephemeral secret for this connection.
    ephemeral_secret: EphemeralSecret,
    /// Our ephemeral public key to send to the peer.
    ephemeral_public: PublicKey,
}

impl Default for KeyExchangeState {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchangeState {
    /// Start a new key exchange by generating an ephemeral keypair.
    pub fn new() -> Self {
        let ephemeral_secret = EphemeralSecret::random(&mut OsRng);
        let ephemeral_public = ephemeral_secret.public_key();
        Self {
            ephemeral_secret,
            ephemeral_public,
        }
    }

    /// Uncompressed SEC1 bytes of our ephemeral public key (65 bytes).
    pub fn public_bytes(&self) -> Vec<u8> {
        self.ephemeral_public
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Base64 of our ephemeral public key, as sent on the wire.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_bytes())
    }

    /// Complete the key exchange with the peer's base64 public key.
    pub fn complete(self, peer_public_base64: &str) -> Result<CryptoSession, CryptoError> {
        let peer_bytes = BASE64
            .decode(peer_public_base64.trim())
            .map_err(|e| CryptoError::Encoding {
                field: "publicKey",
                message: e.to_string(),
            })?;
        self.complete_bytes(&peer_bytes)
    }

    /// Complete the key exchange with the peer's raw SEC1 public key bytes.
    pub fn complete_bytes(self, peer_public_bytes: &[u8]) -> Result<CryptoSession, CryptoError> {
        let peer_public = PublicKey::from_sec1_bytes(peer_public_bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let shared = self.ephemeral_secret.diffie_hellman(&peer_public);
        CryptoSession::from_shared_secret(shared.raw_secret_bytes().as_slice())
    }
}

/// Perform a complete key exchange and return matching sessions for both sides.
///
/// In production each side creates a `KeyExchangeState`, sends its public key,
/// and calls `complete()` with the peer's key.
#[cfg(any(test, feature = "test-utils"))]
pub fn perform_key_exchange() -> Result<(CryptoSession, CryptoSession), CryptoError> {
    let client_state = KeyExchangeState::new();
    let server_state = KeyExchangeState::new();

    let client_pub = client_state.public_key_base64();
    let server_pub = server_state.public_key_base64();

    let client_session = client_state.complete(&server_pub)?;
    let server_session = server_state.complete(&client_pub)?;

    Ok((client_session, server_session))
}
