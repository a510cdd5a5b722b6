//! Crypto session for E2E encryption.
//!
//! Holds the AES-256-GCM cipher derived from a P-256 ECDH shared secret via
//! HKDF-SHA256. Both ends run the same derivation with the same protocol
//! constants, so the key itself never crosses the wire.

use aes_gcm::aead::{Aead, AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::envelope::Envelope;
use crate::error::CryptoError;

/// HKDF salt shared with the browser client.
const HKDF_SALT: &[u8] = b"clawtime-e2e-salt";

/// HKDF info string shared with the browser client.
const HKDF_INFO: &[u8] = b"clawtime-e2e-key";

/// Derived key size (AES-256).
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for AES-GCM.
pub const TAG_SIZE: usize = 16;

/// A crypto session holding a derived symmetric key.
pub struct CryptoSession {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession").finish_non_exhaustive()
    }
}

/// Derive a 32-byte key from a shared secret via HKDF-SHA256.
///
/// The caller is responsible for zeroizing the returned bytes.
fn hkdf_derive(shared_secret: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
    let mut key = [0u8; KEY_SIZE];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(key)
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64.decode(value).map_err(|e| CryptoError::Encoding {
        field,
        message: e.to_string(),
    })
}

impl CryptoSession {
    /// Create a session from a raw ECDH shared secret.
    pub fn from_shared_secret(shared_secret: &[u8]) -> Result<Self, CryptoError> {
        let mut key_bytes = hkdf_derive(shared_secret)?;
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()));
        key_bytes.zeroize();
        Ok(Self { cipher: cipher? })
    }

    /// Encrypt a UTF-8 payload into a wire envelope with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<Envelope, CryptoError> {
        let mut iv = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(Envelope {
            encrypted: true,
            iv: BASE64.encode(iv),
            tag: Some(BASE64.encode(tag)),
            data: BASE64.encode(&buffer),
        })
    }

    /// Decrypt an envelope back to its UTF-8 payload.
    ///
    /// Accepts both the detached layout (`tag` field present) and the
    /// WebCrypto layout where `data` is `ciphertext || tag` and `tag` is absent.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<String, CryptoError> {
        let iv = decode_field("iv", &envelope.iv)?;
        if iv.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: iv.len(),
            });
        }
        let nonce = Nonce::from_slice(&iv);
        let mut data = decode_field("data", &envelope.data)?;

        let plaintext = match &envelope.tag {
            Some(tag) => {
                let tag = decode_field("tag", tag)?;
                if tag.len() != TAG_SIZE {
                    return Err(CryptoError::InvalidTagLength {
                        expected: TAG_SIZE,
                        actual: tag.len(),
                    });
                }
                self.cipher
                    .decrypt_in_place_detached(nonce, b"", &mut data, Tag::from_slice(&tag))
                    .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
                data
            }
            None => self
                .cipher
                .decrypt(nonce, data.as_slice())
                .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?,
        };

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("payload is not UTF-8: {e}")))
    }

    /// Encrypt into the WebCrypto layout (`ciphertext || tag`, no `tag` field).
    pub fn encrypt_combined(&self, plaintext: &str) -> Result<Envelope, CryptoError> {
        let mut iv = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut iv);
        let data = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        Ok(Envelope {
            encrypted: true,
            iv: BASE64.encode(iv),
            tag: None,
            data: BASE64.encode(data),
        })
    }
}

/// Create a matched pair of `CryptoSession`s for testing.
///
/// Returns (`client_session`, `server_session`).
#[cfg(any(test, feature = "test-utils"))]
pub fn test_session_pair() -> Result<(CryptoSession, CryptoSession), CryptoError> {
    crate::exchange::perform_key_exchange()
}
