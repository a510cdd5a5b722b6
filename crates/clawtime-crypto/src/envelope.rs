//! Wire envelope for encrypted frames.

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::session::CryptoSession;

/// `{encrypted: true, iv, tag, data}` with every binary field base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub encrypted: bool,
    pub iv: String,
    /// Absent when the sender appended the tag to `data` (WebCrypto layout).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub data: String,
}

impl Envelope {
    /// Parse a raw frame as an envelope, if it is one.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str::<Self>(raw)
            .ok()
            .filter(|envelope| envelope.encrypted)
    }

    pub fn to_json(&self) -> Result<String, CryptoError> {
        serde_json::to_string(self).map_err(|e| CryptoError::SerializationError(e.to_string()))
    }
}

/// Why an inbound frame could not be opened.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("encrypted frame rejected: {0}")]
    Rejected(#[source] CryptoError),

    #[error("plaintext frame received after encryption was established")]
    NotEncrypted,
}

/// An inbound frame after envelope handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedFrame {
    pub text: String,
    /// Whether `text` came out of a successfully decrypted envelope.
    pub decrypted: bool,
}

impl OpenedFrame {
    fn plain(raw: &str) -> Self {
        Self {
            text: raw.to_string(),
            decrypted: false,
        }
    }
}

/// Turn an inbound raw frame into its plaintext JSON.
///
/// Until encryption is established (`strict == false`) anything that fails to
/// decrypt is passed through as plaintext, which tolerates frames that cross
/// the handshake in flight. Once established, frames must be valid envelopes.
pub fn open_frame(
    session: Option<&CryptoSession>,
    raw: &str,
    strict: bool,
) -> Result<OpenedFrame, FrameError> {
    let envelope = match Envelope::parse(raw) {
        Some(envelope) => envelope,
        None if strict => return Err(FrameError::NotEncrypted),
        None => return Ok(OpenedFrame::plain(raw)),
    };
    let Some(session) = session else {
        return if strict {
            Err(FrameError::NotEncrypted)
        } else {
            Ok(OpenedFrame::plain(raw))
        };
    };
    match session.decrypt(&envelope) {
        Ok(text) => Ok(OpenedFrame {
            text,
            decrypted: true,
        }),
        Err(e) if strict => Err(FrameError::Rejected(e)),
        Err(_) => Ok(OpenedFrame::plain(raw)),
    }
}
