//! Outbound half of a client connection.
//!
//! Everything that talks to a client (the frame handler, the upstream relay,
//! the speech queue) holds a cloned [`ClientSink`]. Frames are serialized and,
//! once the key exchange has completed, encrypted at enqueue time, so the
//! order of the channel is the order the client decrypts in.

use std::sync::{Arc, PoisonError, RwLock};

use clawtime_crypto::{CryptoError, CryptoSession};
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;

/// What the socket writer task should put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("client connection closed")]
    Closed,

    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to encrypt frame: {0}")]
    Encrypt(#[from] CryptoError),
}

#[derive(Clone)]
pub struct ClientSink {
    tx: mpsc::Sender<Outbound>,
    crypto: Arc<RwLock<Option<Arc<CryptoSession>>>>,
}

impl ClientSink {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            tx,
            crypto: Arc::new(RwLock::new(None)),
        }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Encrypt every later [`send`](Self::send) with `session`.
    pub fn enable_encryption(&self, session: Arc<CryptoSession>) {
        *self.crypto.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    pub fn crypto(&self) -> Option<Arc<CryptoSession>> {
        self.crypto
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send a frame, encrypted when a session key is established.
    pub async fn send(&self, message: &ServerMessage) -> Result<(), SinkError> {
        let json = serde_json::to_string(message)?;
        let frame = match self.crypto() {
            Some(session) => session.encrypt(&json)?.to_json()?,
            None => json,
        };
        self.push(Outbound::Text(frame)).await
    }

    /// Send a frame in the clear regardless of encryption state.
    pub async fn send_plain(&self, message: &ServerMessage) -> Result<(), SinkError> {
        let json = serde_json::to_string(message)?;
        self.push(Outbound::Text(json)).await
    }

    pub async fn ping(&self) -> Result<(), SinkError> {
        self.push(Outbound::Ping).await
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<(), SinkError> {
        self.push(Outbound::Close {
            code,
            reason: reason.to_string(),
        })
        .await
    }

    async fn push(&self, outbound: Outbound) -> Result<(), SinkError> {
        self.tx.send(outbound).await.map_err(|_| SinkError::Closed)
    }
}
