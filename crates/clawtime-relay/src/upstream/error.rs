//! Upstream relay error types.

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upstream relay closed")]
    Closed,
}
