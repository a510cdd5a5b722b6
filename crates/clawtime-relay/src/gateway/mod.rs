//! Client-facing WebSocket gateway.
//!
//! One [`connection::Connection`] per socket: origin check on upgrade, session
//! authentication, the E2E key exchange, and the bridge between the client and
//! its upstream agent relay.

pub mod connection;
pub mod handler;
pub mod origin;
pub mod server;
pub mod sink;

use clawtime_crypto::{CryptoError, FrameError};

use crate::auth::AuthError;
use crate::upstream::UpstreamError;
use sink::SinkError;

pub use connection::Connection;
pub use server::{AppState, router};
pub use sink::{ClientSink, Outbound};

/// No pong within the grace period after a ping.
pub const CLOSE_STALE: u16 = 4000;
pub const CLOSE_AUTH_FAILED: u16 = 4001;
pub const CLOSE_ORIGIN: u16 = 4003;
pub const CLOSE_RATE_LIMITED: u16 = 4029;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] CryptoError),

    #[error("no key exchange in progress")]
    NoKeyExchange,

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("agent relay unavailable: {0}")]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}
