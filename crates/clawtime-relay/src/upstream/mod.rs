//! Outbound relay to the agent gateway.
//!
//! One upstream WebSocket per authenticated client. [`RelayState`] holds the
//! protocol logic (handshake, buffering, acknowledgement tracking) and is
//! driven by the socket loop in [`client`].

pub mod client;
pub mod error;
pub mod protocol;
pub mod state;

pub use client::{UpstreamClient, UpstreamHandle};
pub use error::UpstreamError;
pub use protocol::{Attachment, ChatEvent, Frame};
pub use state::{ChatRequest, RelayState, Step, UpstreamEvent};
