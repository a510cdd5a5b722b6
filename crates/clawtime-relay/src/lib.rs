//! `ClawTime` Relay Server Library
//!
//! Core functionality for the `ClawTime` relay:
//! - Client WebSocket gateway with session auth and E2E encryption
//! - Upstream agent relay client (challenge/connect/chat.send)
//! - Persistent runId tracking and streaming reply reassembly
//! - Sentence-level speech synthesis and transcription
//! - Server-side resource fetching for the browser client

pub mod auth;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod runs;
pub mod speech;
pub mod stream;
pub mod upstream;
