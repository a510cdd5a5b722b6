//! `ClawTime` terminal client.
//!
//! Connects to the relay, authenticates with a session token, switches to an
//! encrypted channel, and keeps that channel alive across network drops and
//! suspended processes.

pub mod reconnect;
pub mod runner;

pub use reconnect::{ReconnectController, ReconnectPolicy, Status};
pub use runner::{ClientEvent, ClientRunner, ConnectionError, RunnerConfig};
