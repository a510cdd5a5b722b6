//! `ClawTime` Core Library
//!
//! Shared functionality for `ClawTime` components:
//! - Configuration resolution and hierarchy
//! - Typed content blocks for agent chat events
//! - Message history document (read/write contract)
//! - Common error types and tracing setup

pub mod config;
pub mod content;
pub mod error;
pub mod history;
pub mod tracing_init;

pub use config::Config;
pub use content::{ContentBlock, MessageContent};
pub use error::{Error, Result};
pub use history::{HistoryStore, Message, Role, now_millis};
