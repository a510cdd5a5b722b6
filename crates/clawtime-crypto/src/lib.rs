//! `ClawTime` E2E Encryption Library
//!
//! Provides the per-connection encryption layer between the browser client
//! and the relay, independent of any transport-level TLS.
//!
//! ## Crypto primitives
//!
//! - **Exchange**: ephemeral P-256 ECDH per connection (WebCrypto compatible raw keys)
//! - **Derivation**: HKDF-SHA256 with fixed protocol salt/info → 256-bit key
//! - **Encryption**: AES-256-GCM, random 96-bit nonce, detached 128-bit tag

pub mod envelope;
pub mod error;
pub mod exchange;
pub mod session;

pub use envelope::{Envelope, FrameError, OpenedFrame, open_frame};
pub use error::CryptoError;
#[cfg(any(test, feature = "test-utils"))]
pub use exchange::perform_key_exchange;
pub use exchange::KeyExchangeState;
#[cfg(any(test, feature = "test-utils"))]
pub use session::test_session_pair;
pub use session::{CryptoSession, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
