//! Client authentication: session lookup and failed-attempt throttling.

pub mod rate_limit;
pub mod session;

pub use rate_limit::RateLimiter;
pub use session::{
    JsonSessionStore, MemorySessionStore, Session, SessionStore, SessionValidator, ip_matches,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("unknown session")]
    UnknownSession,

    #[error("session expired")]
    Expired,

    #[error("session bound to a different address")]
    IpMismatch,

    #[error("too many failed attempts")]
    RateLimited,

    #[error("session store unavailable: {0}")]
    Store(String),
}
