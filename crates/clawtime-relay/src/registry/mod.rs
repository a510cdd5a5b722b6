//! Registry of authenticated client connections.

pub mod clients;

pub use clients::ClientRegistry;
