//! Agent run ownership and persistence.

pub mod tracker;

pub use tracker::{RUN_TTL, RunTracker, RunTrackerError, STARTUP_TTL};
