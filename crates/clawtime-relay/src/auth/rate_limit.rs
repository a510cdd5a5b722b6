//! Failed-authentication throttling per client address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

/// Counts failed attempts per IP inside a sliding window.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_failures: u32,
    failures: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_failures: u32) -> Self {
        Self {
            window,
            max_failures,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, Vec<Instant>>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recent(&self, attempts: &[Instant], now: Instant) -> usize {
        attempts
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.window)
            .count()
    }

    /// Whether `ip` has used up its attempts for the current window.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.is_blocked_at(ip, Instant::now())
    }

    fn is_blocked_at(&self, ip: IpAddr, now: Instant) -> bool {
        self.lock().get(&ip).is_some_and(|attempts| {
            self.recent(attempts, now) >= usize::try_from(self.max_failures).unwrap_or(usize::MAX)
        })
    }

    /// Record a failure. Returns `true` if `ip` is now blocked.
    pub fn record_failure(&self, ip: IpAddr) -> bool {
        self.record_failure_at(ip, Instant::now())
    }

    fn record_failure_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut failures = self.lock();
        let attempts = failures.entry(ip).or_default();
        attempts.retain(|t| now.saturating_duration_since(*t) < self.window);
        attempts.push(now);
        let blocked = attempts.len() >= usize::try_from(self.max_failures).unwrap_or(usize::MAX);
        if blocked {
            warn!(ip = %ip, failures = attempts.len(), "Authentication rate limit reached");
        }
        blocked
    }

    /// Forget failures for `ip` after a successful login.
    pub fn clear(&self, ip: IpAddr) {
        self.lock().remove(&ip);
    }

    /// Drop addresses with no failures left in the window. Returns how many.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut failures = self.lock();
        let before = failures.len();
        failures.retain(|_, attempts| {
            attempts.retain(|t| now.saturating_duration_since(*t) < self.window);
            !attempts.is_empty()
        });
        before - failures.len()
    }

    pub fn tracked(&self) -> usize {
        self.lock().len()
    }
}
