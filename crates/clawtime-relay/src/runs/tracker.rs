//! Process-wide runId tracker.
//!
//! A run id is tracked from the moment the agent acknowledges a `chat.send`
//! until its final (or error/aborted) event. Only tracked runs are relayed to
//! clients, which keeps traffic from other agent sessions off the socket.
//!
//! The table is persisted as `{runId: createdAtMillis}` after every change so
//! a relay restart does not drop replies that are still streaming. Restored
//! entries have no owner; the first connection that sees an event for one
//! claims it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use clawtime_core::history::write_json_atomic;
use clawtime_core::now_millis;
use tracing::{debug, info, warn};

/// Entries older than this are ignored at runtime.
pub const RUN_TTL: Duration = Duration::from_secs(5 * 60);

/// Entries older than this are dropped when the table is loaded.
pub const STARTUP_TTL: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, thiserror::Error)]
pub enum RunTrackerError {
    #[error("failed to persist run ids: {0}")]
    Persist(#[from] clawtime_core::Error),
}

#[derive(Debug, Clone)]
struct Entry {
    owner: Option<String>,
    created_at: i64,
}

#[derive(Debug)]
pub struct RunTracker {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, Entry>>,
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl RunTracker {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Load the persisted table, dropping entries older than [`STARTUP_TTL`].
    ///
    /// A missing or unreadable file starts an empty table.
    pub fn load(path: &Path) -> Self {
        Self::load_at(path, now_millis())
    }

    fn load_at(path: &Path, now: i64) -> Self {
        let stored: HashMap<String, i64> = match std::fs::read_to_string(path) {
            Ok(data) if data.trim().is_empty() => HashMap::new(),
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable run id file");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read run id file");
                HashMap::new()
            }
        };

        let total = stored.len();
        let cutoff = now - ttl_millis(STARTUP_TTL);
        let entries: HashMap<String, Entry> = stored
            .into_iter()
            .filter(|(_, created_at)| *created_at >= cutoff)
            .map(|(run_id, created_at)| {
                (
                    run_id,
                    Entry {
                        owner: None,
                        created_at,
                    },
                )
            })
            .collect();
        let purged = total - entries.len();
        info!(
            restored = entries.len(),
            purged,
            path = %path.display(),
            "Run ids loaded"
        );

        let tracker = Self {
            path: Some(path.to_path_buf()),
            entries: Mutex::new(entries),
        };
        if purged > 0
            && let Err(e) = tracker.persist(&tracker.lock())
        {
            warn!(error = %e, "Failed to rewrite purged run id file");
        }
        tracker
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &HashMap<String, Entry>) -> Result<(), RunTrackerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot: HashMap<&str, i64> = entries
            .iter()
            .map(|(run_id, entry)| (run_id.as_str(), entry.created_at))
            .collect();
        write_json_atomic(path, &snapshot)?;
        Ok(())
    }

    fn prune(entries: &mut HashMap<String, Entry>, now: i64) {
        let cutoff = now - ttl_millis(RUN_TTL);
        entries.retain(|_, entry| entry.created_at >= cutoff);
    }

    /// Start tracking `run_id` on behalf of `visitor_id`.
    pub fn track(&self, visitor_id: &str, run_id: &str) -> Result<(), RunTrackerError> {
        self.track_at(visitor_id, run_id, now_millis())
    }

    fn track_at(&self, visitor_id: &str, run_id: &str, now: i64) -> Result<(), RunTrackerError> {
        let mut entries = self.lock();
        Self::prune(&mut entries, now);
        entries.insert(
            run_id.to_string(),
            Entry {
                owner: Some(visitor_id.to_string()),
                created_at: now,
            },
        );
        debug!(visitor_id, run_id, "Run tracked");
        self.persist(&entries)
    }

    /// Stop tracking `run_id`. Returns whether it was tracked.
    pub fn untrack(&self, run_id: &str) -> Result<bool, RunTrackerError> {
        let mut entries = self.lock();
        Self::prune(&mut entries, now_millis());
        if entries.remove(run_id).is_none() {
            return Ok(false);
        }
        debug!(run_id, "Run untracked");
        self.persist(&entries)?;
        Ok(true)
    }

    /// Whether events for `run_id` should reach `visitor_id`.
    ///
    /// An unowned entry is claimed by the first visitor that asks.
    pub fn is_tracked(&self, visitor_id: &str, run_id: &str) -> bool {
        self.is_tracked_at(visitor_id, run_id, now_millis())
    }

    fn is_tracked_at(&self, visitor_id: &str, run_id: &str, now: i64) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(run_id) else {
            return false;
        };
        if entry.created_at < now - ttl_millis(RUN_TTL) {
            return false;
        }
        match &entry.owner {
            Some(owner) => owner == visitor_id,
            None => {
                debug!(visitor_id, run_id, "Restored run claimed");
                entry.owner = Some(visitor_id.to_string());
                true
            }
        }
    }

    /// Disown every run held by `visitor_id` so a reconnecting client can
    /// pick them up. Returns the number released.
    pub fn release_visitor(&self, visitor_id: &str) -> usize {
        let mut entries = self.lock();
        let mut released = 0;
        for entry in entries.values_mut() {
            if entry.owner.as_deref() == Some(visitor_id) {
                entry.owner = None;
                released += 1;
            }
        }
        if released > 0 {
            debug!(visitor_id, released, "Runs released");
        }
        released
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

    #[test]
    fn track_is_scoped_to_visitor() {
        let tracker = RunTracker::in_memory();
        tracker.track("v1", "run-a").unwrap();
        assert!(tracker.is_tracked("v1", "run-a"));
        assert!(!tracker.is_tracked("v2", "run-a"));
        assert!(!tracker.is_tracked("v1", "run-b"));
    }

    #[test]
    fn untrack_stops_delivery() {
        let tracker = RunTracker::in_memory();
        tracker.track("v1", "run-a").unwrap();
        assert!(tracker.untrack("run-a").unwrap());
        assert!(!tracker.is_tracked("v1", "run-a"));
        assert!(!tracker.untrack("run-a").unwrap());
    }

    #[test]
    fn entries_expire_after_runtime_ttl() {
        let tracker = RunTracker::in_memory();
        let now = now_millis();
        tracker.track_at("v1", "old", now - 6 * MINUTE).unwrap();
        assert!(!tracker.is_tracked_at("v1", "old", now));
        assert!(tracker.is_tracked_at("v1", "old", now - 6 * MINUTE + MINUTE));
    }

    #[test]
    fn every_write_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-ids.json");
        let tracker = RunTracker::load(&path);

        tracker.track("v1", "run-a").unwrap();
        tracker.track("v1", "run-b").unwrap();
        let stored: HashMap<String, i64> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.contains_key("run-a"));

        tracker.untrack("run-a").unwrap();
        let stored: HashMap<String, i64> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored.keys().collect::<Vec<_>>(), vec!["run-b"]);
    }

    #[test]
    fn load_purges_entries_older_than_startup_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-ids.json");
        let now = now_millis();
        let stored = HashMap::from([
            ("fresh".to_string(), now - MINUTE),
            ("stale".to_string(), now - 3 * MINUTE),
        ]);
        std::fs::write(&path, serde_json::to_string(&stored).unwrap()).unwrap();

        let tracker = RunTracker::load_at(&path, now);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_tracked_at("anyone", "fresh", now));
        assert!(!tracker.is_tracked_at("anyone", "stale", now));

        let rewritten: HashMap<String, i64> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(!rewritten.contains_key("stale"));
    }

    #[test]
    fn restored_entry_is_claimed_by_first_visitor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-ids.json");
        let now = now_millis();
        std::fs::write(&path, format!(r#"{{"restored": {now}}}"#)).unwrap();

        let tracker = RunTracker::load(&path);
        assert!(tracker.is_tracked("v1", "restored"));
        assert!(!tracker.is_tracked("v2", "restored"));
    }

    #[test]
    fn released_runs_can_be_adopted() {
        let tracker = RunTracker::in_memory();
        tracker.track("v1", "run-a").unwrap();
        assert_eq!(tracker.release_visitor("v1"), 1);
        assert!(tracker.is_tracked("v2", "run-a"));
        assert!(!tracker.is_tracked("v1", "run-a"));
    }

    #[test]
    fn load_tolerates_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-ids.json");
        assert!(RunTracker::load(&path).is_empty());
        std::fs::write(&path, "{not json").unwrap();
        assert!(RunTracker::load(&path).is_empty());
    }
}
