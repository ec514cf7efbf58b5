//! Snapshot storage and the `to_match_snapshot` resolution rule.
//!
//! Snapshots live alongside test files in a `__snapshots__` directory,
//! one pretty-printed JSON object per file, keyed by
//! `"<test id> <sequence>"`. Comparison is byte equality after line-ending
//! normalization.

use crate::error::{TactError, TactResult};
use crate::expect::TestFailure;
use crate::model::{SnapshotOutcome, SnapshotStatus};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// On-disk snapshot collection for one test file.
pub struct SnapshotStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl SnapshotStore {
    /// Where the snapshot file for a test file lives:
    /// `<dir>/__snapshots__/<stem>.snap.json`.
    #[must_use]
    pub fn path_for(test_file: &Path) -> PathBuf {
        let dir = test_file.parent().unwrap_or_else(|| Path::new("."));
        let stem = test_file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshots".to_string());
        dir.join("__snapshots__").join(format!("{stem}.snap.json"))
    }

    /// Load the store; a missing file is an empty store.
    pub fn load(path: PathBuf) -> TactResult<Self> {
        let entries = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|err| TactError::io("failed to parse snapshot file", err))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(TactError::io("failed to read snapshot file", err)),
        };
        Ok(Self { path, entries })
    }

    /// Persist the store. Written via a temporary file and rename so a
    /// concurrent reader never observes a torn file.
    pub fn save(&self) -> TactResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| TactError::io("failed to create snapshot directory", err))?;
        }
        let data = serde_json::to_vec_pretty(&self.entries)
            .map_err(|err| TactError::io("failed to serialize snapshots", err))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .map_err(|err| TactError::io("failed to write snapshot file", err))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|err| TactError::io("failed to replace snapshot file", err))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Compare `actual` against the stored value for `key`.
    ///
    /// Absent → write, `Written`. Present and `update` with a different
    /// value → rewrite, `Updated`. Otherwise byte-equal comparison yields
    /// `Matched` or `Mismatched`.
    pub fn resolve(
        &mut self,
        key: &str,
        actual: &str,
        update: bool,
    ) -> TactResult<SnapshotOutcome> {
        let actual = normalize(actual);
        match self.entries.get(key) {
            None => {
                self.entries.insert(key.to_string(), actual);
                self.save()?;
                Ok(SnapshotOutcome::Written)
            }
            Some(stored) if *stored == actual => Ok(SnapshotOutcome::Matched),
            Some(_) if update => {
                self.entries.insert(key.to_string(), actual);
                self.save()?;
                Ok(SnapshotOutcome::Updated)
            }
            Some(_) => Ok(SnapshotOutcome::Mismatched),
        }
    }
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Per-attempt snapshot state: the owning test's id, the sequence counter
/// and the `--update-snapshot` flag.
pub struct SnapshotSession {
    store_path: PathBuf,
    test_id: String,
    update: bool,
    sequence: u32,
    statuses: Vec<SnapshotStatus>,
}

impl SnapshotSession {
    #[must_use]
    pub fn new(store_path: PathBuf, test_id: String, update: bool) -> Self {
        Self {
            store_path,
            test_id,
            update,
            sequence: 0,
            statuses: Vec::new(),
        }
    }

    /// Resolve the next snapshot assertion in this test. The store is
    /// reloaded per assertion so concurrent workers writing the same file
    /// see each other's entries.
    pub fn resolve(&mut self, actual: &str) -> Result<SnapshotStatus, TestFailure> {
        self.sequence += 1;
        let name = format!("{} {}", self.test_id, self.sequence);
        let mut store = SnapshotStore::load(self.store_path.clone())
            .map_err(|err| TestFailure::new(err.to_string()))?;
        let outcome = store
            .resolve(&name, actual, self.update)
            .map_err(|err| TestFailure::new(err.to_string()))?;
        let status = SnapshotStatus { name, outcome };
        self.statuses.push(status.clone());
        if outcome == SnapshotOutcome::Mismatched {
            return Err(TestFailure::new(format!(
                "snapshot \"{}\" does not match the stored value (run with --update-snapshot to rewrite it)",
                status.name
            )));
        }
        Ok(status)
    }

    /// Statuses produced so far, in assertion order.
    #[must_use]
    pub fn statuses(&self) -> &[SnapshotStatus] {
        &self.statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_path_sits_alongside_the_test_file() {
        let path = SnapshotStore::path_for(Path::new("tests/login.tact"));
        assert_eq!(
            path,
            Path::new("tests").join("__snapshots__").join("login.snap.json")
        );
    }

    #[test]
    fn first_resolution_writes_then_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.snap.json");
        let mut store = SnapshotStore::load(path.clone()).unwrap();
        assert_eq!(
            store.resolve("t 1", "screen", false).unwrap(),
            SnapshotOutcome::Written
        );

        let mut reloaded = SnapshotStore::load(path).unwrap();
        assert_eq!(
            reloaded.resolve("t 1", "screen", false).unwrap(),
            SnapshotOutcome::Matched
        );
    }

    #[test]
    fn mismatch_without_update_keeps_the_stored_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.snap.json");
        let mut store = SnapshotStore::load(path.clone()).unwrap();
        store.resolve("t 1", "old", false).unwrap();
        assert_eq!(
            store.resolve("t 1", "new", false).unwrap(),
            SnapshotOutcome::Mismatched
        );
        let reloaded = SnapshotStore::load(path).unwrap();
        assert_eq!(reloaded.get("t 1"), Some("old"));
    }

    #[test]
    fn update_rewrites_a_differing_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.snap.json");
        let mut store = SnapshotStore::load(path.clone()).unwrap();
        store.resolve("t 1", "old", false).unwrap();
        assert_eq!(
            store.resolve("t 1", "new", true).unwrap(),
            SnapshotOutcome::Updated
        );
        assert_eq!(
            store.resolve("t 1", "new", true).unwrap(),
            SnapshotOutcome::Matched
        );
    }

    #[test]
    fn line_endings_normalize_before_comparison() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.snap.json");
        let mut store = SnapshotStore::load(path).unwrap();
        store.resolve("t 1", "a\r\nb", false).unwrap();
        assert_eq!(
            store.resolve("t 1", "a\nb", false).unwrap(),
            SnapshotOutcome::Matched
        );
    }

    #[test]
    fn session_keys_by_test_id_and_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.snap.json");
        let mut session = SnapshotSession::new(path, "file.tact:1:1 > t".into(), false);
        let first = session.resolve("one").unwrap();
        let second = session.resolve("two").unwrap();
        assert_eq!(first.name, "file.tact:1:1 > t 1");
        assert_eq!(second.name, "file.tact:1:1 > t 2");
        assert_eq!(first.outcome, SnapshotOutcome::Written);
        assert_eq!(second.outcome, SnapshotOutcome::Written);
        assert_eq!(session.statuses().len(), 2);
    }

    #[test]
    fn session_mismatch_is_a_test_failure_with_status_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.snap.json");
        let mut first = SnapshotSession::new(path.clone(), "t".into(), false);
        first.resolve("one").unwrap();
        let mut second = SnapshotSession::new(path, "t".into(), false);
        let err = second.resolve("other").unwrap_err();
        assert!(err.message.contains("does not match"));
        assert_eq!(second.statuses()[0].outcome, SnapshotOutcome::Mismatched);
    }
}
