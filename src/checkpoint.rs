//! Crash-consistent persistence of orchestration progress.
//!
//! One checkpoint file per orchestration run, written as pretty-printed JSON
//! and replaced atomically (temp write + rename) on every mutation. Any read
//! problem is normalized to a reject reason; callers treat every reason
//! identically as "start fresh".

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Checkpoint format version stamped on every save. Compatibility is decided
/// on the major component only; a checkpoint from another major is treated as
/// absent, never migrated.
pub const FORMAT_VERSION: &str = "1.0.0";

/// Default ceiling on checkpoint age before it is considered stale.
pub const DEFAULT_MAX_AGE_HOURS: i64 = 24;

/// Why a checkpoint could not be used. Every variant means the same thing to
/// callers: no usable checkpoint, start fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    Corrupted,
    InvalidFormat,
    VersionMismatch,
    Expired,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::NotFound => "not_found",
            RejectReason::Corrupted => "corrupted",
            RejectReason::InvalidFormat => "invalid_format",
            RejectReason::VersionMismatch => "version_mismatch",
            RejectReason::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// An item currently being worked on by some worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProgressItem {
    pub id: String,
    pub identifier: String,
    pub worker_id: String,
    pub progress: u8,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Persisted snapshot of overall orchestration progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub version: String,
    pub epic_id: String,
    pub epic_identifier: String,
    pub session_id: String,
    pub current_phase: usize,
    pub total_phases: usize,
    pub completed_items: Vec<String>,
    pub completed_identifiers: Vec<String>,
    pub in_progress_items: Vec<InProgressItem>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub branch: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionState {
    pub fn new(epic_id: &str, epic_identifier: &str, total_phases: usize, branch: &str) -> Self {
        let now = Utc::now();
        Self {
            version: FORMAT_VERSION.to_string(),
            epic_id: epic_id.to_string(),
            epic_identifier: epic_identifier.to_string(),
            session_id: Uuid::new_v4().to_string(),
            current_phase: 0,
            total_phases,
            completed_items: Vec::new(),
            completed_identifiers: Vec::new(),
            in_progress_items: Vec::new(),
            started_at: now,
            last_updated: now,
            branch: branch.to_string(),
            base_branch: None,
            working_dir: None,
            last_error: None,
            paused: false,
            metadata: HashMap::new(),
        }
    }

    /// Records an item as completed. Idempotent: repeated calls with the same
    /// id leave a single entry, and any in-progress entry for the id is
    /// removed so the two lists never overlap.
    pub fn mark_completed(&mut self, id: &str, identifier: &str) {
        if !self.completed_items.iter().any(|i| i == id) {
            self.completed_items.push(id.to_string());
        }
        if !self.completed_identifiers.iter().any(|i| i == identifier) {
            self.completed_identifiers.push(identifier.to_string());
        }
        self.in_progress_items.retain(|i| i.id != id);
    }

    /// Records an item as in progress, replacing any existing entry for the
    /// same id. An already-completed item is left alone.
    pub fn mark_in_progress(&mut self, item: InProgressItem) {
        if self.completed_items.iter().any(|i| i == &item.id) {
            return;
        }
        self.in_progress_items.retain(|i| i.id != item.id);
        self.in_progress_items.push(item);
    }
}

/// Where the resume logic picks up after a crash: completed items are
/// skipped, in-progress items are re-executed in full (at-least-once).
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub phase_index: usize,
    pub completed: Vec<String>,
    pub retry: Vec<String>,
}

/// File-backed checkpoint store. Read-modify-write helpers serialize through
/// an internal lock so parallel workers cannot interleave mutations.
pub struct CheckpointStore {
    path: PathBuf,
    max_age: Duration,
    lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_age: Duration::hours(DEFAULT_MAX_AGE_HOURS),
            lock: Mutex::new(()),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamps the current format version and timestamp, then writes the state
    /// atomically: temp file first, rename into place. A partially-written
    /// file is never visible under the canonical name.
    pub fn save(&self, state: &mut ExecutionState) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_stamped(state)
    }

    fn write_stamped(&self, state: &mut ExecutionState) -> Result<()> {
        state.version = FORMAT_VERSION.to_string();
        state.last_updated = Utc::now();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(state)
            .with_context(|| "Failed to serialize checkpoint")?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &content)
            .with_context(|| format!("Failed to write temp checkpoint: {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename into: {}", self.path.display()))?;
        Ok(())
    }

    /// Loads the checkpoint, or reports why it cannot be used. Never panics
    /// and never returns an `anyhow` error: unreadable, unparsable, wrongly
    /// shaped, incompatible and stale files all become reject reasons.
    pub fn load(&self) -> Result<ExecutionState, RejectReason> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RejectReason::NotFound)
            }
            Err(_) => return Err(RejectReason::Corrupted),
        };

        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(_) => return Err(RejectReason::Corrupted),
        };

        let version = value
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or(RejectReason::InvalidFormat)?;
        let saved = Version::parse(version).map_err(|_| RejectReason::InvalidFormat)?;
        let current =
            Version::parse(FORMAT_VERSION).map_err(|_| RejectReason::InvalidFormat)?;
        if saved.major != current.major {
            return Err(RejectReason::VersionMismatch);
        }

        let state: ExecutionState =
            serde_json::from_value(value).map_err(|_| RejectReason::InvalidFormat)?;

        if Utc::now() - state.last_updated > self.max_age {
            return Err(RejectReason::Expired);
        }

        Ok(state)
    }

    pub fn has_valid(&self) -> bool {
        self.load().is_ok()
    }

    /// Load-modify-save under the store lock.
    pub fn update_with(&self, apply: impl FnOnce(&mut ExecutionState)) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = match self.load() {
            Ok(s) => s,
            Err(reason) => anyhow::bail!("No usable checkpoint to update ({})", reason),
        };
        apply(&mut state);
        self.write_stamped(&mut state)
    }

    pub fn mark_item_completed(&self, id: &str, identifier: &str) -> Result<()> {
        self.update_with(|state| state.mark_completed(id, identifier))
    }

    pub fn mark_item_in_progress(&self, item: InProgressItem) -> Result<()> {
        self.update_with(|state| state.mark_in_progress(item))
    }

    /// Deletes the checkpoint. A missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to delete checkpoint: {}", self.path.display())),
        }
    }

    /// Resume semantics: the checkpoint's phase index is the resume phase,
    /// completed items are skipped, in-progress items are redone in full. An
    /// item whose completion was unknown at crash time is always re-executed
    /// rather than assumed done.
    pub fn find_resume_point(&self) -> Option<ResumePoint> {
        let state = self.load().ok()?;
        Some(ResumePoint {
            phase_index: state.current_phase,
            completed: state.completed_items.clone(),
            retry: state.in_progress_items.iter().map(|i| i.id.clone()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(dir.join("checkpoint.json"))
    }

    fn sample_state() -> ExecutionState {
        ExecutionState::new("epic-1", "user-auth", 3, "orchestrator/epic-1")
    }

    fn in_progress(id: &str) -> InProgressItem {
        InProgressItem {
            id: id.to_string(),
            identifier: format!("feat-{}", id),
            worker_id: "worker-1".to_string(),
            progress: 40,
            branch: None,
        }
    }

    #[test]
    fn test_save_load_roundtrip_refreshes_timestamp() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut state = sample_state();
        let before = state.last_updated;

        store.save(&mut state).unwrap();
        let loaded = store.load().unwrap();

        assert!(loaded.last_updated >= before);
        assert_eq!(loaded.epic_id, state.epic_id);
        assert_eq!(loaded.session_id, state.session_id);
        assert_eq!(loaded.total_phases, 3);
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert_eq!(store.load().unwrap_err(), RejectReason::NotFound);
        assert!(!store.has_valid());
    }

    #[test]
    fn test_load_unparsable_file_is_corrupted() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert_eq!(store.load().unwrap_err(), RejectReason::Corrupted);
    }

    #[test]
    fn test_load_wrong_shape_is_invalid_format() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        // Parses as JSON and carries a compatible version, but required
        // fields are missing.
        fs::write(store.path(), r#"{"version": "1.0.0", "epic_id": 7}"#).unwrap();
        assert_eq!(store.load().unwrap_err(), RejectReason::InvalidFormat);
    }

    #[test]
    fn test_load_missing_version_is_invalid_format() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.path(), r#"{"epic_id": "epic-1"}"#).unwrap();
        assert_eq!(store.load().unwrap_err(), RejectReason::InvalidFormat);
    }

    #[test]
    fn test_major_version_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut state = sample_state();
        store.save(&mut state).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        let rewritten = content.replace("\"1.0.0\"", "\"2.0.0\"");
        fs::write(store.path(), rewritten).unwrap();

        assert_eq!(store.load().unwrap_err(), RejectReason::VersionMismatch);
    }

    #[test]
    fn test_minor_version_difference_is_compatible() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut state = sample_state();
        store.save(&mut state).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        let rewritten = content.replace("\"1.0.0\"", "\"1.7.2\"");
        fs::write(store.path(), rewritten).unwrap();

        assert!(store.load().is_ok());
    }

    #[test]
    fn test_expired_checkpoint_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path()).with_max_age(Duration::hours(1));
        let mut state = sample_state();
        store.save(&mut state).unwrap();

        let stale = (Utc::now() - Duration::hours(2)).to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let content = fs::read_to_string(store.path()).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&content).unwrap();
        value["last_updated"] = serde_json::Value::String(stale);
        fs::write(store.path(), serde_json::to_string_pretty(&value).unwrap()).unwrap();

        assert_eq!(store.load().unwrap_err(), RejectReason::Expired);
        assert!(!store.has_valid());
    }

    #[test]
    fn test_mark_item_completed_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut state = sample_state();
        state.mark_in_progress(in_progress("f1"));
        store.save(&mut state).unwrap();

        store.mark_item_completed("f1", "feat-f1").unwrap();
        store.mark_item_completed("f1", "feat-f1").unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.completed_items, vec!["f1"]);
        assert_eq!(loaded.completed_identifiers, vec!["feat-f1"]);
        assert!(loaded.in_progress_items.is_empty());
    }

    #[test]
    fn test_mark_in_progress_replaces_by_id() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut state = sample_state();
        store.save(&mut state).unwrap();

        store.mark_item_in_progress(in_progress("f1")).unwrap();
        let mut updated = in_progress("f1");
        updated.progress = 80;
        updated.worker_id = "worker-2".to_string();
        store.mark_item_in_progress(updated).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.in_progress_items.len(), 1);
        assert_eq!(loaded.in_progress_items[0].progress, 80);
        assert_eq!(loaded.in_progress_items[0].worker_id, "worker-2");
    }

    #[test]
    fn test_mark_in_progress_skips_completed_items() {
        let mut state = sample_state();
        state.mark_completed("f1", "feat-f1");
        state.mark_in_progress(in_progress("f1"));
        assert!(state.in_progress_items.is_empty());
        assert_eq!(state.completed_items, vec!["f1"]);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut state = sample_state();
        store.save(&mut state).unwrap();

        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }

    #[test]
    fn test_find_resume_point() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut state = sample_state();
        state.current_phase = 1;
        state.mark_completed("f1", "feat-f1");
        state.mark_in_progress(in_progress("f2"));
        store.save(&mut state).unwrap();

        let resume = store.find_resume_point().unwrap();
        assert_eq!(resume.phase_index, 1);
        assert_eq!(resume.completed, vec!["f1"]);
        assert_eq!(resume.retry, vec!["f2"]);
    }

    #[test]
    fn test_find_resume_point_without_checkpoint() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.find_resume_point().is_none());
    }

    #[test]
    fn test_update_with_persists_mutation() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut state = sample_state();
        store.save(&mut state).unwrap();

        store
            .update_with(|s| {
                s.current_phase = 2;
                s.last_error = Some("build failed".to_string());
            })
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.current_phase, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("build failed"));
    }

    #[test]
    fn test_update_without_checkpoint_errors() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.update_with(|_| {}).is_err());
    }
}
