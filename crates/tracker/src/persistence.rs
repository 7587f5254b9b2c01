//! Durable mirror of the operation registry.
//!
//! [`PersistenceLayer`] writes the active set and the history as two
//! independent snapshots, each a JSON array of operation records, and
//! rebuilds the registry from them at startup. Active records older than the
//! staleness threshold cannot be resumed by a new process and are converted
//! into `error` history entries.
//!
//! Durability is best-effort: write failures are logged and never disturb
//! in-memory tracking.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use classify_core::{Operation, OperationRegistry, OperationStatus, STALE_OPERATION_MESSAGE};
use tokio::runtime::RuntimeFlavor;

/// Snapshot key of the active-operations sequence.
pub const ACTIVE_SNAPSHOT_KEY: &str = "active_operations";

/// Snapshot key of the history sequence.
pub const HISTORY_SNAPSHOT_KEY: &str = "operation_history";

/// Errors from a [`SnapshotStore`].
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Keyed blob storage for snapshots. Single writer.
pub trait SnapshotStore: Send + Sync {
    /// Read a snapshot. `Ok(None)` when it was never written.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Replace a snapshot.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError>;
}

// ---------------------------------------------------------------------------
// FileSnapshotStore
// ---------------------------------------------------------------------------

/// One `<key>.json` file per snapshot, replaced atomically via rename.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.path_for(key);
        let temp = self.dir.join(format!(".{key}.json.tmp"));
        std::fs::write(&temp, bytes)?;
        std::fs::rename(&temp, &target)?;
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        run_blocking(|| self.write_atomic(key, bytes))
    }
}

/// Run blocking file I/O on the calling thread. On a multi-threaded runtime
/// the worker's other tasks are handed off first. Writes stay synchronous
/// so they land in mutation order.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

// ---------------------------------------------------------------------------
// MemorySnapshotStore
// ---------------------------------------------------------------------------

/// In-memory snapshot store, for embedders without a filesystem and tests.
#[derive(Default)]
pub struct MemorySnapshotStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current contents of a snapshot.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    /// Decode a snapshot as operation records.
    pub fn records(&self, key: &str) -> Vec<Operation> {
        self.get(key)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.get(key))
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PersistenceLayer
// ---------------------------------------------------------------------------

/// Registry rebuilt from snapshots.
#[derive(Debug)]
pub struct RestoredState {
    pub registry: OperationRegistry,
    /// Ids of active operations that were reclassified as interrupted.
    pub interrupted: Vec<String>,
}

/// Write-through mirror of the registry into a [`SnapshotStore`].
pub struct PersistenceLayer {
    store: Arc<dyn SnapshotStore>,
    stale_after: Duration,
    history_limit: usize,
}

impl PersistenceLayer {
    pub fn new(store: Arc<dyn SnapshotStore>, stale_after: Duration, history_limit: usize) -> Self {
        Self {
            store,
            stale_after,
            history_limit,
        }
    }

    /// Load both snapshots and reconcile stale active operations.
    pub fn load(&self) -> RestoredState {
        self.load_at(Utc::now())
    }

    /// [`load`](Self::load) against an explicit clock reading.
    pub fn load_at(&self, now: DateTime<Utc>) -> RestoredState {
        let active = self.read_records(ACTIVE_SNAPSHOT_KEY);
        let history = self.read_records(HISTORY_SNAPSHOT_KEY);

        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::MAX);

        let mut resumed = Vec::new();
        let mut interrupted = Vec::new();
        for mut op in active {
            if !op.is_active() {
                continue;
            }
            if op.age(now) > stale_after {
                op.finish(
                    OperationStatus::Error,
                    Some(STALE_OPERATION_MESSAGE.to_string()),
                    now,
                );
                tracing::info!(
                    job_id = %op.id,
                    started_at = %op.started_at,
                    "Reclassified stale operation as interrupted",
                );
                interrupted.push(op);
            } else {
                resumed.push(op);
            }
        }

        let interrupted_ids: Vec<String> = interrupted.iter().map(|op| op.id.clone()).collect();
        let registry = OperationRegistry::restore(
            resumed,
            interrupted.into_iter().chain(history),
            self.history_limit,
        );

        tracing::info!(
            active = registry.active_count(),
            history = registry.history_len(),
            interrupted = interrupted_ids.len(),
            "Loaded persisted operations",
        );

        RestoredState {
            registry,
            interrupted: interrupted_ids,
        }
    }

    /// Rewrite the active-operations snapshot.
    pub fn save_active(&self, registry: &OperationRegistry) {
        self.write_records(ACTIVE_SNAPSHOT_KEY, &registry.active_snapshot());
    }

    /// Rewrite the history snapshot.
    pub fn save_history(&self, registry: &OperationRegistry) {
        self.write_records(HISTORY_SNAPSHOT_KEY, &registry.history_snapshot());
    }

    fn write_records(&self, key: &str, records: &[Operation]) {
        let result = serde_json::to_vec(records)
            .map_err(PersistenceError::from)
            .and_then(|bytes| self.store.write(key, &bytes));

        if let Err(e) = result {
            tracing::error!(key, error = %e, "Failed to persist snapshot");
        }
    }

    fn read_records(&self, key: &str) -> Vec<Operation> {
        let bytes = match self.store.read(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read snapshot");
                return Vec::new();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding unparsable snapshot");
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use classify_core::DEFAULT_HISTORY_LIMIT;

    use super::*;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn layer(store: &Arc<MemorySnapshotStore>) -> PersistenceLayer {
        PersistenceLayer::new(store.clone(), FIVE_MINUTES, DEFAULT_HISTORY_LIMIT)
    }

    fn write(store: &MemorySnapshotStore, key: &str, records: &[Operation]) {
        store
            .write(key, &serde_json::to_vec(records).unwrap())
            .unwrap();
    }

    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn read(&self, _key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
            Err(std::io::Error::other("disk on fire").into())
        }

        fn write(&self, _key: &str, _bytes: &[u8]) -> Result<(), PersistenceError> {
            Err(std::io::Error::other("disk on fire").into())
        }
    }

    #[test]
    fn empty_store_loads_empty_registry() {
        let store = MemorySnapshotStore::new();
        let restored = layer(&store).load();
        assert_eq!(restored.registry.active_count(), 0);
        assert_eq!(restored.registry.history_len(), 0);
        assert!(restored.interrupted.is_empty());
    }

    #[test]
    fn stale_active_operation_becomes_interrupted_error() {
        let now = Utc::now();
        let store = MemorySnapshotStore::new();
        let stale = Operation::new("doc-1", None, now - chrono::Duration::minutes(6));
        write(&store, ACTIVE_SNAPSHOT_KEY, &[stale]);

        let restored = layer(&store).load_at(now);

        assert!(restored.registry.get_operation("doc-1").is_none());
        let head = restored.registry.history().next().unwrap();
        assert_eq!(head.id, "doc-1");
        assert_eq!(head.status, OperationStatus::Error);
        assert_eq!(head.error.as_deref(), Some(STALE_OPERATION_MESSAGE));
        assert_eq!(head.completed_at, Some(now));
        assert_eq!(restored.interrupted, vec!["doc-1".to_string()]);
    }

    #[test]
    fn fresh_active_operation_is_resumed() {
        let now = Utc::now();
        let store = MemorySnapshotStore::new();
        let fresh = Operation::new("doc-2", None, now - chrono::Duration::minutes(1));
        write(&store, ACTIVE_SNAPSHOT_KEY, &[fresh]);

        let restored = layer(&store).load_at(now);

        assert!(restored.registry.get_operation("doc-2").is_some());
        assert_eq!(restored.registry.history_len(), 0);
    }

    #[test]
    fn interrupted_entries_go_in_front_of_existing_history() {
        let now = Utc::now();
        let store = MemorySnapshotStore::new();
        let mut done = Operation::new("old", None, now - chrono::Duration::hours(2));
        done.finish(OperationStatus::Completed, None, now - chrono::Duration::hours(1));
        write(&store, HISTORY_SNAPSHOT_KEY, &[done]);
        write(
            &store,
            ACTIVE_SNAPSHOT_KEY,
            &[Operation::new("stale", None, now - chrono::Duration::minutes(30))],
        );

        let restored = layer(&store).load_at(now);
        let ids: Vec<&str> = restored.registry.history().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["stale", "old"]);
    }

    #[test]
    fn saves_are_read_back() {
        let store = MemorySnapshotStore::new();
        let persistence = layer(&store);

        let mut registry = OperationRegistry::new();
        registry.start_operation("a", Some("a.pdf".into()));
        registry.start_operation("b", None);
        registry.complete_operation("b");
        persistence.save_active(&registry);
        persistence.save_history(&registry);

        assert_eq!(store.records(ACTIVE_SNAPSHOT_KEY).len(), 1);
        assert_eq!(store.records(HISTORY_SNAPSHOT_KEY).len(), 1);

        let restored = persistence.load();
        assert_eq!(
            restored.registry.active_snapshot(),
            registry.active_snapshot()
        );
        assert_eq!(
            restored.registry.history_snapshot(),
            registry.history_snapshot()
        );
    }

    #[test]
    fn unparsable_snapshot_is_treated_as_empty() {
        let store = MemorySnapshotStore::new();
        store.write(HISTORY_SNAPSHOT_KEY, b"{{{").unwrap();
        let restored = layer(&store).load();
        assert_eq!(restored.registry.history_len(), 0);
    }

    #[test]
    fn failing_store_does_not_panic() {
        let persistence = PersistenceLayer::new(Arc::new(FailingStore), FIVE_MINUTES, 50);
        let mut registry = OperationRegistry::new();
        registry.start_operation("a", None);

        persistence.save_active(&registry);
        persistence.save_history(&registry);
        let restored = persistence.load();

        assert_eq!(restored.registry.active_count(), 0);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn file_store_writes_from_multi_threaded_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::new(dir.path()));

        let writer = Arc::clone(&store);
        tokio::spawn(async move { writer.write(HISTORY_SNAPSHOT_KEY, b"[]") })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            store.read(HISTORY_SNAPSHOT_KEY).unwrap().as_deref(),
            Some(&b"[]"[..])
        );
    }

    #[tokio::test]
    async fn file_store_writes_from_current_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        store.write(ACTIVE_SNAPSHOT_KEY, b"[]").unwrap();
        assert!(dir.path().join("active_operations.json").exists());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("state"));

        assert!(store.read(ACTIVE_SNAPSHOT_KEY).unwrap().is_none());
        store.write(ACTIVE_SNAPSHOT_KEY, b"[]").unwrap();
        store.write(ACTIVE_SNAPSHOT_KEY, b"[1]").unwrap();

        assert_eq!(
            store.read(ACTIVE_SNAPSHOT_KEY).unwrap().as_deref(),
            Some(&b"[1]"[..])
        );
        assert!(dir.path().join("state/active_operations.json").exists());
        assert!(!dir.path().join("state/.active_operations.json.tmp").exists());
    }
}
