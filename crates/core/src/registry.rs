//! Authoritative in-memory state of tracked operations.
//!
//! [`OperationRegistry`] keeps two containers with different semantics:
//!
//! - the **active set**, a keyed table of running operations where order is
//!   irrelevant, and
//! - the **history**, an ordered most-recent-first sequence of finished
//!   operations, capped at [`DEFAULT_HISTORY_LIMIT`] entries and
//!   deduplicated by `(id, started_at)`.
//!
//! Every mutator reports whether it changed anything. Calls that reference
//! an operation which is no longer active are expected races (late progress,
//! a second completion signal) and are absorbed silently.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;

use crate::error::CoreError;
use crate::operation::{Operation, OperationStatus, Severity};

/// Maximum number of finished operations kept in history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Active operations keyed by id plus a bounded history of finished ones.
#[derive(Debug, Clone)]
pub struct OperationRegistry {
    active: HashMap<String, Operation>,
    history: VecDeque<Operation>,
    history_limit: usize,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry with a custom history cap (at least 1).
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            active: HashMap::new(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Rebuild a registry from previously persisted records.
    ///
    /// `history` is expected most-recent-first. Non-terminal records are
    /// dropped from history, non-active records are dropped from the active
    /// set, duplicate history keys keep their first occurrence, and an
    /// active record whose run already appears in history is discarded.
    pub fn restore(
        active: impl IntoIterator<Item = Operation>,
        history: impl IntoIterator<Item = Operation>,
        history_limit: usize,
    ) -> Self {
        let mut registry = Self::with_history_limit(history_limit);

        for op in history {
            if op.is_active() {
                tracing::warn!(job_id = %op.id, "Dropping non-terminal record from history");
                continue;
            }
            if registry.history_contains(&op) {
                continue;
            }
            registry.history.push_back(op);
        }
        registry.history.truncate(registry.history_limit);

        for op in active {
            if !op.is_active() || registry.history_contains(&op) {
                continue;
            }
            registry.active.insert(op.id.clone(), op);
        }

        registry
    }

    // ---- lifecycle ----

    /// Begin tracking `id`. An existing active entry for the same id is
    /// replaced: a restart counts as a fresh attempt.
    pub fn start_operation(&mut self, id: &str, label: Option<String>) -> &Operation {
        let op = Operation::new(id, label, Utc::now());
        if self.active.contains_key(id) {
            tracing::debug!(job_id = %id, "Replacing active operation with a fresh attempt");
        }
        self.active.insert(id.to_string(), op);
        &self.active[id]
    }

    /// Append a progress step. No-op when `id` is not active.
    pub fn add_step(&mut self, id: &str, message: &str, severity: Severity) -> bool {
        match self.active.get_mut(id) {
            Some(op) => op.push_step(message, severity, Utc::now()),
            None => {
                tracing::debug!(job_id = %id, "Ignoring step for inactive operation");
                false
            }
        }
    }

    /// Mark `id` completed and move it to the front of history.
    pub fn complete_operation(&mut self, id: &str) -> bool {
        self.finish(id, OperationStatus::Completed, None)
    }

    /// Mark `id` failed with `message` and move it to the front of history.
    pub fn error_operation(&mut self, id: &str, message: &str) -> bool {
        self.finish(id, OperationStatus::Error, Some(message.to_string()))
    }

    /// Stop tracking `id` without recording it in history.
    pub fn remove_operation(&mut self, id: &str) -> Option<Operation> {
        self.active.remove(id)
    }

    /// Drop every history entry. Returns how many were removed.
    pub fn clear_history(&mut self) -> usize {
        let removed = self.history.len();
        self.history.clear();
        removed
    }

    // ---- queries ----

    /// The active entry for `id`, if any.
    pub fn get_operation(&self, id: &str) -> Option<&Operation> {
        self.active.get(id)
    }

    pub fn active(&self) -> impl Iterator<Item = &Operation> {
        self.active.values()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// History, most recent first.
    pub fn history(&self) -> impl Iterator<Item = &Operation> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Active operations as a sequence, oldest first.
    pub fn active_snapshot(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self.active.values().cloned().collect();
        ops.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        ops
    }

    /// History as a sequence, most recent first.
    pub fn history_snapshot(&self) -> Vec<Operation> {
        self.history.iter().cloned().collect()
    }

    // ---- export / import ----

    /// Serialize history to a JSON array of operation records.
    pub fn export_history(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec_pretty(&self.history)?)
    }

    /// Merge records produced by [`export_history`](Self::export_history).
    ///
    /// Runs already present in history are kept as they are, and runs that
    /// are still active here are skipped. The merged history is re-ordered
    /// most-recent-first and capped. Returns the number of records added.
    pub fn import_history(&mut self, bytes: &[u8]) -> Result<usize, CoreError> {
        let imported: Vec<Operation> = serde_json::from_slice(bytes)?;

        if let Some(op) = imported.iter().find(|op| op.is_active()) {
            return Err(CoreError::Validation(format!(
                "History import contains active operation '{}'",
                op.id
            )));
        }

        let mut added = 0;
        for op in imported {
            if self.history_contains(&op) {
                continue;
            }
            if self.active_run(&op) {
                tracing::debug!(job_id = %op.id, "Skipping imported record of a running operation");
                continue;
            }
            self.history.push_back(op);
            added += 1;
        }

        self.history.make_contiguous().sort_by(|a, b| {
            b.completed_at
                .cmp(&a.completed_at)
                .then_with(|| b.started_at.cmp(&a.started_at))
        });
        self.history.truncate(self.history_limit);

        Ok(added)
    }

    // ---- private helpers ----

    fn finish(&mut self, id: &str, status: OperationStatus, error: Option<String>) -> bool {
        let Some(mut op) = self.active.remove(id) else {
            tracing::debug!(
                job_id = %id,
                status = status.as_str(),
                "No active operation to finish",
            );
            return false;
        };

        op.finish(status, error, Utc::now());
        tracing::debug!(job_id = %id, status = status.as_str(), "Operation finished");
        self.push_history(op);
        true
    }

    fn push_history(&mut self, op: Operation) {
        let key = op.history_key();
        self.history
            .retain(|existing| existing.history_key() != key);
        self.history.push_front(op);
        self.history.truncate(self.history_limit);
    }

    fn active_run(&self, op: &Operation) -> bool {
        self.active
            .get(&op.id)
            .is_some_and(|active| active.started_at == op.started_at)
    }

    fn history_contains(&self, op: &Operation) -> bool {
        let key = op.history_key();
        self.history
            .iter()
            .any(|existing| existing.history_key() == key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
