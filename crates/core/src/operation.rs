//! Operation and step records.
//!
//! These are the records held by the [`OperationRegistry`](crate::OperationRegistry),
//! mirrored into the persisted snapshots, and handed out by history export.
//! The JSON shape (`camelCase` fields, lowercase enum values) is the stable
//! exchange format and must round-trip without loss.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// OperationStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an [`Operation`].
///
/// `Completed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Active,
    Completed,
    Error,
}

impl OperationStatus {
    /// String representation used in exports and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Active => "active",
            OperationStatus::Completed => "completed",
            OperationStatus::Error => "error",
        }
    }

    /// Whether no further transition may leave this state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Active)
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Severity tag of a progress [`Step`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One timestamped progress note within an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub severity: Severity,
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One tracked classification job.
///
/// `id` is the identifier of the underlying job on the classification
/// service. `label` is informational only (usually the uploaded filename).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub status: OperationStatus,
    #[serde(default)]
    pub steps: Vec<Step>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Operation {
    /// Create a fresh active operation with no steps.
    pub fn new(id: impl Into<String>, label: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            label,
            status: OperationStatus::Active,
            steps: Vec::new(),
            started_at: now,
            completed_at: None,
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == OperationStatus::Active
    }

    /// Identity of this run in history: the same job id may run more than
    /// once, but each run has its own start time.
    pub fn history_key(&self) -> (&str, DateTime<Utc>) {
        (self.id.as_str(), self.started_at)
    }

    /// Time elapsed since the operation was started.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }

    /// Append a step, keeping step timestamps non-decreasing.
    ///
    /// Terminal operations are left untouched and `false` is returned.
    pub fn push_step(
        &mut self,
        message: impl Into<String>,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        let floor = self
            .steps
            .last()
            .map(|step| step.timestamp)
            .unwrap_or(self.started_at);

        self.steps.push(Step {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
            timestamp: now.max(floor),
            severity,
        });
        true
    }

    /// Perform the terminal transition. Returns `false` if already terminal
    /// or if `status` is not terminal.
    pub fn finish(
        &mut self,
        status: OperationStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.completed_at = Some(now);
        self.error = match status {
            OperationStatus::Error => error,
            _ => None,
        };
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
