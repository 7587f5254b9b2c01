//! Real-time tracking of classification jobs.
//!
//! - [`OperationTracker`]: the facade. Starts jobs, records progress,
//!   and keeps the persisted snapshots in step with the registry.
//! - [`CompletionArbiter`]: exactly-once terminal transition per job,
//!   with grace-window and safety-timeout backstops.
//! - [`PersistenceLayer`]: snapshot load/save with stale-operation
//!   reconciliation, over a pluggable [`SnapshotStore`].
//! - [`JobTrigger`]: the request that starts a job on the service.
//! - [`TrackerConfig`]: tunables loaded from the environment.

pub mod arbiter;
pub mod config;
pub mod persistence;
pub mod tracker;
pub mod trigger;

pub use arbiter::{ArbiterConfig, CompletionArbiter, Settlement, TerminalSink};
pub use config::{ConfigError, TrackerConfig};
pub use persistence::{
    FileSnapshotStore, MemorySnapshotStore, PersistenceError, PersistenceLayer, RestoredState,
    SnapshotStore, ACTIVE_SNAPSHOT_KEY, HISTORY_SNAPSHOT_KEY,
};
pub use tracker::{
    JobHandle, OperationTracker, TrackerEvent, COMPLETE_STEP_MESSAGE, START_STEP_MESSAGE,
};
pub use trigger::{HttpJobTrigger, JobTrigger, TriggerError};
