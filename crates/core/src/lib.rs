//! Core domain types for classification operation tracking.
//!
//! - [`Operation`] / [`Step`]: one tracked job and its progress notes.
//! - [`OperationRegistry`]: the in-memory state machine holding active
//!   operations plus a bounded, deduplicated history of finished ones.
//! - [`CoreError`]: validation and serialization failures.

pub mod error;
pub mod operation;
pub mod registry;

pub use error::CoreError;
pub use operation::{Operation, OperationStatus, Severity, Step};
pub use registry::{OperationRegistry, DEFAULT_HISTORY_LIMIT};

/// Error message recorded on operations abandoned by a previous process.
pub const STALE_OPERATION_MESSAGE: &str = "Operation interrupted (page refresh)";

/// Error message delivered once the push channel's reconnect budget is spent.
pub const CONNECTION_LOST_MESSAGE: &str = "Connection lost";
