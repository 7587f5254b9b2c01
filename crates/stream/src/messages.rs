//! Progress-channel frame types and parser.
//!
//! The classification service sends JSON payloads with the shape
//! `{"type": "<kind>", "message": "..."}`. This module deserializes them
//! into a strongly-typed [`StreamFrame`] enum.

use serde::{Deserialize, Serialize};

/// Message used when the service reports an error without details.
pub const DEFAULT_STREAM_ERROR: &str = "Classification failed";

/// All known progress-channel frame types.
///
/// Deserialized via the internally-tagged `"type"` field. Unknown fields
/// are ignored so the service can add data without breaking clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// The channel is open and ready.
    Connected,

    /// A human-readable progress note.
    Progress { message: String },

    /// The job finished successfully. The channel closes afterwards.
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The job failed. The channel closes afterwards.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl StreamFrame {
    /// Whether this frame ends the subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Complete { .. } | StreamFrame::Error { .. })
    }
}

/// Parse a frame payload into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log the failure and keep the channel open.
pub fn parse_frame(text: &str) -> Result<StreamFrame, serde_json::Error> {
    serde_json::from_str(text)
}
