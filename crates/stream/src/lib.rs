//! Push-channel client for classification progress streams.
//!
//! Provides typed frame parsing, a Server-Sent Events decoder, the
//! bounded reconnect policy, pluggable transports, and the
//! [`EventStreamClient`] that turns one job's channel into progress,
//! completion, and error callbacks.

pub mod client;
pub mod messages;
pub mod reconnect;
pub mod sse;
pub mod transport;

pub use client::{EventStreamClient, Subscription};
pub use messages::{parse_frame, StreamFrame};
pub use reconnect::{next_attempt, ReconnectDecision, ReconnectPolicy};
pub use sse::{SseDecoder, SseEvent};
pub use transport::{
    ChannelSender, ChannelTransport, EventStream, EventTransport, HttpSseTransport, TransportError,
};
