//! Transports that open one job's progress channel.
//!
//! [`EventTransport`] is the seam between the [`EventStreamClient`](crate::EventStreamClient)
//! and the wire. [`HttpSseTransport`] talks to the classification service
//! over Server-Sent Events; [`ChannelTransport`] is fed in-process through
//! channels, for embedders that run the classification themselves and for
//! tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::messages::StreamFrame;
use crate::sse::{SseDecoder, SseEvent};

/// A live channel: decoded SSE events in arrival order.
///
/// Dropping the stream releases the underlying connection.
pub type EventStream = BoxStream<'static, Result<SseEvent, TransportError>>;

/// Errors raised while opening or reading a progress channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-2xx status.
    #[error("Progress stream rejected ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// No channel is available for the job.
    #[error("Progress channel closed")]
    Closed,
}

/// Opens the progress channel for a job id.
///
/// Reconnection reuses the same job id, so `open` may be called several
/// times for one subscription.
#[async_trait::async_trait]
pub trait EventTransport: Send + Sync {
    async fn open(&self, job_id: &str) -> Result<EventStream, TransportError>;
}

// ---------------------------------------------------------------------------
// HttpSseTransport
// ---------------------------------------------------------------------------

/// Server-Sent Events transport for `GET /api/classify/progress/{job_id}`.
pub struct HttpSseTransport {
    client: reqwest::Client,
    api_url: String,
}

impl HttpSseTransport {
    /// * `api_url` - Base HTTP URL of the classification service, e.g. `http://host:8000`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn progress_url(&self, job_id: &str) -> String {
        format!("{}/api/classify/progress/{job_id}", self.api_url)
    }
}

#[async_trait::async_trait]
impl EventTransport for HttpSseTransport {
    async fn open(&self, job_id: &str) -> Result<EventStream, TransportError> {
        let response = self
            .client
            .get(self.progress_url(job_id))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }

        tracing::debug!(job_id = %job_id, "Progress stream response received");

        let state = DecodeState {
            response,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            exhausted: false,
        };

        let events = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.exhausted {
                    return None;
                }
                match state.response.chunk().await {
                    Ok(Some(chunk)) => {
                        let decoded = state.decoder.feed(&chunk);
                        state.pending.extend(decoded);
                    }
                    Ok(None) => {
                        state.exhausted = true;
                        let decoded = state.decoder.finish();
                        state.pending.extend(decoded);
                    }
                    Err(e) => {
                        state.exhausted = true;
                        return Some((Err(TransportError::Request(e)), state));
                    }
                }
            }
        });

        Ok(events.boxed())
    }
}

/// Read state for one SSE response body.
struct DecodeState {
    response: reqwest::Response,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    exhausted: bool,
}

// ---------------------------------------------------------------------------
// ChannelTransport
// ---------------------------------------------------------------------------

type ChannelItem = Result<SseEvent, TransportError>;

enum QueuedConnection {
    Live(mpsc::UnboundedReceiver<ChannelItem>),
    Refused,
}

/// In-process transport whose channels are fed through [`ChannelSender`]s.
///
/// Each call to [`connect`](Self::connect) or [`refuse`](Self::refuse)
/// queues the outcome of the next `open` for that job id. Opening a job with
/// nothing queued fails with [`TransportError::Closed`].
#[derive(Default)]
pub struct ChannelTransport {
    queued: Mutex<HashMap<String, VecDeque<QueuedConnection>>>,
    opened: AtomicUsize,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a live connection for `job_id` and return its feeding end.
    pub fn connect(&self, job_id: &str) -> ChannelSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.enqueue(job_id, QueuedConnection::Live(rx));
        ChannelSender { tx }
    }

    /// Queue a refused connection attempt for `job_id`.
    pub fn refuse(&self, job_id: &str) {
        self.enqueue(job_id, QueuedConnection::Refused);
    }

    /// Total number of `open` calls made so far.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn enqueue(&self, job_id: &str, connection: QueuedConnection) {
        let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        queued
            .entry(job_id.to_string())
            .or_default()
            .push_back(connection);
    }
}

#[async_trait::async_trait]
impl EventTransport for ChannelTransport {
    async fn open(&self, job_id: &str) -> Result<EventStream, TransportError> {
        self.opened.fetch_add(1, Ordering::SeqCst);

        let next = {
            let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
            queued.get_mut(job_id).and_then(VecDeque::pop_front)
        };

        match next {
            Some(QueuedConnection::Live(rx)) => {
                let events = futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });
                Ok(events.boxed())
            }
            Some(QueuedConnection::Refused) | None => Err(TransportError::Closed),
        }
    }
}

/// Feeding end of one [`ChannelTransport`] connection.
///
/// Dropping the sender ends the stream, which the client treats as an
/// unexpected close.
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<ChannelItem>,
}

impl ChannelSender {
    /// Send a typed frame as an SSE data event.
    pub fn frame(&self, frame: &StreamFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.data(text),
            Err(_) => false,
        }
    }

    /// Send a raw data payload (may be malformed on purpose).
    pub fn data(&self, text: impl Into<String>) -> bool {
        self.tx.send(Ok(SseEvent::Data(text.into()))).is_ok()
    }

    /// Send a keepalive comment.
    pub fn keepalive(&self) -> bool {
        self.tx
            .send(Ok(SseEvent::Comment("keepalive".to_string())))
            .is_ok()
    }

    /// Fail the stream with a transport error.
    pub fn fail(&self) -> bool {
        self.tx.send(Err(TransportError::Closed)).is_ok()
    }

    /// Whether the receiving side has been released by the client.
    pub fn is_released(&self) -> bool {
        self.tx.is_closed()
    }
}
