//! Per-job progress channel subscriptions.
//!
//! [`EventStreamClient::subscribe`] spawns a task that opens the job's
//! channel, forwards `progress` frames, and delivers exactly one terminal
//! callback (`complete` or `error`). Unexpected closes are retried per the
//! [`ReconnectPolicy`]; once the budget is spent the error callback receives
//! [`CONNECTION_LOST_MESSAGE`].
//!
//! After a terminal callback, or after [`Subscription::cleanup`], no further
//! callback fires for that subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use classify_core::CONNECTION_LOST_MESSAGE;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::messages::{parse_frame, StreamFrame, DEFAULT_STREAM_ERROR};
use crate::reconnect::{next_attempt, ReconnectDecision, ReconnectPolicy};
use crate::sse::SseEvent;
use crate::transport::{EventStream, EventTransport};

/// Opens progress-channel subscriptions over a shared transport.
#[derive(Clone)]
pub struct EventStreamClient {
    transport: Arc<dyn EventTransport>,
    policy: ReconnectPolicy,
}

impl EventStreamClient {
    pub fn new(transport: Arc<dyn EventTransport>, policy: ReconnectPolicy) -> Self {
        Self { transport, policy }
    }

    /// Subscribe to `job_id`'s progress channel.
    ///
    /// Must be called from within a Tokio runtime. Callbacks run on the
    /// subscription task in channel order.
    pub fn subscribe<P, C, E>(
        &self,
        job_id: &str,
        on_progress: P,
        on_complete: C,
        on_error: E,
    ) -> Subscription
    where
        P: FnMut(String) + Send + 'static,
        C: FnOnce() + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        let state = Arc::new(SubscriptionState {
            job_id: job_id.to_string(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        let callbacks = Callbacks {
            on_progress,
            on_complete: Some(on_complete),
            on_error: Some(on_error),
        };

        let transport = Arc::clone(&self.transport);
        let policy = self.policy;
        let task_state = Arc::clone(&state);

        tokio::spawn(async move {
            tracing::info!(job_id = %task_state.job_id, "Subscribing to progress stream");
            run_subscription(transport.as_ref(), &policy, &task_state, callbacks).await;
            task_state.finished.cancel();
            tracing::debug!(job_id = %task_state.job_id, "Progress stream task exited");
        });

        Subscription { state }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle to a live subscription. Cheap to clone.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    /// Stop the subscription and release its transport.
    ///
    /// Idempotent; safe to call after natural completion.
    pub fn cleanup(&self) {
        if self.state.close() {
            tracing::debug!(job_id = %self.state.job_id, "Progress stream closed by caller");
        }
    }

    /// Whether the subscription will deliver no further callbacks.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Resolves once the subscription task has exited and dropped its stream.
    pub async fn finished(&self) {
        self.state.finished.cancelled().await;
    }
}

struct SubscriptionState {
    job_id: String,
    closed: AtomicBool,
    /// Cancelled on close; stops the task and drops the stream.
    cancel: CancellationToken,
    /// Cancelled by the task itself on exit.
    finished: CancellationToken,
}

impl SubscriptionState {
    /// Close the subscription. Returns `true` only for the call that closed it.
    fn close(&self) -> bool {
        let first = self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.cancel.cancel();
        first
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Callback gating
// ---------------------------------------------------------------------------

struct Callbacks<P, C, E> {
    on_progress: P,
    on_complete: Option<C>,
    on_error: Option<E>,
}

impl<P, C, E> Callbacks<P, C, E>
where
    P: FnMut(String),
    C: FnOnce(),
    E: FnOnce(String),
{
    fn progress(&mut self, state: &SubscriptionState, message: String) {
        if !state.is_closed() {
            (self.on_progress)(message);
        }
    }

    fn complete(&mut self, state: &SubscriptionState) {
        if state.close() {
            if let Some(on_complete) = self.on_complete.take() {
                on_complete();
            }
        }
    }

    fn error(&mut self, state: &SubscriptionState, message: String) {
        if state.close() {
            if let Some(on_error) = self.on_error.take() {
                on_error(message);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription task
// ---------------------------------------------------------------------------

/// How a single connection ended.
enum ConnectionEnd {
    /// A terminal frame was delivered.
    Settled,
    /// The subscription was closed by the caller.
    Cancelled,
    /// The transport closed without a terminal frame.
    Dropped,
}

/// Core subscription loop: open -> pump frames -> retry.
async fn run_subscription<P, C, E>(
    transport: &dyn EventTransport,
    policy: &ReconnectPolicy,
    state: &SubscriptionState,
    mut callbacks: Callbacks<P, C, E>,
) where
    P: FnMut(String),
    C: FnOnce(),
    E: FnOnce(String),
{
    let mut failures = 0u32;

    loop {
        let opened = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => return,
            result = transport.open(&state.job_id) => result,
        };

        match opened {
            Ok(events) => match pump(events, state, &mut callbacks, &mut failures).await {
                ConnectionEnd::Settled | ConnectionEnd::Cancelled => return,
                ConnectionEnd::Dropped => {
                    tracing::warn!(job_id = %state.job_id, "Progress stream closed unexpectedly");
                }
            },
            Err(e) => {
                tracing::warn!(
                    job_id = %state.job_id,
                    error = %e,
                    "Failed to open progress stream",
                );
            }
        }

        if state.is_closed() {
            return;
        }

        failures += 1;
        match next_attempt(failures, policy) {
            ReconnectDecision::Retry { attempt, delay } => {
                tracing::info!(
                    job_id = %state.job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting progress stream",
                );
                tokio::select! {
                    biased;
                    _ = state.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            ReconnectDecision::GiveUp => {
                tracing::error!(
                    job_id = %state.job_id,
                    attempts = policy.max_attempts,
                    "Progress stream reconnect budget exhausted",
                );
                callbacks.error(state, CONNECTION_LOST_MESSAGE.to_string());
                return;
            }
        }
    }
}

/// Read events from one connection until it ends.
async fn pump<P, C, E>(
    mut events: EventStream,
    state: &SubscriptionState,
    callbacks: &mut Callbacks<P, C, E>,
    failures: &mut u32,
) -> ConnectionEnd
where
    P: FnMut(String),
    C: FnOnce(),
    E: FnOnce(String),
{
    loop {
        let next = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => return ConnectionEnd::Cancelled,
            next = events.next() => next,
        };

        let text = match next {
            Some(Ok(SseEvent::Data(text))) => text,
            Some(Ok(SseEvent::Comment(_))) => {
                tracing::trace!(job_id = %state.job_id, "Keepalive");
                continue;
            }
            Some(Err(e)) => {
                tracing::warn!(job_id = %state.job_id, error = %e, "Progress stream read error");
                return ConnectionEnd::Dropped;
            }
            None => return ConnectionEnd::Dropped,
        };

        match parse_frame(&text) {
            Ok(StreamFrame::Connected) => {
                *failures = 0;
                tracing::info!(job_id = %state.job_id, "Progress stream connected");
            }
            Ok(StreamFrame::Progress { message }) => {
                tracing::debug!(job_id = %state.job_id, message = %message, "Progress");
                callbacks.progress(state, message);
            }
            Ok(StreamFrame::Complete { .. }) => {
                tracing::info!(job_id = %state.job_id, "Progress stream reported completion");
                callbacks.complete(state);
                return ConnectionEnd::Settled;
            }
            Ok(StreamFrame::Error { message }) => {
                let message = message.unwrap_or_else(|| DEFAULT_STREAM_ERROR.to_string());
                tracing::info!(
                    job_id = %state.job_id,
                    error = %message,
                    "Progress stream reported error",
                );
                callbacks.error(state, message);
                return ConnectionEnd::Settled;
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %state.job_id,
                    error = %e,
                    raw_message = %text,
                    "Failed to parse progress frame",
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
