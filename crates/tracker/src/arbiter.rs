//! Exactly-once completion of a job.
//!
//! A job has two independent "done" sources: the push channel (`complete` /
//! `error` frames) and the resolution of the request that triggered it.
//! [`CompletionArbiter`] accepts signals from both, performs the single
//! terminal transition through a [`TerminalSink`], and ignores everything
//! that arrives afterwards.
//!
//! When the trigger request succeeds but the channel stays silent, two
//! timers act as a backstop: the grace window completes the job, and the
//! safety timeout completes it and releases the channel. Settling cancels
//! every pending timer and releases the channel subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use classify_core::OperationRegistry;
use classify_stream::Subscription;
use tokio_util::sync::CancellationToken;

/// Receives the single terminal transition of a job.
pub trait TerminalSink: Send + Sync {
    /// Transition `job_id` to `completed`. Returns `false` if it was not active.
    fn complete(&self, job_id: &str) -> bool;

    /// Transition `job_id` to `error`. Returns `false` if it was not active.
    fn fail(&self, job_id: &str, message: &str) -> bool;
}

impl TerminalSink for Mutex<OperationRegistry> {
    fn complete(&self, job_id: &str) -> bool {
        self.lock()
            .unwrap_or_else(|e| e.into_inner())
            .complete_operation(job_id)
    }

    fn fail(&self, job_id: &str, message: &str) -> bool {
        self.lock()
            .unwrap_or_else(|e| e.into_inner())
            .error_operation(job_id, message)
    }
}

/// Backstop timers, both counted from the trigger request's success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterConfig {
    pub grace_window: Duration,
    pub safety_timeout: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(2),
            safety_timeout: Duration::from_secs(5),
        }
    }
}

/// How a job was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Failed(String),
    /// Dropped by the caller without a terminal transition.
    Abandoned,
}

impl Settlement {
    pub fn is_failure(&self) -> bool {
        matches!(self, Settlement::Failed(_))
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    StreamComplete,
    StreamError,
    RequestFailed,
    GraceWindow,
    SafetyTimeout,
    Deadline,
    Caller,
    Abandon,
}

impl Signal {
    fn as_str(&self) -> &'static str {
        match self {
            Signal::StreamComplete => "stream_complete",
            Signal::StreamError => "stream_error",
            Signal::RequestFailed => "request_failed",
            Signal::GraceWindow => "grace_window",
            Signal::SafetyTimeout => "safety_timeout",
            Signal::Deadline => "deadline",
            Signal::Caller => "caller",
            Signal::Abandon => "abandon",
        }
    }
}

/// Arbitrates the racing completion signals of one job.
pub struct CompletionArbiter {
    job_id: String,
    config: ArbiterConfig,
    sink: Arc<dyn TerminalSink>,
    settled: AtomicBool,
    outcome: Mutex<Option<Settlement>>,
    /// Cancelled on settle; stops every pending timer.
    timers: CancellationToken,
    /// Cancelled once the outcome is recorded.
    done: CancellationToken,
    subscription: Mutex<Option<Subscription>>,
}

impl CompletionArbiter {
    pub fn new(
        job_id: impl Into<String>,
        config: ArbiterConfig,
        sink: Arc<dyn TerminalSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_id: job_id.into(),
            config,
            sink,
            settled: AtomicBool::new(false),
            outcome: Mutex::new(None),
            timers: CancellationToken::new(),
            done: CancellationToken::new(),
            subscription: Mutex::new(None),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Hand over the job's channel subscription. Released on settle, or
    /// immediately if the job is already settled.
    pub fn attach_stream(&self, subscription: Subscription) {
        let mut slot = self.lock_subscription();
        if self.is_settled() {
            drop(slot);
            subscription.cleanup();
            return;
        }
        *slot = Some(subscription);
    }

    /// The channel delivered a `complete` frame.
    pub fn stream_completed(&self) -> bool {
        self.settle(Signal::StreamComplete, Settlement::Completed)
    }

    /// The channel delivered an `error` frame or gave up reconnecting.
    pub fn stream_failed(&self, message: impl Into<String>) -> bool {
        self.settle(Signal::StreamError, Settlement::Failed(message.into()))
    }

    /// The trigger request failed.
    pub fn request_failed(&self, message: impl Into<String>) -> bool {
        self.settle(Signal::RequestFailed, Settlement::Failed(message.into()))
    }

    /// The trigger request succeeded. Arms the grace-window and safety
    /// timers unless the job has already settled.
    pub fn request_succeeded(self: &Arc<Self>) {
        if self.is_settled() {
            tracing::debug!(job_id = %self.job_id, "Trigger resolved after settlement");
            return;
        }
        tracing::debug!(
            job_id = %self.job_id,
            grace_ms = self.config.grace_window.as_millis() as u64,
            safety_ms = self.config.safety_timeout.as_millis() as u64,
            "Trigger succeeded, arming completion timers",
        );
        self.spawn_timer(
            self.config.grace_window,
            Signal::GraceWindow,
            Settlement::Completed,
        );
        self.spawn_timer(
            self.config.safety_timeout,
            Signal::SafetyTimeout,
            Settlement::Completed,
        );
    }

    /// Fail the job with `message` if it has not settled within `after`.
    pub fn arm_deadline(self: &Arc<Self>, after: Duration, message: impl Into<String>) {
        self.spawn_timer(after, Signal::Deadline, Settlement::Failed(message.into()));
    }

    /// Complete the job on the caller's behalf.
    pub fn complete(&self) -> bool {
        self.settle(Signal::Caller, Settlement::Completed)
    }

    /// Fail the job on the caller's behalf.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.settle(Signal::Caller, Settlement::Failed(message.into()))
    }

    /// Settle without touching the sink. Timers stop and the channel is
    /// released.
    pub fn abandon(&self) -> bool {
        self.settle(Signal::Abandon, Settlement::Abandoned)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// The recorded outcome, once settled.
    pub fn outcome(&self) -> Option<Settlement> {
        self.outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until the job settles.
    pub async fn settled(&self) -> Settlement {
        self.done.cancelled().await;
        self.outcome().unwrap_or(Settlement::Abandoned)
    }

    /// Release the channel subscription, if one is attached.
    pub fn release_stream(&self) {
        let subscription = self.lock_subscription().take();
        if let Some(subscription) = subscription {
            subscription.cleanup();
        }
    }

    fn settle(&self, signal: Signal, settlement: Settlement) -> bool {
        if self
            .settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(
                job_id = %self.job_id,
                signal = signal.as_str(),
                "Ignoring completion signal for settled job",
            );
            return false;
        }

        self.timers.cancel();
        self.release_stream();

        let applied = match &settlement {
            Settlement::Completed => self.sink.complete(&self.job_id),
            Settlement::Failed(message) => self.sink.fail(&self.job_id, message),
            Settlement::Abandoned => false,
        };

        match &settlement {
            Settlement::Failed(message) => tracing::info!(
                job_id = %self.job_id,
                signal = signal.as_str(),
                applied,
                error = %message,
                "Job settled with error",
            ),
            _ => tracing::info!(
                job_id = %self.job_id,
                signal = signal.as_str(),
                applied,
                "Job settled",
            ),
        }

        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(settlement);
        self.done.cancel();
        true
    }

    fn spawn_timer(self: &Arc<Self>, after: Duration, signal: Signal, settlement: Settlement) {
        let arbiter = Arc::clone(self);
        let timers = self.timers.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = timers.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if !arbiter.is_settled() {
                        tracing::warn!(
                            job_id = %arbiter.job_id,
                            signal = signal.as_str(),
                            after_ms = after.as_millis() as u64,
                            "No terminal frame received, settling by timer",
                        );
                    }
                    arbiter.settle(signal, settlement);
                }
            }
        });
    }

    fn lock_subscription(&self) -> std::sync::MutexGuard<'_, Option<Subscription>> {
        self.subscription.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use classify_core::OperationStatus;
    use classify_stream::{ChannelTransport, EventStreamClient, ReconnectPolicy, StreamFrame};
    use tokio::time::Instant;

    use super::*;

    #[derive(Default)]
    struct CountingSink {
        completed: AtomicUsize,
        failed: Mutex<Vec<String>>,
    }

    impl TerminalSink for CountingSink {
        fn complete(&self, _job_id: &str) -> bool {
            self.completed.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn fail(&self, _job_id: &str, message: &str) -> bool {
            self.failed.lock().unwrap().push(message.to_string());
            true
        }
    }

    impl CountingSink {
        fn completions(&self) -> usize {
            self.completed.load(Ordering::SeqCst)
        }

        fn failures(&self) -> Vec<String> {
            self.failed.lock().unwrap().clone()
        }
    }

    fn arbiter(sink: &Arc<CountingSink>) -> Arc<CompletionArbiter> {
        CompletionArbiter::new("doc-1", ArbiterConfig::default(), sink.clone())
    }

    #[tokio::test]
    async fn first_signal_wins() {
        let sink = Arc::new(CountingSink::default());
        let arbiter = arbiter(&sink);

        assert!(arbiter.stream_failed("boom"));
        assert!(!arbiter.stream_completed());
        assert!(!arbiter.request_failed("late"));

        assert_eq!(sink.completions(), 0);
        assert_eq!(sink.failures(), vec!["boom".to_string()]);
        assert_eq!(arbiter.outcome(), Some(Settlement::Failed("boom".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn request_success_after_stream_error_arms_nothing() {
        let sink = Arc::new(CountingSink::default());
        let arbiter = arbiter(&sink);

        arbiter.stream_failed("OCR failed");
        arbiter.request_succeeded();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(sink.completions(), 0);
        assert_eq!(sink.failures().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_completes_silent_job() {
        let sink = Arc::new(CountingSink::default());
        let arbiter = arbiter(&sink);
        let started = Instant::now();

        arbiter.request_succeeded();
        let outcome = arbiter.settled().await;

        assert_eq!(outcome, Settlement::Completed);
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.completions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_completion_inside_grace_window_cancels_timers() {
        let sink = Arc::new(CountingSink::default());
        let arbiter = arbiter(&sink);

        arbiter.request_succeeded();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(arbiter.stream_completed());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.completions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_inside_grace_window_wins() {
        let sink = Arc::new(CountingSink::default());
        let arbiter = arbiter(&sink);

        arbiter.request_succeeded();
        tokio::time::sleep(Duration::from_secs(1)).await;
        arbiter.stream_failed("Model timeout");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.completions(), 0);
        assert_eq!(sink.failures(), vec!["Model timeout".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn safety_timeout_settles_when_grace_window_is_longer() {
        let sink = Arc::new(CountingSink::default());
        let config = ArbiterConfig {
            grace_window: Duration::from_secs(60),
            safety_timeout: Duration::from_secs(5),
        };
        let arbiter = CompletionArbiter::new("doc-1", config, sink.clone());
        let started = Instant::now();

        arbiter.request_succeeded();
        assert_eq!(arbiter.settled().await, Settlement::Completed);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_unsettled_job() {
        let sink = Arc::new(CountingSink::default());
        let arbiter = arbiter(&sink);

        arbiter.arm_deadline(Duration::from_secs(30), "too slow");
        let outcome = arbiter.settled().await;

        assert_matches!(outcome, Settlement::Failed(message) if message == "too slow");
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_skips_sink_and_stops_timers() {
        let sink = Arc::new(CountingSink::default());
        let arbiter = arbiter(&sink);

        arbiter.request_succeeded();
        assert!(arbiter.abandon());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(sink.completions(), 0);
        assert!(sink.failures().is_empty());
        assert_eq!(arbiter.settled().await, Settlement::Abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_releases_stream() {
        let transport = ChannelTransport::new();
        let sender = transport.connect("doc-3");
        let client = EventStreamClient::new(transport.clone(), ReconnectPolicy::default());

        let registry = Arc::new(Mutex::new(OperationRegistry::new()));
        registry.lock().unwrap().start_operation("doc-3", None);
        let arbiter = CompletionArbiter::new("doc-3", ArbiterConfig::default(), registry.clone());

        let subscription = client.subscribe("doc-3", |_| {}, || {}, |_| {});
        arbiter.attach_stream(subscription.clone());
        sender.frame(&StreamFrame::Connected);

        arbiter.request_succeeded();
        assert_eq!(arbiter.settled().await, Settlement::Completed);
        subscription.finished().await;

        assert!(subscription.is_closed());
        assert!(sender.is_released());
        let registry = registry.lock().unwrap();
        assert_eq!(
            registry.history().next().map(|op| op.status),
            Some(OperationStatus::Completed)
        );
    }

    #[tokio::test]
    async fn stream_attached_after_settle_is_released() {
        let transport = ChannelTransport::new();
        let _sender = transport.connect("doc-1");
        let client = EventStreamClient::new(transport.clone(), ReconnectPolicy::default());
        let sink = Arc::new(CountingSink::default());
        let arbiter = arbiter(&sink);

        arbiter.request_failed("rejected");
        let subscription = client.subscribe("doc-1", |_| {}, || {}, |_| {});
        arbiter.attach_stream(subscription.clone());

        assert!(subscription.is_closed());
    }

    #[test]
    fn registry_sink_rejects_unknown_job() {
        let registry = Mutex::new(OperationRegistry::new());
        assert!(!registry.complete("ghost"));
        assert!(!registry.fail("ghost", "boom"));
    }
}
