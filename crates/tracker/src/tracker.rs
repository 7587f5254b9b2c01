//! The operation tracker: registry, persistence, progress channels and
//! completion arbitration wired together.
//!
//! [`OperationTracker`] owns the [`OperationRegistry`] behind a mutex and
//! mirrors every mutation into the [`PersistenceLayer`] while still holding
//! that lock, so snapshot writes land in mutation order. Each started job
//! gets its own [`CompletionArbiter`]; the arbiter's terminal transition is
//! routed back here so the final step, the transition and the snapshot
//! write happen together.
//!
//! State changes are also published on a broadcast channel
//! ([`TrackerEvent`]) for front ends that render progress live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use classify_core::{
    CoreError, Operation, OperationRegistry, Severity, Step, STALE_OPERATION_MESSAGE,
};
use classify_stream::{EventStreamClient, EventTransport, HttpSseTransport};
use tokio::sync::broadcast;

use crate::arbiter::{CompletionArbiter, Settlement, TerminalSink};
use crate::config::TrackerConfig;
use crate::persistence::{FileSnapshotStore, PersistenceLayer, SnapshotStore};
use crate::trigger::{HttpJobTrigger, JobTrigger};

/// First step of every started job.
pub const START_STEP_MESSAGE: &str = "Starting classification...";

/// Final step of a successfully completed job.
pub const COMPLETE_STEP_MESSAGE: &str = "Classification complete";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State change published by the tracker.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Started { operation: Operation },
    Step { job_id: String, step: Step },
    Finished { operation: Operation },
    Removed { job_id: String },
    HistoryCleared,
}

/// Handle to one tracked job.
#[derive(Clone)]
pub struct JobHandle {
    arbiter: Arc<CompletionArbiter>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        self.arbiter.job_id()
    }

    pub fn is_settled(&self) -> bool {
        self.arbiter.is_settled()
    }

    /// Wait until the job reaches its terminal state (or is cancelled).
    pub async fn settled(&self) -> Settlement {
        self.arbiter.settled().await
    }
}

/// Tracks classification jobs from start to a persisted terminal state.
pub struct OperationTracker {
    registry: Mutex<OperationRegistry>,
    persistence: PersistenceLayer,
    stream: EventStreamClient,
    trigger: Arc<dyn JobTrigger>,
    config: TrackerConfig,
    jobs: Mutex<HashMap<String, Arc<CompletionArbiter>>>,
    events: broadcast::Sender<TrackerEvent>,
}

impl OperationTracker {
    /// Load persisted state and build a tracker over the given seams.
    ///
    /// Stale active operations are reclassified during load and the
    /// reconciled snapshots are written back immediately.
    pub fn open(
        config: TrackerConfig,
        store: Arc<dyn SnapshotStore>,
        transport: Arc<dyn EventTransport>,
        trigger: Arc<dyn JobTrigger>,
    ) -> Arc<Self> {
        let persistence = PersistenceLayer::new(store, config.stale_after, config.history_limit);
        let restored = persistence.load();
        if !restored.interrupted.is_empty() {
            tracing::warn!(
                jobs = ?restored.interrupted,
                "Operations left running by a previous process were interrupted",
            );
        }
        persistence.save_active(&restored.registry);
        persistence.save_history(&restored.registry);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            registry: Mutex::new(restored.registry),
            persistence,
            stream: EventStreamClient::new(transport, config.reconnect),
            trigger,
            config,
            jobs: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Tracker backed by the state directory and the HTTP service named in
    /// `config`.
    pub fn connect(config: TrackerConfig) -> Arc<Self> {
        let store = Arc::new(FileSnapshotStore::new(config.state_dir.clone()));
        tracing::debug!(state_dir = %store.dir().display(), "Using file snapshot store");
        let transport = Arc::new(HttpSseTransport::new(config.api_base_url.clone()));
        let trigger = Arc::new(HttpJobTrigger::new(
            config.api_base_url.clone(),
            config.dual_verification,
        ));
        Self::open(config, store, transport, trigger)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Start tracking `job_id`, open its progress channel and trigger it.
    ///
    /// Must be called from within a Tokio runtime. A job already being
    /// tracked under the same id is abandoned and replaced.
    pub fn start_job(self: &Arc<Self>, job_id: &str, label: Option<String>) -> JobHandle {
        let arbiter = self.new_arbiter(job_id);

        let operation = {
            let mut registry = self.lock_registry();
            registry.start_operation(job_id, label);
            registry.add_step(job_id, START_STEP_MESSAGE, Severity::Info);
            self.persistence.save_active(&registry);
            registry.get_operation(job_id).cloned()
        };
        if let Some(operation) = operation {
            tracing::info!(job_id = %job_id, label = ?operation.label, "Started tracking job");
            self.emit(TrackerEvent::Started { operation });
        }

        self.watch_stream(&arbiter);
        self.spawn_trigger(&arbiter);
        self.spawn_reaper(&arbiter);

        JobHandle { arbiter }
    }

    /// Re-attach restored active operations that have no live job.
    ///
    /// Each one is re-subscribed and given a deadline equal to its remaining
    /// staleness budget, after which it fails as interrupted.
    pub fn resume_active(self: &Arc<Self>) -> Vec<JobHandle> {
        let now = Utc::now();
        let stale_after =
            chrono::Duration::from_std(self.config.stale_after).unwrap_or(chrono::Duration::MAX);

        let pending: Vec<(String, chrono::Duration)> = {
            let registry = self.lock_registry();
            let jobs = self.lock_jobs();
            let pending = registry
                .active()
                .filter(|op| !jobs.contains_key(&op.id))
                .map(|op| {
                    let remaining = stale_after
                        .checked_sub(&op.age(now))
                        .unwrap_or(stale_after);
                    (op.id.clone(), remaining)
                })
                .collect();
            pending
        };

        pending
            .into_iter()
            .map(|(job_id, remaining)| {
                let remaining = remaining.to_std().unwrap_or(Duration::ZERO);
                tracing::info!(
                    job_id = %job_id,
                    remaining_ms = remaining.as_millis() as u64,
                    "Resuming restored job",
                );

                let arbiter = self.new_arbiter(&job_id);
                self.watch_stream(&arbiter);
                arbiter.arm_deadline(remaining, STALE_OPERATION_MESSAGE);
                self.spawn_reaper(&arbiter);
                JobHandle { arbiter }
            })
            .collect()
    }

    /// Handle of a job currently being arbitrated.
    pub fn job(&self, job_id: &str) -> Option<JobHandle> {
        self.lock_jobs()
            .get(job_id)
            .map(|arbiter| JobHandle {
                arbiter: Arc::clone(arbiter),
            })
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Append a step to an active operation. No-op otherwise.
    pub fn add_step(&self, job_id: &str, message: &str, severity: Severity) -> bool {
        let step = {
            let mut registry = self.lock_registry();
            if !registry.add_step(job_id, message, severity) {
                return false;
            }
            self.persistence.save_active(&registry);
            registry
                .get_operation(job_id)
                .and_then(|op| op.steps.last().cloned())
        };

        if let Some(step) = step {
            tracing::debug!(
                job_id = %job_id,
                severity = step.severity.as_str(),
                message = %step.message,
                "Step recorded",
            );
            self.emit(TrackerEvent::Step {
                job_id: job_id.to_string(),
                step,
            });
        }
        true
    }

    /// Complete `job_id`. Goes through the job's arbiter when one exists.
    pub fn complete(&self, job_id: &str) -> bool {
        match self.arbiter_for(job_id) {
            Some(arbiter) => arbiter.complete(),
            None => self.finish(job_id, Settlement::Completed),
        }
    }

    /// Fail `job_id` with `message`. Goes through the job's arbiter when one
    /// exists.
    pub fn fail(&self, job_id: &str, message: &str) -> bool {
        match self.arbiter_for(job_id) {
            Some(arbiter) => arbiter.fail(message),
            None => self.finish(job_id, Settlement::Failed(message.to_string())),
        }
    }

    /// Stop tracking `job_id` without recording it in history.
    pub fn cancel(&self, job_id: &str) -> Option<Operation> {
        let arbiter = self.lock_jobs().remove(job_id);
        if let Some(arbiter) = arbiter {
            arbiter.abandon();
        }

        let removed = {
            let mut registry = self.lock_registry();
            let removed = registry.remove_operation(job_id);
            if removed.is_some() {
                self.persistence.save_active(&registry);
            }
            removed
        };

        if removed.is_some() {
            tracing::info!(job_id = %job_id, "Cancelled job");
            self.emit(TrackerEvent::Removed {
                job_id: job_id.to_string(),
            });
        }
        removed
    }

    pub fn clear_history(&self) -> usize {
        let removed = {
            let mut registry = self.lock_registry();
            let removed = registry.clear_history();
            self.persistence.save_history(&registry);
            removed
        };
        tracing::info!(removed, "Cleared operation history");
        self.emit(TrackerEvent::HistoryCleared);
        removed
    }

    /// Merge an exported history document. Returns how many records were added.
    pub fn import_history(&self, bytes: &[u8]) -> Result<usize, CoreError> {
        let mut registry = self.lock_registry();
        let added = registry.import_history(bytes)?;
        self.persistence.save_history(&registry);
        tracing::info!(added, history = registry.history_len(), "Imported operation history");
        Ok(added)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Active operation by id, or the most recent history entry for it.
    pub fn operation(&self, job_id: &str) -> Option<Operation> {
        let registry = self.lock_registry();
        let operation = registry
            .get_operation(job_id)
            .or_else(|| registry.history().find(|op| op.id == job_id))
            .cloned();
        operation
    }

    /// Active operations, oldest first.
    pub fn active(&self) -> Vec<Operation> {
        self.lock_registry().active_snapshot()
    }

    /// Finished operations, most recent first.
    pub fn history(&self) -> Vec<Operation> {
        self.lock_registry().history_snapshot()
    }

    pub fn export_history(&self) -> Result<Vec<u8>, CoreError> {
        self.lock_registry().export_history()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Final step plus terminal transition, persisted under one lock.
    fn finish(&self, job_id: &str, settlement: Settlement) -> bool {
        let finished = {
            let mut registry = self.lock_registry();
            let changed = match &settlement {
                Settlement::Completed => {
                    registry.add_step(job_id, COMPLETE_STEP_MESSAGE, Severity::Success);
                    registry.complete_operation(job_id)
                }
                Settlement::Failed(message) => {
                    registry.add_step(job_id, message, Severity::Error);
                    registry.error_operation(job_id, message)
                }
                Settlement::Abandoned => false,
            };
            if !changed {
                tracing::debug!(
                    job_id = %job_id,
                    "Terminal transition for inactive operation ignored",
                );
                return false;
            }
            self.persistence.save_active(&registry);
            self.persistence.save_history(&registry);
            let head = registry.history().next().cloned();
            head
        };

        if let Some(operation) = finished {
            self.emit(TrackerEvent::Finished { operation });
        }
        true
    }

    fn new_arbiter(self: &Arc<Self>, job_id: &str) -> Arc<CompletionArbiter> {
        let sink = Arc::new(TrackerSink {
            tracker: Arc::downgrade(self),
        });
        let arbiter = CompletionArbiter::new(job_id, self.config.arbiter(), sink);

        let previous = self
            .lock_jobs()
            .insert(job_id.to_string(), Arc::clone(&arbiter));
        if let Some(previous) = previous {
            tracing::debug!(job_id = %job_id, "Abandoning previous run of job");
            previous.abandon();
        }
        arbiter
    }

    fn watch_stream(self: &Arc<Self>, arbiter: &Arc<CompletionArbiter>) {
        let tracker = Arc::downgrade(self);
        let job_id = arbiter.job_id().to_string();
        let on_complete = {
            let arbiter = Arc::clone(arbiter);
            move || {
                arbiter.stream_completed();
            }
        };
        let on_error = {
            let arbiter = Arc::clone(arbiter);
            move |message: String| {
                arbiter.stream_failed(message);
            }
        };

        let subscription = self.stream.subscribe(
            arbiter.job_id(),
            move |message| {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.add_step(&job_id, &message, Severity::Info);
                }
            },
            on_complete,
            on_error,
        );
        arbiter.attach_stream(subscription);
    }

    fn spawn_trigger(&self, arbiter: &Arc<CompletionArbiter>) {
        let trigger = Arc::clone(&self.trigger);
        let arbiter = Arc::clone(arbiter);

        tokio::spawn(async move {
            match trigger.trigger(arbiter.job_id()).await {
                Ok(()) => arbiter.request_succeeded(),
                Err(e) => {
                    tracing::warn!(
                        job_id = %arbiter.job_id(),
                        error = %e,
                        "Classification request failed",
                    );
                    arbiter.request_failed(e.operation_message());
                }
            }
        });
    }

    /// Drop the job entry once its arbiter settles, unless it was replaced.
    fn spawn_reaper(self: &Arc<Self>, arbiter: &Arc<CompletionArbiter>) {
        let tracker = Arc::downgrade(self);
        let arbiter = Arc::clone(arbiter);

        tokio::spawn(async move {
            arbiter.settled().await;
            if let Some(tracker) = tracker.upgrade() {
                let mut jobs = tracker.lock_jobs();
                if jobs
                    .get(arbiter.job_id())
                    .is_some_and(|current| Arc::ptr_eq(current, &arbiter))
                {
                    jobs.remove(arbiter.job_id());
                }
            }
        });
    }

    fn arbiter_for(&self, job_id: &str) -> Option<Arc<CompletionArbiter>> {
        self.lock_jobs().get(job_id).cloned()
    }

    fn emit(&self, event: TrackerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn lock_registry(&self) -> MutexGuard<'_, OperationRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, Arc<CompletionArbiter>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Routes an arbiter's terminal transition back into the tracker.
struct TrackerSink {
    tracker: Weak<OperationTracker>,
}

impl TerminalSink for TrackerSink {
    fn complete(&self, job_id: &str) -> bool {
        self.tracker
            .upgrade()
            .is_some_and(|tracker| tracker.finish(job_id, Settlement::Completed))
    }

    fn fail(&self, job_id: &str, message: &str) -> bool {
        self.tracker.upgrade().is_some_and(|tracker| {
            tracker.finish(job_id, Settlement::Failed(message.to_string()))
        })
    }
}
