//! Subcommand implementations.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use classify_core::{Operation, OperationStatus};
use classify_tracker::{OperationTracker, Settlement, TrackerEvent};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;

/// Start `job_ids`, print progress as it arrives, and wait for every job.
///
/// Restored operations from a previous run are resumed and waited on too.
pub async fn watch(
    tracker: &Arc<OperationTracker>,
    job_ids: &[String],
    label: Option<String>,
) -> anyhow::Result<ExitCode> {
    let events = tracker.subscribe_events();
    let stop_printing = CancellationToken::new();
    let printer = tokio::spawn(print_events(events, stop_printing.clone()));

    let mut jobs = tracker.resume_active();
    for handle in &jobs {
        println!("[{}] resumed from previous run", handle.job_id());
    }
    for job_id in job_ids {
        jobs.push(tracker.start_job(job_id, label.clone()));
    }

    let outcomes = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            let running = jobs.iter().filter(|job| !job.is_settled()).count();
            tracing::warn!(running, "Interrupted, leaving jobs active");
            printer.abort();
            return Ok(ExitCode::from(130));
        }
        outcomes = futures::future::join_all(jobs.iter().map(|job| job.settled())) => outcomes,
    };
    stop_printing.cancel();
    if let Err(err) = printer.await {
        tracing::warn!(error = %err, "Progress printer ended abnormally");
    }

    println!();
    let mut failed = 0;
    for (job, outcome) in jobs.iter().zip(outcomes) {
        match outcome {
            Settlement::Completed => println!("{:<24} completed", job.job_id()),
            Settlement::Failed(message) => {
                failed += 1;
                println!("{:<24} error: {message}", job.job_id());
            }
            Settlement::Abandoned => println!("{:<24} cancelled", job.job_id()),
        }
    }

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Print progress until `stop` fires, then flush whatever is already queued.
async fn print_events(mut events: Receiver<TrackerEvent>, stop: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                for line in drain_pending(&mut events) {
                    println!("{line}");
                }
                break;
            }
            received = events.recv() => match received {
                Ok(event) => {
                    for line in event_lines(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Progress output fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Lines for every event already queued on `events`, without waiting.
fn drain_pending(events: &mut Receiver<TrackerEvent>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => lines.extend(event_lines(&event)),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Progress output fell behind");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    lines
}

fn event_lines(event: &TrackerEvent) -> Vec<String> {
    match event {
        TrackerEvent::Started { operation } => operation
            .steps
            .iter()
            .map(|step| format!("[{}] {}", operation.id, step.message))
            .collect(),
        TrackerEvent::Step { job_id, step } => vec![format!("[{job_id}] {}", step.message)],
        TrackerEvent::Finished { operation } => operation
            .steps
            .last()
            .map(|step| format!("[{}] {}", operation.id, step.message))
            .into_iter()
            .collect(),
        TrackerEvent::Removed { .. } | TrackerEvent::HistoryCleared => Vec::new(),
    }
}

pub fn history(tracker: &OperationTracker, json: bool) -> anyhow::Result<ExitCode> {
    if json {
        let bytes = tracker.export_history()?;
        println!("{}", String::from_utf8_lossy(&bytes));
        return Ok(ExitCode::SUCCESS);
    }

    let history = tracker.history();
    if history.is_empty() {
        println!("No finished operations");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<24} {:<10} {:<20} {:>9} {:>6}  ERROR",
        "ID", "STATUS", "STARTED", "DURATION", "STEPS"
    );
    for op in &history {
        println!(
            "{:<24} {:<10} {:<20} {:>9} {:>6}  {}",
            op.id,
            op.status.as_str(),
            op.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            format_duration(op),
            op.steps.len(),
            op.error.as_deref().unwrap_or(""),
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub fn export(tracker: &OperationTracker, path: &Path) -> anyhow::Result<ExitCode> {
    let bytes = tracker.export_history()?;
    std::fs::write(path, &bytes)
        .with_context(|| format!("Failed to write history export to {}", path.display()))?;
    println!(
        "Exported {} operations to {}",
        tracker.history().len(),
        path.display()
    );
    Ok(ExitCode::SUCCESS)
}

pub fn import(tracker: &OperationTracker, path: &Path) -> anyhow::Result<ExitCode> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read history file {}", path.display()))?;
    let added = tracker
        .import_history(&bytes)
        .with_context(|| format!("Invalid history file {}", path.display()))?;
    println!("Imported {added} operations from {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn format_duration(op: &Operation) -> String {
    match (op.status, op.completed_at) {
        (OperationStatus::Active, _) | (_, None) => "-".to_string(),
        (_, Some(completed_at)) => {
            let elapsed = completed_at - op.started_at;
            format!("{:.1}s", elapsed.num_milliseconds() as f64 / 1000.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
