use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{CompiledPatterns, RunConfig};
use crate::discovery::{Target, TargetSet};
use crate::invoke::{Feedback, Invoker, JobSpec};
use crate::workspace::{atomic_write_json_pretty, is_complete, reset_output_location};

pub const JOB_RECORD_FILE: &str = "job.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Skipped,
    Succeeded,
    Failed,
}

impl TargetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetStatus::Skipped => "skipped",
            TargetStatus::Succeeded => "succeeded",
            TargetStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub tag: String,
    pub status: TargetStatus,
    pub output_location: PathBuf,
    pub exit_status: Option<String>,
    pub error: Option<String>,
}

impl TargetOutcome {
    fn skipped(tag: &str, output_location: PathBuf) -> Self {
        Self {
            tag: tag.to_string(),
            status: TargetStatus::Skipped,
            output_location,
            exit_status: None,
            error: None,
        }
    }

    fn failed(tag: &str, output_location: PathBuf, error: String) -> Self {
        Self {
            tag: tag.to_string(),
            status: TargetStatus::Failed,
            output_location,
            exit_status: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub concurrency: usize,
    /// Sorted by tag.
    pub outcomes: Vec<TargetOutcome>,
}

impl BatchReport {
    fn count(&self, status: TargetStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn skipped(&self) -> usize {
        self.count(TargetStatus::Skipped)
    }

    pub fn succeeded(&self) -> usize {
        self.count(TargetStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(TargetStatus::Failed)
    }

    /// Targets a job was attempted for, whatever the result.
    pub fn processed(&self) -> usize {
        self.succeeded() + self.failed()
    }

    pub fn failed_tags(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.status == TargetStatus::Failed)
            .map(|o| o.tag.as_str())
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "schema_version": "redo_run_summary_v1",
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.to_rfc3339(),
            "concurrency": self.concurrency,
            "counts": {
                "total": self.total(),
                "processed": self.processed(),
                "succeeded": self.succeeded(),
                "skipped": self.skipped(),
                "failed": self.failed(),
            },
            "failed_targets": self.failed_tags(),
            "targets": self.outcomes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    Run,
    Skip,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedTarget {
    pub target: Target,
    pub output_location: PathBuf,
    pub action: PlannedAction,
}

/// What a run would do right now. Read-only.
pub fn plan_targets(
    config: &RunConfig,
    patterns: &CompiledPatterns,
    targets: &TargetSet,
) -> Vec<PlannedTarget> {
    targets
        .values()
        .map(|target| {
            let output_location = config.output_location(&target.tag);
            let action = if is_complete(&output_location, &patterns.completion_marker) {
                PlannedAction::Skip
            } else {
                PlannedAction::Run
            };
            PlannedTarget {
                target: target.clone(),
                output_location,
                action,
            }
        })
        .collect()
}

/// Processes every target with at most `config.concurrency` jobs in flight.
/// Each worker is an OS thread that claims the next target and runs it to
/// completion; per-target failures are recorded, never propagated.
pub fn run_targets(
    config: &RunConfig,
    patterns: &CompiledPatterns,
    targets: &TargetSet,
    invoker: &dyn Invoker,
) -> BatchReport {
    let started_at = Utc::now();
    let queue: Vec<&Target> = targets.values().collect();
    let workers = config.concurrency.max(1).min(queue.len().max(1));
    let next = AtomicUsize::new(0);
    let done = AtomicUsize::new(0);
    let outcomes: Mutex<Vec<TargetOutcome>> = Mutex::new(Vec::with_capacity(queue.len()));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::Relaxed);
                if idx >= queue.len() {
                    return;
                }
                let target = queue[idx];
                let outcome = process_target(config, patterns, target, invoker);
                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    dataset = %outcome.tag,
                    status = outcome.status.as_str(),
                    "[{}/{}] {} {}",
                    finished,
                    queue.len(),
                    outcome.tag,
                    outcome.status.as_str()
                );
                if let Ok(mut guard) = outcomes.lock() {
                    guard.push(outcome);
                }
            });
        }
    });

    let mut outcomes = outcomes.into_inner().unwrap_or_else(|e| e.into_inner());
    outcomes.sort_by(|a, b| a.tag.cmp(&b.tag));
    BatchReport {
        started_at,
        finished_at: Utc::now(),
        concurrency: workers,
        outcomes,
    }
}

/// Oracle, then reset, invoke and persist, strictly in that order.
fn process_target(
    config: &RunConfig,
    patterns: &CompiledPatterns,
    target: &Target,
    invoker: &dyn Invoker,
) -> TargetOutcome {
    let location = config.output_location(&target.tag);
    if is_complete(&location, &patterns.completion_marker) {
        info!(dataset = %target.tag, "already complete; skipping");
        return TargetOutcome::skipped(&target.tag, location);
    }

    if let Err(e) = reset_output_location(&target.tag, &location) {
        error!(dataset = %target.tag, error = %e, "could not prepare output location");
        return TargetOutcome::failed(&target.tag, location, e.to_string());
    }

    let spec = JobSpec::for_target(config, target);
    let feedback = invoker.invoke(&spec);
    let marker_present = is_complete(&location, &patterns.completion_marker);

    if let Err(e) = persist_feedback(config, &spec, &feedback, marker_present) {
        error!(dataset = %target.tag, error = %e, "could not persist feedback");
        let mut outcome = TargetOutcome::failed(&target.tag, location, format!("{:#}", e));
        outcome.exit_status = Some(feedback.status_label());
        return outcome;
    }

    let (status, error) = if feedback.succeeded() {
        (TargetStatus::Succeeded, None)
    } else if let Some(launch) = &feedback.launch_error {
        warn!(dataset = %target.tag, error = %launch, "job failed to launch");
        (TargetStatus::Failed, Some(launch.clone()))
    } else {
        let msg = format!("refinement exited with status {}", feedback.status_label());
        warn!(dataset = %target.tag, "{}", msg);
        (TargetStatus::Failed, Some(msg))
    };
    TargetOutcome {
        tag: target.tag.clone(),
        status,
        output_location: location,
        exit_status: Some(feedback.status_label()),
        error,
    }
}

/// Writes the feedback text and the `job.json` record into the target's own
/// output location.
fn persist_feedback(
    config: &RunConfig,
    spec: &JobSpec,
    feedback: &Feedback,
    marker_present: bool,
) -> Result<()> {
    let feedback_path = spec.output_location.join(&config.feedback_file);
    fs::write(&feedback_path, feedback.render())
        .with_context(|| format!("failed to write {}", feedback_path.display()))?;

    let record = json!({
        "schema_version": "redo_job_v1",
        "dataset": spec.tag,
        "command": feedback.command,
        "structure": spec.structure.display().to_string(),
        "reflections": spec.reflections.display().to_string(),
        "image": spec.image,
        "exit_code": feedback.exit_code,
        "exit_status": feedback.status_label(),
        "launch_error": feedback.launch_error,
        "succeeded": feedback.succeeded(),
        "completion_marker_present": marker_present,
        "started_at": feedback.started_at.to_rfc3339(),
        "finished_at": feedback.finished_at.to_rfc3339(),
        "duration_ms": feedback.duration_ms(),
    });
    atomic_write_json_pretty(&spec.output_location.join(JOB_RECORD_FILE), &record)
}
