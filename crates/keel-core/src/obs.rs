//! Structured observability hooks for pipeline lifecycle events.
//!
//! This module provides:
//! - A pipeline-scoped tracing span via [`pipeline_span`]
//! - Emission functions with stable `event` keys for sync, selection, stage,
//!   job, artifact and pipeline milestones
//!
//! Events are emitted at `info!` level; tolerated failures and exclusions at
//! `warn!`/`debug!`. Use `RUST_LOG` to filter and `--json` for JSON lines.

use std::path::Path;

use tracing::{debug, info, warn, Span};

use crate::domain::run::{PipelineState, RunResult, StageState};

/// Pipeline-scoped span tagged with the pipeline id and commit.
///
/// Attach it to the pipeline future with [`tracing::Instrument`] so every
/// event emitted while the pipeline runs carries both fields:
///
/// ```ignore
/// run(..).instrument(obs::pipeline_span(&id, trigger.commit_id())).await
/// ```
pub fn pipeline_span(pipeline_id: &str, commit: &str) -> Span {
    tracing::info_span!("keel.pipeline", pipeline_id = %pipeline_id, commit = %commit)
}

/// Emit event: jobs selected, stages about to run.
///
/// ```ignore
/// emit_pipeline_started(&TriggerKind::Push, "master", 6);
/// // logs: event=pipeline.started trigger=push branch=master jobs=6
/// ```
pub fn emit_pipeline_started(trigger: &dyn std::fmt::Display, branch: &str, jobs: usize) {
    info!(event = "pipeline.started", trigger = %trigger, branch = %branch, jobs = jobs);
}

/// Emit event: synchronization began; `cold` when no checkout exists yet.
pub fn emit_sync_started(root: &Path, commit: &str, cold: bool) {
    info!(event = "sync.started", root = %root.display(), commit = %commit, cold = cold);
}

pub fn emit_sync_step(step: &str) {
    debug!(event = "sync.step", step = %step);
}

/// Emit event: a lock file left by an interrupted git process was deleted.
pub fn emit_lock_removed(path: &Path) {
    info!(event = "sync.lock_removed", path = %path.display());
}

/// Emit event: workspace at the expected commit, with duration and merge flag.
pub fn emit_sync_finished(commit: &str, duration_ms: u64, merged: bool) {
    info!(
        event = "sync.finished",
        commit = %commit,
        duration_ms = duration_ms,
        merged = merged,
    );
}

pub fn emit_job_excluded(job: &str, reason: &dyn std::fmt::Display) {
    debug!(event = "select.excluded", job = %job, reason = %reason);
}

pub fn emit_stage_started(stage: &str, jobs: usize) {
    info!(event = "stage.started", stage = %stage, jobs = jobs);
}

pub fn emit_stage_finished(stage: &str, state: StageState) {
    info!(event = "stage.finished", stage = %stage, state = ?state);
}

/// Tolerated failures surface as warnings rather than errors.
pub fn emit_job_finished(result: &RunResult) {
    if result.is_tolerated_failure() {
        warn!(
            event = "job.tolerated_failure",
            job = %result.job_name,
            stage = %result.stage,
            outcome = ?result.outcome,
        );
    } else {
        info!(
            event = "job.finished",
            job = %result.job_name,
            stage = %result.stage,
            outcome = ?result.outcome,
            duration_ms = result.duration_ms,
        );
    }
}

pub fn emit_artifact_published(job: &str, name: &str, files: usize) {
    info!(event = "artifact.published", job = %job, name = %name, files = files);
}

/// Emit event: artifact packaging failed (warning level). The job result is unchanged.
pub fn emit_publish_failed(job: &str, error: &dyn std::fmt::Display) {
    warn!(event = "artifact.publish_failed", job = %job, error = %error);
}

pub fn emit_pipeline_finished(state: PipelineState, duration_ms: u64) {
    info!(event = "pipeline.finished", state = ?state, duration_ms = duration_ms);
}

/// Emit event: sync failed and no job ran (warning level).
pub fn emit_pipeline_aborted(error: &dyn std::fmt::Display) {
    warn!(event = "pipeline.aborted", error = %error);
}
