//! Per-job results and stage/pipeline state.

use std::path::PathBuf;

use serde::Serialize;

use crate::domain::error::JobError;

/// Why a selected job did not execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Manual job without an activation event.
    AwaitingActivation,
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed(#[serde(serialize_with = "serialize_display")] JobError),
    Skipped(SkipReason),
    Cancelled,
}

fn serialize_display<S: serde::Serializer>(err: &JobError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(err)
}

/// Result of an executed (or deliberately skipped) job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub job_name: String,
    pub stage: String,
    pub outcome: JobOutcome,
    pub allowed_to_fail: bool,
    /// Exit code of the last step that ran, when a process exited.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub log_path: Option<PathBuf>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded)
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, JobOutcome::Failed(_) | JobOutcome::Cancelled)
    }

    /// A failure that gates the stage.
    pub fn is_blocking_failure(&self) -> bool {
        self.failed() && !self.allowed_to_fail
    }

    /// A failure recorded as a warning only.
    pub fn is_tolerated_failure(&self) -> bool {
        self.failed() && self.allowed_to_fail
    }
}

/// Lifecycle of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Running,
    Succeeded,
    Failed,
    /// Not started because an earlier stage failed or the run was cancelled.
    Skipped,
}

/// Lifecycle of the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Succeeded,
    Failed,
    /// Every gating job passed but at least one tolerant job failed.
    PartiallyFailed,
    Cancelled,
}

impl PipelineState {
    /// Whether a CLI should exit non-zero.
    pub fn is_failure(self) -> bool {
        matches!(self, PipelineState::Failed | PipelineState::Cancelled)
    }
}

/// Results for one stage in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub state: StageState,
    pub results: Vec<RunResult>,
}

impl StageReport {
    pub fn tolerated_failures(&self) -> impl Iterator<Item = &RunResult> {
        self.results.iter().filter(|r| r.is_tolerated_failure())
    }
}
