//! Observability tests for Keel pipeline lifecycle tracing.
//!
//! These tests verify that structured tracing events carry their stable
//! `event` keys and the fields downstream log processing relies on.

use std::path::Path;
use std::time::Duration;

use keel_core::obs::{
    emit_artifact_published, emit_job_finished, emit_lock_removed, emit_pipeline_aborted,
    emit_pipeline_finished, emit_stage_finished, emit_sync_finished, emit_sync_started,
    pipeline_span,
};
use keel_core::{JobError, JobOutcome, PipelineState, RunResult, StageState};
use tracing_test::traced_test;

fn result(outcome: JobOutcome, allowed_to_fail: bool) -> RunResult {
    RunResult {
        job_name: "benchmarks".to_string(),
        stage: "check-compile".to_string(),
        outcome,
        allowed_to_fail,
        exit_code: Some(1),
        duration_ms: 42,
        log_path: None,
    }
}

#[traced_test]
#[test]
fn test_sync_events_carry_commit() {
    emit_sync_started(Path::new("/srv/ws"), "abc123", true);
    emit_lock_removed(Path::new("/srv/ws/.git/index.lock"));
    emit_sync_finished("abc123", 250, false);

    assert!(logs_contain("sync.started"));
    assert!(logs_contain("cold=true"));
    assert!(logs_contain("index.lock"));
    assert!(logs_contain("sync.finished"));
}

#[traced_test]
#[test]
fn test_tolerated_failure_is_a_warning() {
    let failed = JobOutcome::Failed(JobError::TimedOut {
        after: Duration::from_secs(60),
    });
    emit_job_finished(&result(failed, true));

    assert!(logs_contain("job.tolerated_failure"));
    assert!(logs_contain("WARN"));
}

#[traced_test]
#[test]
fn test_job_and_stage_events() {
    emit_job_finished(&result(JobOutcome::Succeeded, false));
    emit_stage_finished("check-compile", StageState::Succeeded);
    emit_artifact_published("linux", "linux-abc12345", 3);

    assert!(logs_contain("job.finished"));
    assert!(logs_contain("stage.finished"));
    assert!(logs_contain("artifact.published"));
    assert!(!logs_contain("job.tolerated_failure"));
}

#[traced_test]
#[test]
fn test_pipeline_span_fields_reach_events() {
    let span = pipeline_span("pipeline-7", "deadbeef");
    let _guard = span.enter();
    emit_pipeline_finished(PipelineState::PartiallyFailed, 1200);

    assert!(logs_contain("pipeline_id=pipeline-7"));
    assert!(logs_contain("pipeline.finished"));
}

#[traced_test]
#[test]
fn test_pipeline_aborted_logs_error() {
    emit_pipeline_aborted(&"fetch failed: network unreachable");
    assert!(logs_contain("pipeline.aborted"));
    assert!(logs_contain("network unreachable"));
}
