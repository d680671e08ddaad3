//! Stage-by-stage job execution.
//!
//! Stages run strictly in sequence; jobs of one stage run concurrently, each
//! in its own [`JobContext`]. A stage fails when any non-tolerant job fails,
//! and no later stage starts after that. Jobs already dispatched in the
//! failing stage run to completion and their results are kept.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{instrument, warn};

use keel_core::obs;
use keel_core::{
    JobError, JobOutcome, JobSpec, PipelineState, RunMode, RunResult, SkipReason, StageReport,
    StageState, Trigger, Workspace,
};

use crate::executor::{CommandExecutor, Isolation, JobContext};
use crate::publish::{ArtifactPublisher, PublishFailure, PublishedArtifact};

/// Stage runner settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of concurrently running jobs within a stage.
    pub max_parallel: usize,
    pub isolation: Isolation,
    pub log_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            isolation: Isolation::default(),
            log_dir: PathBuf::from(".keel/logs"),
        }
    }
}

/// Everything a stage run produced.
#[derive(Debug, Clone, Serialize)]
pub struct StageRun {
    pub stages: Vec<StageReport>,
    pub state: PipelineState,
    pub artifacts: Vec<PublishedArtifact>,
    pub publish_failures: Vec<PublishFailure>,
}

impl StageRun {
    /// All run results in stage order.
    pub fn results(&self) -> Vec<&RunResult> {
        self.stages.iter().flat_map(|s| s.results.iter()).collect()
    }

    pub fn result(&self, job: &str) -> Option<&RunResult> {
        self.results().into_iter().find(|r| r.job_name == job)
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Executes selected jobs stage by stage.
pub struct StageRunner {
    executor: Arc<dyn CommandExecutor>,
    config: RunnerConfig,
    activations: HashSet<String>,
    publisher: Option<Arc<ArtifactPublisher>>,
    cancel: Option<watch::Receiver<bool>>,
}

struct JobRun {
    result: RunResult,
    artifact: Option<Result<PublishedArtifact, PublishFailure>>,
}

impl StageRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: RunnerConfig) -> Self {
        Self {
            executor,
            config,
            activations: HashSet::new(),
            publisher: None,
            cancel: None,
        }
    }

    /// Manual jobs a human activated for this run.
    pub fn with_activations<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.activations = jobs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<ArtifactPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Abort in-flight jobs and stop scheduling stages once `true` is sent.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run `jobs`, already ordered by stage, against the synchronized workspace.
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    pub async fn run(
        &self,
        jobs: Vec<JobSpec>,
        workspace: Arc<Workspace>,
        trigger: &Trigger,
    ) -> StageRun {
        let trigger = Arc::new(trigger.clone());
        let mut stages = Vec::new();
        let mut artifacts = Vec::new();
        let mut publish_failures = Vec::new();
        let mut halted = false;
        let mut was_cancelled = false;

        for (name, stage_jobs) in group_by_stage(jobs) {
            if halted || self.cancelled() {
                was_cancelled |= self.cancelled();
                stages.push(StageReport {
                    name,
                    state: StageState::Skipped,
                    results: Vec::new(),
                });
                continue;
            }

            obs::emit_stage_started(&name, stage_jobs.len());
            let mut report = StageReport {
                name: name.clone(),
                state: StageState::Running,
                results: Vec::new(),
            };

            let runs = self.run_stage(stage_jobs, &workspace, &trigger).await;
            for run in runs {
                obs::emit_job_finished(&run.result);
                match run.artifact {
                    Some(Ok(artifact)) => artifacts.push(artifact),
                    Some(Err(failure)) => publish_failures.push(failure),
                    None => {}
                }
                report.results.push(run.result);
            }

            let stage_failed = report.results.iter().any(RunResult::is_blocking_failure);
            report.state = if stage_failed {
                StageState::Failed
            } else {
                StageState::Succeeded
            };
            obs::emit_stage_finished(&name, report.state);

            if report
                .results
                .iter()
                .any(|r| r.outcome == JobOutcome::Cancelled)
            {
                was_cancelled = true;
            }
            halted = stage_failed || was_cancelled;
            stages.push(report);
        }

        let state = pipeline_state(&stages, was_cancelled);
        StageRun {
            stages,
            state,
            artifacts,
            publish_failures,
        }
    }

    async fn run_stage(
        &self,
        jobs: Vec<JobSpec>,
        workspace: &Arc<Workspace>,
        trigger: &Arc<Trigger>,
    ) -> Vec<JobRun> {
        let sem = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut tasks = Vec::with_capacity(jobs.len());

        for job in jobs {
            let identity = (job.name.clone(), job.stage.clone(), job.is_tolerant());
            let activated = self.activations.contains(&job.name);
            let executor = Arc::clone(&self.executor);
            let config = self.config.clone();
            let publisher = self.publisher.clone();
            let cancel = self.cancel.clone();
            let workspace = Arc::clone(workspace);
            let trigger = Arc::clone(trigger);
            let sem = Arc::clone(&sem);

            let task = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                run_job(
                    job, activated, executor, config, publisher, cancel, workspace, trigger,
                )
                .await
            });
            tasks.push((identity, task));
        }

        let mut runs = Vec::with_capacity(tasks.len());
        for ((job_name, stage, allowed_to_fail), task) in tasks {
            let run = match task.await {
                Ok(run) => run,
                Err(e) => {
                    warn!(job = %job_name, error = %e, "job task panicked");
                    JobRun {
                        result: RunResult {
                            job_name,
                            stage,
                            outcome: JobOutcome::Failed(JobError::Panicked(e.to_string())),
                            allowed_to_fail,
                            exit_code: None,
                            duration_ms: 0,
                            log_path: None,
                        },
                        artifact: None,
                    }
                }
            };
            runs.push(run);
        }
        runs
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_job(
    job: JobSpec,
    activated: bool,
    executor: Arc<dyn CommandExecutor>,
    config: RunnerConfig,
    publisher: Option<Arc<ArtifactPublisher>>,
    cancel: Option<watch::Receiver<bool>>,
    workspace: Arc<Workspace>,
    trigger: Arc<Trigger>,
) -> JobRun {
    let start = Instant::now();
    let mut result = RunResult {
        job_name: job.name.clone(),
        stage: job.stage.clone(),
        outcome: JobOutcome::Succeeded,
        allowed_to_fail: job.is_tolerant(),
        exit_code: None,
        duration_ms: 0,
        log_path: None,
    };

    if job.run_mode == RunMode::Manual && !activated {
        result.outcome = JobOutcome::Skipped(SkipReason::AwaitingActivation);
        return JobRun {
            result,
            artifact: None,
        };
    }

    // Private copies walk the whole tree.
    let prepared = {
        let job = job.clone();
        let workspace = Arc::clone(&workspace);
        let trigger = Arc::clone(&trigger);
        let RunnerConfig {
            isolation, log_dir, ..
        } = config;
        tokio::task::spawn_blocking(move || {
            JobContext::prepare(&job, &workspace, &trigger, isolation, &log_dir)
        })
        .await
        .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)))
    };
    let ctx = match prepared {
        Ok(ctx) => ctx,
        Err(e) => {
            result.outcome = JobOutcome::Failed(JobError::Spawn(e.to_string()));
            result.duration_ms = start.elapsed().as_millis() as u64;
            return JobRun {
                result,
                artifact: None,
            };
        }
    };
    result.log_path = Some(ctx.log_path.clone());

    let timeout = job.timeout.as_ref().map(|t| t.as_duration());
    let (outcome, exit_code) = tokio::select! {
        r = run_script(&job, executor.as_ref(), &ctx, timeout) => r,
        _ = wait_cancelled(cancel) => (JobOutcome::Cancelled, None),
    };
    result.outcome = outcome;
    result.exit_code = exit_code;
    result.duration_ms = start.elapsed().as_millis() as u64;

    let artifact = match publisher {
        Some(publisher) if result.succeeded() && !job.artifact_paths.is_empty() => {
            let tag = workspace
                .current_commit
                .as_deref()
                .map(short_id)
                .unwrap_or_else(|| trigger.short_commit())
                .to_string();
            let work_dir = ctx.work_dir.clone();
            let job_name = job.name.clone();
            let published = tokio::task::spawn_blocking(move || {
                publisher.publish(&job, &work_dir, &tag).map_err(|e| e.to_string())
            })
            .await
            .unwrap_or_else(|e| Err(e.to_string()));

            Some(match published {
                Ok(artifact) => {
                    obs::emit_artifact_published(&job_name, &artifact.name, artifact.files.len());
                    Ok(artifact)
                }
                Err(error) => {
                    obs::emit_publish_failed(&job_name, &error);
                    Err(PublishFailure { job_name, error })
                }
            })
        }
        _ => None,
    };

    drop(ctx);
    JobRun { result, artifact }
}

/// Run every step in order, stopping at the first failure.
async fn run_script(
    job: &JobSpec,
    executor: &dyn CommandExecutor,
    ctx: &JobContext,
    timeout: Option<Duration>,
) -> (JobOutcome, Option<i32>) {
    let steps = async {
        let mut last = None;
        for step in &job.script {
            let code = executor
                .execute(step, ctx)
                .await
                .map_err(|e| (e, last))?;
            last = Some(code);
            if code != 0 {
                return Err((JobError::NonZeroExit { code }, last));
            }
        }
        Ok(last)
    };

    let outcome = match timeout {
        Some(after) => tokio::time::timeout(after, steps)
            .await
            .unwrap_or(Err((JobError::TimedOut { after }, None))),
        None => steps.await,
    };

    match outcome {
        Ok(code) => (JobOutcome::Succeeded, code),
        Err((err, code)) => (JobOutcome::Failed(err), code),
    }
}

async fn wait_cancelled(cancel: Option<watch::Receiver<bool>>) {
    match cancel {
        Some(mut rx) => {
            if rx.wait_for(|c| *c).await.is_err() {
                // Sender gone: cancellation can no longer happen.
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

fn short_id(commit: &str) -> &str {
    let end = commit
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(commit.len());
    &commit[..end]
}

/// Split stage-ordered jobs into consecutive same-stage groups.
fn group_by_stage(jobs: Vec<JobSpec>) -> Vec<(String, Vec<JobSpec>)> {
    let mut groups: Vec<(String, Vec<JobSpec>)> = Vec::new();
    for job in jobs {
        match groups.last_mut() {
            Some((stage, group)) if *stage == job.stage => group.push(job),
            _ => groups.push((job.stage.clone(), vec![job])),
        }
    }
    groups
}

fn pipeline_state(stages: &[StageReport], cancelled: bool) -> PipelineState {
    if cancelled {
        return PipelineState::Cancelled;
    }
    if stages.iter().any(|s| s.state == StageState::Failed) {
        return PipelineState::Failed;
    }
    if stages.iter().any(|s| s.tolerated_failures().next().is_some()) {
        return PipelineState::PartiallyFailed;
    }
    PipelineState::Succeeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Exit code comes from the step text: `exit:N`, `sleep:MS`, `panic` or anything else for 0.
    #[derive(Default)]
    struct ScriptedExecutor {
        running: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            step: &keel_core::ScriptStep,
            ctx: &JobContext,
        ) -> Result<i32, JobError> {
            self.seen.lock().unwrap().push(ctx.job_name.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let text = step.as_str();
            let code = if let Some(ms) = text.strip_prefix("sleep:") {
                tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
                0
            } else if text == "panic" {
                panic!("executor blew up in {}", ctx.job_name);
            } else if let Some(code) = text.strip_prefix("exit:") {
                code.parse().unwrap()
            } else {
                0
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(code)
        }
    }

    fn runner(exec: Arc<ScriptedExecutor>, logs: &std::path::Path) -> StageRunner {
        StageRunner::new(
            exec,
            RunnerConfig {
                max_parallel: 2,
                isolation: Isolation::Shared,
                log_dir: logs.to_path_buf(),
            },
        )
    }

    fn workspace(root: &std::path::Path) -> Arc<Workspace> {
        let mut ws = Workspace::new(root);
        ws.current_commit = Some("0123456789abcdef".into());
        Arc::new(ws)
    }

    #[test]
    fn test_group_by_stage_keeps_order() {
        let groups = group_by_stage(vec![
            JobSpec::new("a", "build", ["x"]),
            JobSpec::new("b", "build", ["x"]),
            JobSpec::new("c", "test", ["x"]),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "build");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "test");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[tokio::test]
    async fn test_blocking_failure_stops_later_stages() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::default());

        let run = runner(exec.clone(), logs.path())
            .run(
                vec![
                    JobSpec::new("fmt", "check", ["exit:1"]),
                    JobSpec::new("clippy", "check", ["ok"]),
                    JobSpec::new("release", "build", ["ok"]),
                ],
                workspace(root.path()),
                &Trigger::push("master", "0123456789abcdef"),
            )
            .await;

        assert_eq!(run.state, PipelineState::Failed);
        assert_eq!(run.stage("check").unwrap().state, StageState::Failed);
        assert_eq!(run.stage("build").unwrap().state, StageState::Skipped);
        assert!(run.result("clippy").unwrap().succeeded());
        assert_eq!(run.result("fmt").unwrap().exit_code, Some(1));
        assert!(run.result("release").is_none());
        assert!(!exec.seen.lock().unwrap().contains(&"release".to_string()));
    }

    #[tokio::test]
    async fn test_tolerated_failure_is_partial() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::default());

        let run = runner(exec, logs.path())
            .run(
                vec![
                    JobSpec::new("bench", "check", ["exit:2"])
                        .with_run_mode(RunMode::OnFailureAllowed),
                    JobSpec::new("release", "build", ["ok"]),
                ],
                workspace(root.path()),
                &Trigger::push("master", "0123456789abcdef"),
            )
            .await;

        assert_eq!(run.state, PipelineState::PartiallyFailed);
        assert_eq!(run.stage("check").unwrap().state, StageState::Succeeded);
        assert!(run.result("release").unwrap().succeeded());
        assert!(run.result("bench").unwrap().is_tolerated_failure());
    }

    #[tokio::test]
    async fn test_manual_job_waits_for_activation() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::default());
        let jobs = vec![
            JobSpec::new("macos", "optional", ["ok"]).with_run_mode(RunMode::Manual),
            JobSpec::new("windows", "optional", ["ok"]).with_run_mode(RunMode::Manual),
        ];

        let run = runner(exec.clone(), logs.path())
            .with_activations(["windows"])
            .run(jobs, workspace(root.path()), &Trigger::push("master", "abc"))
            .await;

        assert_eq!(run.state, PipelineState::Succeeded);
        assert_eq!(
            run.result("macos").unwrap().outcome,
            JobOutcome::Skipped(SkipReason::AwaitingActivation)
        );
        assert!(run.result("windows").unwrap().succeeded());
        assert_eq!(*exec.seen.lock().unwrap(), vec!["windows".to_string()]);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::default());
        let jobs = (0..5)
            .map(|i| JobSpec::new(format!("job{i}"), "check", ["sleep:30"]))
            .collect();

        let run = runner(exec.clone(), logs.path())
            .run(jobs, workspace(root.path()), &Trigger::push("master", "abc"))
            .await;

        assert_eq!(run.state, PipelineState::Succeeded);
        assert!(exec.peak.load(Ordering::SeqCst) <= 2);
        let names: Vec<_> = run.results().iter().map(|r| r.job_name.clone()).collect();
        assert_eq!(names, vec!["job0", "job1", "job2", "job3", "job4"]);
    }

    #[tokio::test]
    async fn test_timeout_fails_job() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::default());
        let job = JobSpec::new("slow", "check", ["sleep:5000"])
            .with_timeout("1s".parse().unwrap());

        let run = runner(exec, logs.path())
            .run(vec![job], workspace(root.path()), &Trigger::push("master", "abc"))
            .await;

        assert_eq!(run.state, PipelineState::Failed);
        assert_eq!(
            run.result("slow").unwrap().outcome,
            JobOutcome::Failed(JobError::TimedOut {
                after: Duration::from_secs(1)
            })
        );
    }

    #[tokio::test]
    async fn test_panicked_job_gates_stage() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::default());

        let run = runner(exec.clone(), logs.path())
            .run(
                vec![
                    JobSpec::new("gate", "check", ["panic"]),
                    JobSpec::new("release", "build", ["ok"]),
                ],
                workspace(root.path()),
                &Trigger::push("master", "abc"),
            )
            .await;

        assert_eq!(run.state, PipelineState::Failed);
        assert_eq!(run.stage("check").unwrap().state, StageState::Failed);
        assert_eq!(run.stage("build").unwrap().state, StageState::Skipped);
        let gate = run.result("gate").unwrap();
        assert!(matches!(gate.outcome, JobOutcome::Failed(JobError::Panicked(_))));
        assert!(gate.is_blocking_failure());
        assert!(!exec.seen.lock().unwrap().contains(&"release".to_string()));
    }

    #[tokio::test]
    async fn test_default_isolation_hides_sibling_output() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let config = RunnerConfig {
            max_parallel: 1,
            log_dir: logs.path().to_path_buf(),
            ..RunnerConfig::default()
        };
        assert_eq!(config.isolation, Isolation::PrivateCopy);

        let run = StageRunner::new(Arc::new(crate::executor::ShellExecutor::new()), config)
            .run(
                vec![
                    JobSpec::new("writer", "check", ["echo partial > intermediate.o"]),
                    JobSpec::new("reader", "check", ["test ! -f intermediate.o"]),
                ],
                workspace(root.path()),
                &Trigger::push("master", "abc"),
            )
            .await;

        assert_eq!(run.state, PipelineState::Succeeded);
        assert!(run.result("reader").unwrap().succeeded());
        assert!(!root.path().join("intermediate.o").exists());
    }

    #[tokio::test]
    async fn test_unpreparable_context_fails_job() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let not_a_dir = logs.path().join("logs");
        std::fs::write(&not_a_dir, "file").unwrap();
        let exec = Arc::new(ScriptedExecutor::default());

        let run = runner(exec.clone(), &not_a_dir)
            .run(
                vec![JobSpec::new("unit", "check", ["ok"])],
                workspace(root.path()),
                &Trigger::push("master", "abc"),
            )
            .await;

        assert_eq!(run.state, PipelineState::Failed);
        assert!(matches!(
            run.result("unit").unwrap().outcome,
            JobOutcome::Failed(JobError::Spawn(_))
        ));
        assert!(exec.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_and_skips_rest() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::default());
        let (tx, rx) = watch::channel(false);

        let handle = {
            let runner = runner(exec, logs.path()).with_cancellation(rx);
            let ws = workspace(root.path());
            tokio::spawn(async move {
                runner
                    .run(
                        vec![
                            JobSpec::new("long", "check", ["sleep:10000"]),
                            JobSpec::new("release", "build", ["ok"]),
                        ],
                        ws,
                        &Trigger::push("master", "abc"),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let run = handle.await.unwrap();

        assert_eq!(run.state, PipelineState::Cancelled);
        assert_eq!(run.result("long").unwrap().outcome, JobOutcome::Cancelled);
        assert_eq!(run.stage("build").unwrap().state, StageState::Skipped);
    }
}
