//! End-to-end pipeline orchestration.
//!
//! classify → sync → select → run stages. Artifacts are published inside each
//! successful job while its working directory still exists.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use keel_core::obs;
use keel_core::{
    AssetStore, ConfigError, GitCli, GitLfs, NoAssets, PipelineState, Trigger, VcsBackend,
    Workspace,
};

use crate::classify::TriggerClassifier;
use crate::config::PipelineDefinition;
use crate::context::InvocationContext;
use crate::executor::{CommandExecutor, ShellExecutor};
use crate::publish::{ArchiveSink, ArtifactPublisher, DirectoryArchive};
use crate::select::{Excluded, JobSelector};
use crate::stage::{RunnerConfig, StageRun, StageRunner};
use crate::sync::{SyncConfig, SyncReport, WorkspaceSynchronizer};

/// External collaborators a pipeline drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub vcs: Arc<dyn VcsBackend>,
    pub assets: Arc<dyn AssetStore>,
    pub executor: Arc<dyn CommandExecutor>,
    pub archive: Arc<dyn ArchiveSink>,
}

impl PipelineDeps {
    /// `git`, `git lfs` (when enabled), `sh` and a directory archive.
    pub fn production(definition: &PipelineDefinition) -> Self {
        let settings = &definition.workspace;
        let assets: Arc<dyn AssetStore> = if settings.assets {
            Arc::new(GitLfs::default())
        } else {
            Arc::new(NoAssets)
        };
        Self {
            vcs: Arc::new(GitCli::default()),
            assets,
            executor: Arc::new(ShellExecutor::new()),
            archive: Arc::new(DirectoryArchive::new(settings.artifact_dir.clone())),
        }
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Sync succeeded and the stages ran (possibly failing).
    Completed {
        workspace: Workspace,
        excluded: Vec<Excluded>,
        run: StageRun,
    },
    /// Sync failed; no job ran.
    Aborted { error: String },
}

/// Full record of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub pipeline_id: Uuid,
    pub definition_digest: String,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sync: Option<SyncReport>,
    #[serde(flatten)]
    pub outcome: PipelineOutcome,
}

impl PipelineReport {
    /// Final stage-runner state; `None` when the run aborted during sync.
    pub fn state(&self) -> Option<PipelineState> {
        match &self.outcome {
            PipelineOutcome::Completed { run, .. } => Some(run.state),
            PipelineOutcome::Aborted { .. } => None,
        }
    }

    pub fn stage_run(&self) -> Option<&StageRun> {
        match &self.outcome {
            PipelineOutcome::Completed { run, .. } => Some(run),
            PipelineOutcome::Aborted { .. } => None,
        }
    }

    /// Whether the run should be reported as failed (non-zero exit).
    pub fn is_failure(&self) -> bool {
        self.state().map_or(true, PipelineState::is_failure)
    }
}

/// A pipeline definition bound to its collaborators.
pub struct Pipeline {
    definition: PipelineDefinition,
    synchronizer: WorkspaceSynchronizer,
    executor: Arc<dyn CommandExecutor>,
    publisher: Arc<ArtifactPublisher>,
}

impl Pipeline {
    /// Fails when the definition names no remote to synchronize from.
    pub fn new(definition: PipelineDefinition, deps: PipelineDeps) -> Result<Self, ConfigError> {
        let mut sync_config = SyncConfig::new(definition.workspace.require_remote()?);
        if let Some(template) = &definition.workspace.merge_source_url {
            sync_config = sync_config.with_merge_source_url(template.clone());
        }

        Ok(Self {
            synchronizer: WorkspaceSynchronizer::new(deps.vcs, deps.assets, sync_config),
            executor: deps.executor,
            publisher: Arc::new(ArtifactPublisher::new(deps.archive)),
            definition,
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Run the whole pipeline for `context` against `workspace`.
    ///
    /// Never returns an error: sync failures become
    /// [`PipelineOutcome::Aborted`] and job failures live in the stage reports.
    pub async fn execute(
        &self,
        context: &InvocationContext,
        workspace: Workspace,
        cancel: Option<watch::Receiver<bool>>,
    ) -> PipelineReport {
        let pipeline_id = Uuid::new_v4();
        let trigger = TriggerClassifier::classify(context);
        let span = obs::pipeline_span(&pipeline_id.to_string(), trigger.commit_id());

        self.execute_classified(pipeline_id, trigger, context, workspace, cancel)
            .instrument(span)
            .await
    }

    async fn execute_classified(
        &self,
        pipeline_id: Uuid,
        trigger: Trigger,
        context: &InvocationContext,
        workspace: Workspace,
        cancel: Option<watch::Receiver<bool>>,
    ) -> PipelineReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut report = PipelineReport {
            pipeline_id,
            definition_digest: self.definition.digest(),
            trigger: trigger.clone(),
            started_at,
            duration_ms: 0,
            sync: None,
            outcome: PipelineOutcome::Aborted {
                error: String::new(),
            },
        };

        let synced = match self.synchronizer.sync(workspace, &trigger).await {
            Ok(synced) => synced,
            Err(e) => {
                obs::emit_pipeline_aborted(&e);
                report.outcome = PipelineOutcome::Aborted {
                    error: e.to_string(),
                };
                report.duration_ms = start.elapsed().as_millis() as u64;
                return report;
            }
        };
        report.sync = Some(synced.report);

        let selection = JobSelector::select(&self.definition.graph, &trigger);
        obs::emit_pipeline_started(&trigger.kind(), trigger.branch_ref(), selection.jobs().len());
        let excluded = selection.excluded().to_vec();

        let settings = &self.definition.workspace;
        let mut runner = StageRunner::new(
            Arc::clone(&self.executor),
            RunnerConfig {
                max_parallel: settings.max_parallel,
                isolation: settings.isolation,
                log_dir: settings.log_dir.clone(),
            },
        )
        .with_activations(context.manual_jobs.iter().cloned())
        .with_publisher(Arc::clone(&self.publisher));
        if let Some(cancel) = cancel {
            runner = runner.with_cancellation(cancel);
        }

        let workspace = Arc::new(synced.workspace);
        let run = runner
            .run(selection.into_jobs(), Arc::clone(&workspace), &trigger)
            .await;

        report.duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_pipeline_finished(run.state, report.duration_ms);
        report.outcome = PipelineOutcome::Completed {
            workspace: Arc::try_unwrap(workspace).unwrap_or_else(|ws| (*ws).clone()),
            excluded,
            run,
        };
        report
    }

    /// Synchronize only, without selecting or running jobs.
    pub async fn sync_only(
        &self,
        context: &InvocationContext,
        workspace: Workspace,
    ) -> keel_core::SyncResult<crate::sync::SyncOutcome> {
        let trigger = TriggerClassifier::classify(context);
        self.synchronizer.sync(workspace, &trigger).await
    }
}
