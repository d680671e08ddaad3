//! Keel CI - pipeline orchestration core
//!
//! Provides the five pipeline phases and the orchestrator that chains them:
//! - `TriggerClassifier`: maps the invocation context onto a trigger
//! - `WorkspaceSynchronizer`: brings the persistent checkout to the trigger's commit
//! - `JobSelector`: filters the static stage graph for the trigger
//! - `StageRunner`: runs selected jobs stage by stage with per-job isolation
//! - `ArtifactPublisher`: archives declared outputs of successful jobs

pub mod classify;
pub mod config;
pub mod context;
pub mod executor;
pub mod pipeline;
pub mod publish;
pub mod select;
pub mod stage;
pub mod sync;

// Re-export key types
pub use classify::TriggerClassifier;
pub use config::{PipelineDefinition, WorkspaceSettings, DEFAULT_CONFIG_FILE, STARTER_TEMPLATE};
pub use context::InvocationContext;
pub use executor::{CommandExecutor, Isolation, JobContext, ShellExecutor};
pub use pipeline::{Pipeline, PipelineDeps, PipelineOutcome, PipelineReport};
pub use publish::{
    ArchiveLocation, ArchiveSink, ArtifactPublisher, DirectoryArchive, PublishFailure,
    PublishedArtifact,
};
pub use select::{Excluded, ExclusionReason, JobSelector, Selection};
pub use stage::{RunnerConfig, StageRun, StageRunner};
pub use sync::{SyncConfig, SyncOutcome, SyncReport, SyncStep, WorkspaceSynchronizer};
