//! Keel Core Library
//!
//! Domain model, error taxonomy and external collaborators shared by the
//! Keel pipeline crates.

pub mod assets;
pub mod domain;
pub mod fakes;
pub mod git;
pub mod obs;
pub mod telemetry;

pub use domain::{
    Condition, ConfigError, HumanDuration, JobError, JobOutcome, JobSpec, PipelineState,
    PublishError, RunMode, RunResult, ScheduleRule, ScriptStep, SkipReason, StageGraph,
    StageReport, StageState, SyncError, SyncResult, Trigger, TriggerKind, Workspace, NIGHTLY_TAG,
};

pub use assets::{AssetStore, GitLfs, NoAssets};
pub use git::{GitCli, MergeIdentity, VcsBackend};
pub use telemetry::init_tracing;
