//! Domain models for Keel.
//!
//! Canonical definitions for the core entities:
//! - `Trigger`: Why a pipeline run started
//! - `JobSpec` / `StageGraph`: The static job and stage graph
//! - `Workspace`: The persistent checkout reused across runs
//! - `RunResult`: Per-job outcome collected by the stage runner

pub mod digest;
pub mod duration;
pub mod error;
pub mod job;
pub mod run;
pub mod stage;
pub mod trigger;
pub mod workspace;

// Re-export main types and errors
pub use duration::HumanDuration;
pub use error::{ConfigError, JobError, PublishError, SyncError, SyncResult};
pub use job::{Condition, JobSpec, RunMode, ScheduleRule, ScriptStep, NIGHTLY_TAG};
pub use run::{JobOutcome, PipelineState, RunResult, SkipReason, StageReport, StageState};
pub use stage::StageGraph;
pub use trigger::{Trigger, TriggerKind};
pub use workspace::Workspace;
