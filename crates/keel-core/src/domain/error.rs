//! Domain-level error taxonomy for Keel.
//!
//! Each pipeline phase owns one error enum. Synchronization failures abort the
//! pipeline before any job runs, job failures become failed run results, and
//! publish failures only affect the artifact output of a single job.

use std::path::PathBuf;
use std::time::Duration;

/// Errors produced while bringing the persistent workspace up to date.
///
/// Every variant is fatal to the pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("cold clone of {remote} failed: {detail}")]
    ColdCloneFailed { remote: String, detail: String },

    #[error("failed to remove stale lock {path}: {source}")]
    LockCleanupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to repoint remote to {remote}: {detail}")]
    RemoteUpdateFailed { remote: String, detail: String },

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("checkout of {commit} failed: {detail}")]
    CheckoutFailed { commit: String, detail: String },

    #[error("HEAD resolved to {actual}, expected {expected}")]
    CommitMismatch { expected: String, actual: String },

    #[error("merge of {project}:{branch} did not apply cleanly: {detail}")]
    MergeConflict {
        project: String,
        branch: String,
        detail: String,
    },

    #[error("large asset fetch failed: {0}")]
    AssetFetchFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while executing a single job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("step exited with code {code}")]
    NonZeroExit { code: i32 },

    #[error("timed out after {}s", after.as_secs())]
    TimedOut { after: Duration },

    #[error("failed to spawn step: {0}")]
    Spawn(String),

    #[error("job task panicked: {0}")]
    Panicked(String),
}

/// Errors produced while packaging job artifacts.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("declared artifact path matched nothing: {pattern}")]
    MissingPath { pattern: String },

    #[error("invalid artifact pattern {pattern}: {detail}")]
    InvalidPattern { pattern: String, detail: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while loading or validating a pipeline definition.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("pipeline must declare at least one stage")]
    EmptyStages,

    #[error("stage declared twice: {0}")]
    DuplicateStage(String),

    #[error("job declared twice: {0}")]
    DuplicateJob(String),

    #[error("job {job} references unknown stage {stage}")]
    UnknownStage { job: String, stage: String },

    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("missing required setting: {0}")]
    Missing(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for workspace synchronization.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
