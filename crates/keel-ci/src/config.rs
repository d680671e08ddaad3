//! Pipeline definition files (`keel.toml`).
//!
//! The file is parsed into raw serde structs first and then validated into a
//! [`StageGraph`], so every structural error surfaces as a [`ConfigError`]
//! before anything touches the workspace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use keel_core::domain::digest::sha256_hex;
use keel_core::{Condition, ConfigError, HumanDuration, JobSpec, RunMode, ScheduleRule, StageGraph};

use crate::executor::Isolation;

/// Starter definition written by `keel init`.
pub const STARTER_TEMPLATE: &str = include_str!("../templates/keel.toml");

/// Default definition file name.
pub const DEFAULT_CONFIG_FILE: &str = "keel.toml";

/// `[workspace]` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceSettings {
    /// Persistent checkout reused across runs.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub remote_url: Option<String>,
    /// Fetch URL template for merge-pipeline sources, `{project}` is substituted.
    #[serde(default)]
    pub merge_source_url: Option<String>,
    /// Pull large binary assets after checkout.
    #[serde(default)]
    pub assets: bool,
    #[serde(default)]
    pub isolation: Isolation,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_root() -> PathBuf {
    PathBuf::from(".keel/workspace")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(".keel/artifacts")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".keel/logs")
}

fn default_max_parallel() -> usize {
    4
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            remote_url: None,
            merge_source_url: None,
            assets: false,
            isolation: Isolation::default(),
            artifact_dir: default_artifact_dir(),
            log_dir: default_log_dir(),
            max_parallel: default_max_parallel(),
        }
    }
}

impl WorkspaceSettings {
    /// The canonical remote, required before anything can be synchronized.
    pub fn require_remote(&self) -> Result<&str, ConfigError> {
        self.remote_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ConfigError::Missing("workspace.remote_url".to_string()))
    }
}

/// A validated pipeline definition.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineDefinition {
    pub workspace: WorkspaceSettings,
    pub graph: StageGraph,
}

impl PipelineDefinition {
    /// Read and validate the definition at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse and validate a definition from TOML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawDefinition =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let jobs = raw
            .job
            .into_iter()
            .map(RawJob::into_spec)
            .collect::<Result<Vec<_>, _>>()?;
        let graph = StageGraph::new(raw.stages, jobs)?;

        Ok(Self {
            workspace: raw.workspace,
            graph,
        })
    }

    /// Deterministic digest of the stage order and job names.
    pub fn digest(&self) -> String {
        let mut buf = Vec::new();
        for stage in self.graph.stages() {
            buf.extend_from_slice(stage.as_bytes());
            buf.push(0);
        }
        buf.push(0);
        for job in self.graph.jobs() {
            buf.extend_from_slice(job.name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(job.stage.as_bytes());
            buf.push(0);
        }
        sha256_hex(&buf)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefinition {
    #[serde(default)]
    stages: Vec<String>,
    #[serde(default)]
    workspace: WorkspaceSettings,
    #[serde(default)]
    job: Vec<RawJob>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawJob {
    name: String,
    stage: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    when: RunMode,
    script: Vec<String>,
    #[serde(default)]
    artifacts: Option<RawArtifacts>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    only: RawOnly,
    #[serde(default)]
    except: RawExcept,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawArtifacts {
    paths: Vec<String>,
    #[serde(default)]
    expire_in: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOnly {
    #[serde(default)]
    branches: Vec<String>,
    #[serde(default)]
    schedules: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExcept {
    #[serde(default)]
    schedules: bool,
}

impl RawJob {
    fn into_spec(self) -> Result<JobSpec, ConfigError> {
        let schedules = match (self.only.schedules, self.except.schedules) {
            (true, true) => {
                return Err(ConfigError::Parse(format!(
                    "job {} sets both only.schedules and except.schedules",
                    self.name
                )))
            }
            (true, false) => ScheduleRule::Only,
            (false, true) => ScheduleRule::Exclude,
            (false, false) => ScheduleRule::Any,
        };

        let mut spec = JobSpec::new(self.name, self.stage, self.script)
            .with_run_mode(self.when)
            .with_condition(Condition {
                schedules,
                branches: self.only.branches,
            });
        spec.image = self.image;
        spec.variables = self.variables;
        for tag in self.tags {
            spec = spec.with_tag(tag);
        }
        if let Some(timeout) = self.timeout {
            spec = spec.with_timeout(timeout.parse::<HumanDuration>()?);
        }
        if let Some(artifacts) = self.artifacts {
            spec.artifact_paths = artifacts.paths;
            spec.retention = artifacts
                .expire_in
                .map(|d| d.parse::<HumanDuration>())
                .transpose()?;
        }
        Ok(spec)
    }
}
