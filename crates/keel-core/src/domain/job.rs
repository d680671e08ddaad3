//! Job specifications.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::duration::HumanDuration;

/// Tag marking a job as part of the scheduled (nightly) set.
pub const NIGHTLY_TAG: &str = "nightly";

/// How a selected job is dispatched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Runs automatically; failure fails the stage.
    #[default]
    Always,
    /// Selectable, but only runs after an explicit activation.
    Manual,
    /// Runs automatically; failure is recorded as a warning.
    OnFailureAllowed,
}

impl RunMode {
    pub fn is_tolerant(self) -> bool {
        matches!(self, RunMode::OnFailureAllowed)
    }
}

/// How a job relates to scheduled triggers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRule {
    /// No restriction.
    #[default]
    Any,
    /// Never runs on scheduled triggers.
    Exclude,
    /// Runs only on scheduled triggers.
    Only,
}

/// Predicate over a trigger, evaluated by the job selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(default)]
    pub schedules: ScheduleRule,

    /// Branches the job is restricted to. Empty means any branch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
}

impl Condition {
    pub fn scheduled_only() -> Self {
        Self {
            schedules: ScheduleRule::Only,
            ..Self::default()
        }
    }

    pub fn except_scheduled() -> Self {
        Self {
            schedules: ScheduleRule::Exclude,
            ..Self::default()
        }
    }

    pub fn on_branches<I, S>(mut self, branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branches = branches.into_iter().map(Into::into).collect();
        self
    }
}

/// One opaque shell-level command. The core never inspects its contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ScriptStep(String);

impl ScriptStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self(command.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScriptStep {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Static description of a pipeline job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub stage: String,

    /// Container image hint passed through to the executor environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub condition: Condition,

    #[serde(default)]
    pub run_mode: RunMode,

    pub script: Vec<ScriptStep>,

    #[serde(default)]
    pub artifact_paths: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<HumanDuration>,

    /// Maximum wall-clock time for the whole script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<HumanDuration>,

    /// Extra environment variables for this job only.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl JobSpec {
    /// Create a job with the given script and default settings.
    pub fn new<I, S>(name: impl Into<String>, stage: impl Into<String>, script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            stage: stage.into(),
            image: None,
            tags: BTreeSet::new(),
            condition: Condition::default(),
            run_mode: RunMode::default(),
            script: script.into_iter().map(|s| ScriptStep::new(s)).collect(),
            artifact_paths: Vec::new(),
            retention: None,
            timeout: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_artifacts<I, S>(mut self, paths: I, retention: HumanDuration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifact_paths = paths.into_iter().map(Into::into).collect();
        self.retention = Some(retention);
        self
    }

    pub fn with_timeout(mut self, timeout: HumanDuration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_nightly(&self) -> bool {
        self.tags.contains(NIGHTLY_TAG)
    }

    pub fn is_tolerant(&self) -> bool {
        self.run_mode.is_tolerant()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_builder() {
        let job = JobSpec::new("benchmarks", "post-build", ["cargo bench"])
            .with_tag(NIGHTLY_TAG)
            .with_condition(Condition::scheduled_only())
            .with_run_mode(RunMode::OnFailureAllowed);

        assert!(job.is_nightly());
        assert!(job.is_tolerant());
        assert_eq!(job.condition.schedules, ScheduleRule::Only);
        assert_eq!(job.script[0].as_str(), "cargo bench");
    }

    #[test]
    fn test_condition_on_branches() {
        let cond = Condition::except_scheduled().on_branches(["master"]);
        assert_eq!(cond.schedules, ScheduleRule::Exclude);
        assert_eq!(cond.branches, vec!["master".to_string()]);
    }

    #[test]
    fn test_run_mode_serde() {
        let mode: RunMode = serde_json::from_str("\"on-failure-allowed\"").unwrap();
        assert_eq!(mode, RunMode::OnFailureAllowed);
        assert!(!RunMode::Manual.is_tolerant());
    }
}
