//! Invocation context supplied by the host CI environment.
//!
//! Every value is untrusted free-form text: it is trimmed and blank values
//! are treated as absent.

use serde::{Deserialize, Serialize};

use keel_core::domain::trigger::non_blank;

pub const ENV_PIPELINE_SOURCE: &str = "CI_PIPELINE_SOURCE";
pub const ENV_BRANCH_REF: &str = "CI_COMMIT_REF_NAME";
pub const ENV_COMMIT_ID: &str = "CI_COMMIT_SHA";
pub const ENV_SOURCE_PROJECT: &str = "CI_MERGE_REQUEST_SOURCE_PROJECT_PATH";
pub const ENV_SOURCE_BRANCH: &str = "CI_MERGE_REQUEST_SOURCE_BRANCH_NAME";
pub const ENV_MANUAL_JOBS: &str = "KEEL_MANUAL_JOBS";

/// Raw signals describing how a pipeline was invoked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub pipeline_source: Option<String>,
    pub branch_ref: Option<String>,
    pub commit_id: Option<String>,
    pub source_project: Option<String>,
    pub source_branch: Option<String>,
    /// Manual jobs a human asked to run.
    #[serde(default)]
    pub manual_jobs: Vec<String>,
}

impl InvocationContext {
    /// Read the context from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Read the context from `(name, value)` pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut ctx = Self::default();
        for (key, value) in vars {
            let value = non_blank(Some(value.into()));
            match key.as_ref() {
                ENV_PIPELINE_SOURCE => ctx.pipeline_source = value,
                ENV_BRANCH_REF => ctx.branch_ref = value,
                ENV_COMMIT_ID => ctx.commit_id = value,
                ENV_SOURCE_PROJECT => ctx.source_project = value,
                ENV_SOURCE_BRANCH => ctx.source_branch = value,
                ENV_MANUAL_JOBS => {
                    ctx.manual_jobs = value
                        .map(|v| parse_job_list(&v))
                        .unwrap_or_default();
                }
                _ => {}
            }
        }
        ctx
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.pipeline_source = non_blank(Some(source.into()));
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_ref = non_blank(Some(branch.into()));
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit_id = non_blank(Some(commit.into()));
        self
    }

    pub fn with_merge_source(
        mut self,
        project: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        self.source_project = non_blank(Some(project.into()));
        self.source_branch = non_blank(Some(branch.into()));
        self
    }

    pub fn with_manual_job(mut self, job: impl Into<String>) -> Self {
        if let Some(job) = non_blank(Some(job.into())) {
            self.manual_jobs.push(job);
        }
        self
    }
}

/// Split a comma-separated job list, dropping blanks.
pub fn parse_job_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|s| non_blank(Some(s.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_reads_known_keys() {
        let ctx = InvocationContext::from_vars([
            (ENV_PIPELINE_SOURCE, "push"),
            (ENV_BRANCH_REF, " master "),
            (ENV_COMMIT_ID, "abc123"),
            (ENV_SOURCE_PROJECT, " "),
            (ENV_MANUAL_JOBS, "linux, ,windows"),
            ("HOME", "/root"),
        ]);

        assert_eq!(ctx.pipeline_source.as_deref(), Some("push"));
        assert_eq!(ctx.branch_ref.as_deref(), Some("master"));
        assert_eq!(ctx.commit_id.as_deref(), Some("abc123"));
        assert_eq!(ctx.source_project, None);
        assert_eq!(ctx.manual_jobs, vec!["linux".to_string(), "windows".to_string()]);
    }

    #[test]
    fn test_builder_normalizes_blank() {
        let ctx = InvocationContext::default()
            .with_merge_source("", "  ")
            .with_manual_job(" ");
        assert_eq!(ctx.source_project, None);
        assert_eq!(ctx.source_branch, None);
        assert!(ctx.manual_jobs.is_empty());
    }
}
