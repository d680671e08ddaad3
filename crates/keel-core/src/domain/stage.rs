//! Ordered stages and the jobs declared against them.

use std::collections::HashSet;

use serde::Serialize;

use crate::domain::error::ConfigError;
use crate::domain::job::JobSpec;

/// A validated stage/job graph.
///
/// Stage order is total and every job references exactly one declared stage.
/// Jobs keep their declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct StageGraph {
    stages: Vec<String>,
    jobs: Vec<JobSpec>,
}

impl StageGraph {
    pub fn new(stages: Vec<String>, jobs: Vec<JobSpec>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptyStages);
        }

        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.as_str()) {
                return Err(ConfigError::DuplicateStage(stage.clone()));
            }
        }

        let mut names = HashSet::new();
        for job in &jobs {
            if !names.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
            if !seen.contains(job.stage.as_str()) {
                return Err(ConfigError::UnknownStage {
                    job: job.name.clone(),
                    stage: job.stage.clone(),
                });
            }
        }

        Ok(Self { stages, jobs })
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    /// Position of `stage` in the total order.
    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }
}
