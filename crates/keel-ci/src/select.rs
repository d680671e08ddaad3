//! Job selection: which jobs of the static graph run for a trigger.

use std::fmt;

use serde::Serialize;

use keel_core::obs;
use keel_core::{JobSpec, ScheduleRule, StageGraph, Trigger, TriggerKind};

/// Why a job was left out of a selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    /// The job excludes scheduled triggers and this trigger is scheduled.
    ScheduledExcluded,
    /// The job runs only on scheduled triggers.
    ScheduledOnly,
    /// A nightly job that is not restricted to scheduled triggers.
    NightlyRequiresSchedule,
    /// The job is restricted to other branches.
    BranchMismatch { branch: String },
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::ScheduledExcluded => f.write_str("excluded on scheduled triggers"),
            ExclusionReason::ScheduledOnly => f.write_str("runs only on scheduled triggers"),
            ExclusionReason::NightlyRequiresSchedule => {
                f.write_str("nightly job is not restricted to scheduled triggers")
            }
            ExclusionReason::BranchMismatch { branch } => {
                write!(f, "not restricted to branch {branch:?}")
            }
        }
    }
}

/// A job left out of a selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Excluded {
    pub job: String,
    #[serde(flatten)]
    pub reason: ExclusionReason,
}

/// Ordered result of a selection.
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    jobs: Vec<JobSpec>,
    excluded: Vec<Excluded>,
}

impl Selection {
    /// Selected jobs: stage order first, then declaration order.
    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    pub fn excluded(&self) -> &[Excluded] {
        &self.excluded
    }

    pub fn into_jobs(self) -> Vec<JobSpec> {
        self.jobs
    }

    pub fn names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }
}

/// Filters a stage graph against a trigger.
pub struct JobSelector;

impl JobSelector {
    /// Select the jobs of `graph` that apply to `trigger`.
    ///
    /// Manual jobs are kept; the stage runner decides whether they execute.
    pub fn select(graph: &StageGraph, trigger: &Trigger) -> Selection {
        let mut jobs = Vec::new();
        let mut excluded = Vec::new();

        for job in graph.jobs() {
            match Self::admits(job, trigger) {
                Ok(()) => jobs.push(job.clone()),
                Err(reason) => {
                    obs::emit_job_excluded(&job.name, &reason);
                    excluded.push(Excluded {
                        job: job.name.clone(),
                        reason,
                    });
                }
            }
        }

        // Stable sort keeps declaration order within a stage.
        jobs.sort_by_key(|job| graph.stage_index(&job.stage).unwrap_or(usize::MAX));

        Selection { jobs, excluded }
    }

    /// Apply the filtering rules to a single job, in order.
    pub fn admits(job: &JobSpec, trigger: &Trigger) -> Result<(), ExclusionReason> {
        let scheduled = trigger.kind() == TriggerKind::Scheduled;
        let rule = job.condition.schedules;

        if scheduled && rule == ScheduleRule::Exclude {
            return Err(ExclusionReason::ScheduledExcluded);
        }

        if rule == ScheduleRule::Only && !scheduled {
            return Err(ExclusionReason::ScheduledOnly);
        }
        if scheduled && job.is_nightly() && rule != ScheduleRule::Only {
            return Err(ExclusionReason::NightlyRequiresSchedule);
        }

        let branches = &job.condition.branches;
        if !branches.is_empty() && !branches.iter().any(|b| b == trigger.branch_ref()) {
            return Err(ExclusionReason::BranchMismatch {
                branch: trigger.branch_ref().to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Condition, RunMode, NIGHTLY_TAG};

    fn graph() -> StageGraph {
        StageGraph::new(
            vec![
                "optional-builds".into(),
                "check-compile".into(),
                "post-build".into(),
            ],
            vec![
                JobSpec::new("linux", "post-build", ["cargo build --release"])
                    .with_condition(Condition::except_scheduled().on_branches(["master"])),
                JobSpec::new("unittests", "check-compile", ["cargo test"])
                    .with_condition(Condition::except_scheduled()),
                JobSpec::new("benchmarks", "check-compile", ["cargo bench"])
                    .with_tag(NIGHTLY_TAG)
                    .with_condition(Condition::scheduled_only()),
                JobSpec::new("clippy", "check-compile", ["cargo clippy"]),
                JobSpec::new("macos", "optional-builds", ["cargo build"])
                    .with_run_mode(RunMode::Manual),
            ],
        )
        .unwrap()
    }

    fn scheduled() -> Trigger {
        Trigger::new(TriggerKind::Scheduled, "master", "abc", None, None)
    }

    #[test]
    fn test_push_master_ordering() {
        let selection = JobSelector::select(&graph(), &Trigger::push("master", "abc"));
        assert_eq!(
            selection.names(),
            vec!["macos", "unittests", "clippy", "linux"]
        );
        assert_eq!(selection.excluded().len(), 1);
        assert_eq!(selection.excluded()[0].job, "benchmarks");
        assert_eq!(selection.excluded()[0].reason, ExclusionReason::ScheduledOnly);
    }

    #[test]
    fn test_feature_branch_drops_master_only_job() {
        let selection = JobSelector::select(&graph(), &Trigger::push("feature-x", "abc"));
        assert!(!selection.names().contains(&"linux"));
        assert!(selection.excluded().iter().any(|e| e.job == "linux"
            && e.reason
                == ExclusionReason::BranchMismatch {
                    branch: "feature-x".to_string()
                }));
    }

    #[test]
    fn test_scheduled_selects_nightly_and_skips_excluded() {
        let selection = JobSelector::select(&graph(), &scheduled());
        assert_eq!(selection.names(), vec!["macos", "benchmarks", "clippy"]);
    }

    #[test]
    fn test_nightly_without_schedule_rule_excluded_on_schedule() {
        let job = JobSpec::new("fuzz", "post-build", ["cargo fuzz"]).with_tag(NIGHTLY_TAG);
        assert_eq!(
            JobSelector::admits(&job, &scheduled()),
            Err(ExclusionReason::NightlyRequiresSchedule)
        );
        assert_eq!(JobSelector::admits(&job, &Trigger::push("master", "abc")), Ok(()));
    }

    #[test]
    fn test_manual_jobs_are_selectable() {
        let selection = JobSelector::select(&graph(), &Trigger::push("feature-x", "abc"));
        let macos = selection.jobs().iter().find(|j| j.name == "macos").unwrap();
        assert_eq!(macos.run_mode, RunMode::Manual);
    }
}
