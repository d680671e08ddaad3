//! Trigger classification.

use keel_core::{Trigger, TriggerKind};

use crate::context::InvocationContext;

/// Pipeline sources that mean "started by a timer".
const SCHEDULED_SOURCES: &[&str] = &["schedule"];

/// Pipeline sources that mean "started by a human".
const MANUAL_SOURCES: &[&str] = &["web", "manual"];

/// Maps an invocation context onto a [`Trigger`].
pub struct TriggerClassifier;

impl TriggerClassifier {
    /// Classify `context`. Never fails; unknown contexts classify as `Push`.
    ///
    /// Precedence: Scheduled > MergePipeline > Manual > Push. A merge pipeline
    /// needs both source project and source branch to be non-blank.
    pub fn classify(context: &InvocationContext) -> Trigger {
        let source = context
            .pipeline_source
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase());
        let source_is = |set: &[&str]| source.as_deref().is_some_and(|s| set.contains(&s));

        let has_merge_source = context.source_project.as_deref().is_some_and(is_present)
            && context.source_branch.as_deref().is_some_and(is_present);

        let kind = if source_is(SCHEDULED_SOURCES) {
            TriggerKind::Scheduled
        } else if has_merge_source {
            TriggerKind::MergePipeline
        } else if source_is(MANUAL_SOURCES) || !context.manual_jobs.is_empty() {
            TriggerKind::Manual
        } else {
            TriggerKind::Push
        };

        let branch_ref = context.branch_ref.clone().unwrap_or_default();
        let commit_id = context
            .commit_id
            .clone()
            .unwrap_or_else(|| fallback_commit(&branch_ref));

        let (source_project, source_branch) = if kind == TriggerKind::MergePipeline {
            (context.source_project.clone(), context.source_branch.clone())
        } else {
            (None, None)
        };

        Trigger::new(kind, branch_ref, commit_id, source_project, source_branch)
    }
}

fn is_present(value: &str) -> bool {
    !value.trim().is_empty()
}

/// Best-effort commit when the context names none: the fetched branch tip, else HEAD.
fn fallback_commit(branch_ref: &str) -> String {
    if branch_ref.is_empty() {
        "HEAD".to_string()
    } else {
        format!("origin/{branch_ref}")
    }
}
