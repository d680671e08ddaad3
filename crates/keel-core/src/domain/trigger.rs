//! Classified reason a pipeline run started.

use serde::{Deserialize, Serialize};

/// Why the pipeline was started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Human-initiated request.
    Manual,
    /// Timer-driven (nightly) run.
    Scheduled,
    /// Branch push; also the fallback for unknown contexts.
    Push,
    /// Validation of a proposed integration from an external source branch.
    MergePipeline,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Push => "push",
            TriggerKind::MergePipeline => "merge_pipeline",
        };
        f.write_str(s)
    }
}

/// An immutable trigger descriptor.
///
/// Fields are private so a `Trigger` can only be built through [`Trigger::new`],
/// which normalizes blank merge-source strings to `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trigger {
    kind: TriggerKind,
    branch_ref: String,
    commit_id: String,
    source_project: Option<String>,
    source_branch: Option<String>,
}

impl Trigger {
    /// Build a trigger. Blank or whitespace-only source fields become `None`.
    pub fn new(
        kind: TriggerKind,
        branch_ref: impl Into<String>,
        commit_id: impl Into<String>,
        source_project: Option<String>,
        source_branch: Option<String>,
    ) -> Self {
        Self {
            kind,
            branch_ref: branch_ref.into().trim().to_string(),
            commit_id: commit_id.into().trim().to_string(),
            source_project: non_blank(source_project),
            source_branch: non_blank(source_branch),
        }
    }

    /// Shorthand for a push trigger.
    pub fn push(branch_ref: impl Into<String>, commit_id: impl Into<String>) -> Self {
        Self::new(TriggerKind::Push, branch_ref, commit_id, None, None)
    }

    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    pub fn branch_ref(&self) -> &str {
        &self.branch_ref
    }

    pub fn commit_id(&self) -> &str {
        &self.commit_id
    }

    pub fn source_project(&self) -> Option<&str> {
        self.source_project.as_deref()
    }

    pub fn source_branch(&self) -> Option<&str> {
        self.source_branch.as_deref()
    }

    /// The source project and branch to integrate, when both are present.
    pub fn merge_source(&self) -> Option<(&str, &str)> {
        match (self.source_project(), self.source_branch()) {
            (Some(project), Some(branch)) => Some((project, branch)),
            _ => None,
        }
    }

    /// True when an integration merge must be applied on top of the checkout.
    pub fn is_merge_pipeline(&self) -> bool {
        self.merge_source().is_some()
    }

    /// First 8 characters of the commit id.
    pub fn short_commit(&self) -> &str {
        let end = self
            .commit_id
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.commit_id.len());
        &self.commit_id[..end]
    }
}

/// Trim a free-form value and drop it when nothing is left.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
