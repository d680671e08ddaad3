//! Incremental workspace synchronization.
//!
//! Brings the persistent checkout to the trigger's commit without wiping and
//! recloning it. The synchronizer takes the [`Workspace`] by value, so it is
//! the only mutator for the duration of a sync.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use keel_core::obs;
use keel_core::{AssetStore, SyncError, SyncResult, Trigger, VcsBackend, Workspace};

/// Placeholder replaced by the source project in `merge_source_url`.
pub const PROJECT_PLACEHOLDER: &str = "{project}";

/// Static synchronization settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Canonical remote, re-applied on every sync.
    pub remote_url: String,
    /// URL template for merge-pipeline sources, e.g. `https://host/{project}.git`.
    /// When unset the source project is used as the URL directly.
    pub merge_source_url: Option<String>,
}

impl SyncConfig {
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            remote_url: remote_url.into(),
            merge_source_url: None,
        }
    }

    pub fn with_merge_source_url(mut self, template: impl Into<String>) -> Self {
        self.merge_source_url = Some(template.into());
        self
    }

    /// Resolve the fetch URL for a merge-pipeline source project.
    pub fn source_url(&self, project: &str) -> String {
        match &self.merge_source_url {
            Some(template) => template.replace(PROJECT_PLACEHOLDER, project),
            None => project.to_string(),
        }
    }
}

/// One step the synchronizer performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum SyncStep {
    ColdClone,
    ReuseExisting,
    ClearLocks { removed: usize },
    SetRemote,
    Fetch,
    Checkout { commit: String },
    Integrate { project: String, branch: String },
    Assets,
}

impl SyncStep {
    fn label(&self) -> &'static str {
        match self {
            SyncStep::ColdClone => "cold_clone",
            SyncStep::ReuseExisting => "reuse_existing",
            SyncStep::ClearLocks { .. } => "clear_locks",
            SyncStep::SetRemote => "set_remote",
            SyncStep::Fetch => "fetch",
            SyncStep::Checkout { .. } => "checkout",
            SyncStep::Integrate { .. } => "integrate",
            SyncStep::Assets => "assets",
        }
    }
}

/// What a sync did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub steps: Vec<SyncStep>,
    pub removed_locks: Vec<PathBuf>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn cloned(&self) -> bool {
        self.steps.contains(&SyncStep::ColdClone)
    }

    pub fn integrated(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, SyncStep::Integrate { .. }))
    }

    fn record(&mut self, step: SyncStep) {
        obs::emit_sync_step(step.label());
        self.steps.push(step);
    }
}

/// A synchronized workspace and the report of how it got there.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub workspace: Workspace,
    pub report: SyncReport,
}

/// Brings a persistent workspace up to date with a trigger's commit.
pub struct WorkspaceSynchronizer {
    vcs: Arc<dyn VcsBackend>,
    assets: Arc<dyn AssetStore>,
    config: SyncConfig,
}

impl WorkspaceSynchronizer {
    pub fn new(
        vcs: Arc<dyn VcsBackend>,
        assets: Arc<dyn AssetStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            vcs,
            assets,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Synchronize `workspace` to `trigger`'s commit.
    ///
    /// Any failing step aborts the sync; the returned error carries the step
    /// that failed and no partially synced workspace is handed back.
    pub async fn sync(&self, mut workspace: Workspace, trigger: &Trigger) -> SyncResult<SyncOutcome> {
        let start = Instant::now();
        let mut report = SyncReport::default();
        let remote = self.config.remote_url.as_str();
        let root = workspace.root.clone();

        tokio::fs::create_dir_all(&root).await?;
        workspace.refresh()?;
        obs::emit_sync_started(&root, trigger.commit_id(), !workspace.has_git_dir);

        // Existing metadata is reused as-is: no clean, no reclone.
        if workspace.has_git_dir {
            report.record(SyncStep::ReuseExisting);
        } else {
            self.vcs.clone_repo(remote, &root).await?;
            report.record(SyncStep::ColdClone);
            workspace.refresh()?;
        }

        // Locks go before fetch; a leftover lock fails the fetch.
        let removed = clear_stale_locks(&mut workspace)?;
        report.record(SyncStep::ClearLocks {
            removed: removed.len(),
        });
        report.removed_locks = removed;

        self.vcs.set_remote_url(&root, remote).await?;
        report.record(SyncStep::SetRemote);

        self.vcs.fetch_all_prune(&root).await?;
        report.record(SyncStep::Fetch);

        self.vcs.checkout_force(&root, trigger.commit_id()).await?;
        report.record(SyncStep::Checkout {
            commit: trigger.commit_id().to_string(),
        });
        let head = self.vcs.head_commit(&root).await?;
        let resolved = resolve_commit(trigger.commit_id(), head)?;

        let mut integrated_head = None;
        if let Some((project, branch)) = trigger.merge_source() {
            let url = self.config.source_url(project);
            self.vcs.integrate(&root, project, &url, branch).await?;
            report.record(SyncStep::Integrate {
                project: project.to_string(),
                branch: branch.to_string(),
            });
            integrated_head = Some(self.vcs.head_commit(&root).await?);
        }

        self.assets.pull(&root).await?;
        report.record(SyncStep::Assets);

        workspace.current_commit = Some(resolved);
        workspace.integrated_head = integrated_head;
        workspace.refresh()?;

        report.duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_sync_finished(
            workspace.current_commit.as_deref().unwrap_or_default(),
            report.duration_ms,
            report.integrated(),
        );

        Ok(SyncOutcome { workspace, report })
    }
}

/// Delete every stale lock currently recorded on `workspace`.
fn clear_stale_locks(workspace: &mut Workspace) -> SyncResult<Vec<PathBuf>> {
    workspace.refresh()?;
    let mut removed = Vec::new();
    for path in std::mem::take(&mut workspace.lock_files) {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            // Another cleanup got there first.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(SyncError::LockCleanupFailed { path, source }),
        }
        obs::emit_lock_removed(&path);
        removed.push(path);
    }
    Ok(removed)
}

/// The commit the workspace now sits on.
///
/// Hex ids (full or abbreviated) must match HEAD; symbolic names such as
/// `origin/master` resolve to whatever HEAD is after checkout.
fn resolve_commit(requested: &str, head: String) -> SyncResult<String> {
    let is_hex = requested.len() >= 4 && requested.chars().all(|c| c.is_ascii_hexdigit());
    if !is_hex {
        return Ok(head);
    }
    if head.to_ascii_lowercase().starts_with(&requested.to_ascii_lowercase()) {
        Ok(requested.to_string())
    } else {
        Err(SyncError::CommitMismatch {
            expected: requested.to_string(),
            actual: head,
        })
    }
}
