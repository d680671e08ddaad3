//! In-memory fakes for the sync collaborators (testing only)
//!
//! `RecordingVcs` and `RecordingAssets` satisfy the collaborator contracts
//! while recording every call, so tests can assert which operations a sync
//! issued without touching a real remote.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::assets::AssetStore;
use crate::domain::error::{SyncError, SyncResult};
use crate::domain::workspace::find_lock_files;
use crate::git::VcsBackend;

/// One recorded VCS call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsOp {
    Clone { remote: String },
    SetRemote { remote: String },
    Fetch { stale_locks: usize },
    Checkout { commit: String },
    Integrate { project: String, url: String, branch: String },
    Head,
}

#[derive(Debug, Default)]
struct VcsState {
    ops: Vec<VcsOp>,
    head: Option<String>,
    fail_fetch: bool,
    conflict: bool,
}

/// Fake [`VcsBackend`] that simulates a repository by creating `.git/`.
#[derive(Debug, Default)]
pub struct RecordingVcs {
    state: Mutex<VcsState>,
}

impl RecordingVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every fetch fail.
    pub fn failing_fetch(self) -> Self {
        self.state.lock().unwrap().fail_fetch = true;
        self
    }

    /// Make every integration merge conflict.
    pub fn conflicting(self) -> Self {
        self.state.lock().unwrap().conflict = true;
        self
    }

    pub fn ops(&self) -> Vec<VcsOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clone_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, VcsOp::Clone { .. }))
            .count()
    }

    pub fn integrate_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, VcsOp::Integrate { .. }))
            .count()
    }

    fn push(&self, op: VcsOp) {
        self.state.lock().unwrap().ops.push(op);
    }
}

#[async_trait]
impl VcsBackend for RecordingVcs {
    async fn clone_repo(&self, remote: &str, root: &Path) -> SyncResult<()> {
        std::fs::create_dir_all(root.join(".git").join("refs"))?;
        self.push(VcsOp::Clone {
            remote: remote.to_string(),
        });
        Ok(())
    }

    async fn set_remote_url(&self, _root: &Path, remote: &str) -> SyncResult<()> {
        self.push(VcsOp::SetRemote {
            remote: remote.to_string(),
        });
        Ok(())
    }

    async fn fetch_all_prune(&self, root: &Path) -> SyncResult<()> {
        let stale_locks = find_lock_files(&root.join(".git"))?.len();
        self.push(VcsOp::Fetch { stale_locks });
        if self.state.lock().unwrap().fail_fetch {
            return Err(SyncError::FetchFailed("simulated fetch failure".to_string()));
        }
        if stale_locks > 0 {
            return Err(SyncError::FetchFailed(
                "another git process seems to be running".to_string(),
            ));
        }
        Ok(())
    }

    async fn checkout_force(&self, _root: &Path, commit: &str) -> SyncResult<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(VcsOp::Checkout {
            commit: commit.to_string(),
        });
        state.head = Some(commit.to_string());
        Ok(())
    }

    async fn integrate(
        &self,
        _root: &Path,
        project: &str,
        url: &str,
        branch: &str,
    ) -> SyncResult<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(VcsOp::Integrate {
            project: project.to_string(),
            url: url.to_string(),
            branch: branch.to_string(),
        });
        if state.conflict {
            return Err(SyncError::MergeConflict {
                project: project.to_string(),
                branch: branch.to_string(),
                detail: "simulated conflict".to_string(),
            });
        }
        state.head = Some(format!("merge-of-{branch}"));
        Ok(())
    }

    async fn head_commit(&self, _root: &Path) -> SyncResult<String> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(VcsOp::Head);
        state.head.clone().ok_or_else(|| SyncError::CheckoutFailed {
            commit: "HEAD".to_string(),
            detail: "no commit checked out".to_string(),
        })
    }
}

/// Fake [`AssetStore`] that counts pulls.
#[derive(Debug, Default)]
pub struct RecordingAssets {
    pulls: Mutex<usize>,
    fail: bool,
}

impl RecordingAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            pulls: Mutex::new(0),
            fail: true,
        }
    }

    pub fn pulls(&self) -> usize {
        *self.pulls.lock().unwrap()
    }
}

#[async_trait]
impl AssetStore for RecordingAssets {
    async fn pull(&self, _root: &Path) -> SyncResult<()> {
        *self.pulls.lock().unwrap() += 1;
        if self.fail {
            return Err(SyncError::AssetFetchFailed("simulated asset failure".to_string()));
        }
        Ok(())
    }
}
