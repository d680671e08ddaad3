//! Large binary asset collaborator.
//!
//! Assets are tracked by pointer files in the main history and materialized
//! from a separate content-addressed store after the primary ref fetch.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::error::{SyncError, SyncResult};

/// Fetches and checks out large assets for a synchronized tree.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn pull(&self, root: &Path) -> SyncResult<()>;
}

/// Asset store for repositories without large assets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAssets;

#[async_trait]
impl AssetStore for NoAssets {
    async fn pull(&self, _root: &Path) -> SyncResult<()> {
        Ok(())
    }
}

/// [`AssetStore`] backed by `git lfs`.
#[derive(Debug, Clone)]
pub struct GitLfs {
    program: PathBuf,
}

impl Default for GitLfs {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitLfs {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lfs(&self, root: &Path, args: &[&str]) -> SyncResult<()> {
        debug!(dir = %root.display(), args = ?args, "git lfs");
        let output = Command::new(&self.program)
            .arg("lfs")
            .args(args)
            .current_dir(root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|e| SyncError::AssetFetchFailed(format!("failed to run git lfs: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::AssetFetchFailed(format!(
                "git lfs {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AssetStore for GitLfs {
    async fn pull(&self, root: &Path) -> SyncResult<()> {
        self.lfs(root, &["install", "--local"]).await?;
        self.lfs(root, &["fetch"]).await?;
        self.lfs(root, &["checkout"]).await
    }
}
