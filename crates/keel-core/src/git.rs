//! Version-control collaborator used by the workspace synchronizer.
//!
//! [`VcsBackend`] is the seam; [`GitCli`] drives the `git` binary.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::error::{SyncError, SyncResult};

/// Primitive repository operations needed for an incremental sync.
#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// Full clone of `remote` into `root`, which must be empty or absent.
    async fn clone_repo(&self, remote: &str, root: &Path) -> SyncResult<()>;

    /// Point the `origin` remote at `remote`.
    async fn set_remote_url(&self, root: &Path, remote: &str) -> SyncResult<()>;

    /// Fetch every branch and tag, pruning refs deleted upstream.
    async fn fetch_all_prune(&self, root: &Path) -> SyncResult<()>;

    /// Check out `commit`, discarding local modifications to tracked files.
    async fn checkout_force(&self, root: &Path, commit: &str) -> SyncResult<()>;

    /// Merge `branch` of `project` (reachable at `url`) into the current HEAD.
    async fn integrate(&self, root: &Path, project: &str, url: &str, branch: &str)
        -> SyncResult<()>;

    /// Full id of the commit at HEAD.
    async fn head_commit(&self, root: &Path) -> SyncResult<String>;
}

/// Committer identity used for integration merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeIdentity {
    pub name: String,
    pub email: String,
}

impl Default for MergeIdentity {
    fn default() -> Self {
        Self {
            name: "keel".to_string(),
            email: "keel@localhost".to_string(),
        }
    }
}

/// [`VcsBackend`] backed by the `git` command-line client.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
    identity: MergeIdentity,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
            identity: MergeIdentity::default(),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_identity(mut self, identity: MergeIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Run git in `dir`, returning trimmed stdout or an error message.
    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, String> {
        debug!(dir = %dir.display(), args = ?args, "git");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|e| format!("failed to run git: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(format!(
                "git {} exited with {}: {}{}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim(),
                if stdout.trim().is_empty() {
                    String::new()
                } else {
                    format!(" ({})", stdout.trim())
                }
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl VcsBackend for GitCli {
    async fn clone_repo(&self, remote: &str, root: &Path) -> SyncResult<()> {
        tokio::fs::create_dir_all(root).await?;
        self.git(root, &["clone", "--quiet", remote, "."])
            .await
            .map(drop)
            .map_err(|detail| SyncError::ColdCloneFailed {
                remote: remote.to_string(),
                detail,
            })
    }

    async fn set_remote_url(&self, root: &Path, remote: &str) -> SyncResult<()> {
        let result = self.git(root, &["remote", "set-url", "origin", remote]).await;
        if result.is_ok() {
            return Ok(());
        }
        // Workspaces created by hand may lack an origin remote.
        self.git(root, &["remote", "add", "origin", remote])
            .await
            .map(drop)
            .map_err(|detail| SyncError::RemoteUpdateFailed {
                remote: remote.to_string(),
                detail,
            })
    }

    async fn fetch_all_prune(&self, root: &Path) -> SyncResult<()> {
        self.git(
            root,
            &[
                "fetch",
                "--quiet",
                "--force",
                "--prune",
                "--prune-tags",
                "origin",
                "+refs/heads/*:refs/remotes/origin/*",
                "+refs/tags/*:refs/tags/*",
            ],
        )
        .await
        .map(drop)
        .map_err(SyncError::FetchFailed)
    }

    async fn checkout_force(&self, root: &Path, commit: &str) -> SyncResult<()> {
        self.git(root, &["checkout", "--force", "--quiet", commit])
            .await
            .map(drop)
            .map_err(|detail| SyncError::CheckoutFailed {
                commit: commit.to_string(),
                detail,
            })
    }

    async fn integrate(
        &self,
        root: &Path,
        project: &str,
        url: &str,
        branch: &str,
    ) -> SyncResult<()> {
        let name = format!("user.name={}", self.identity.name);
        let email = format!("user.email={}", self.identity.email);
        let result = self
            .git(
                root,
                &[
                    "-c", &name, "-c", &email, "pull", "--quiet", "--no-edit", "--no-rebase",
                    url, branch,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(detail) => {
                // Leave the tree at the checked-out commit rather than mid-merge.
                let _ = self.git(root, &["merge", "--abort"]).await;
                Err(SyncError::MergeConflict {
                    project: project.to_string(),
                    branch: branch.to_string(),
                    detail,
                })
            }
        }
    }

    async fn head_commit(&self, root: &Path) -> SyncResult<String> {
        let sha = self
            .git(root, &["rev-parse", "HEAD"])
            .await
            .map_err(|detail| SyncError::CheckoutFailed {
                commit: "HEAD".to_string(),
                detail,
            })?;
        if sha.is_empty() {
            return Err(SyncError::CheckoutFailed {
                commit: "HEAD".to_string(),
                detail: "git rev-parse HEAD returned empty output".to_string(),
            });
        }
        Ok(sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn make_origin() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "--quiet"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        std::fs::write(dir.path().join("README"), "hello\n").unwrap();
        run_git(dir.path(), &["add", "README"]);
        run_git(dir.path(), &["commit", "--quiet", "-m", "initial"]);
        dir
    }

    #[tokio::test]
    async fn clone_then_head_matches_origin() {
        let origin = make_origin();
        let expected = run_git(origin.path(), &["rev-parse", "HEAD"]);

        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("ws");
        let git = GitCli::new();
        git.clone_repo(&origin.path().to_string_lossy(), &root)
            .await
            .unwrap();

        let head = git.head_commit(&root).await.unwrap();
        assert_eq!(head, expected);
        assert_eq!(head.len(), 40);
    }

    #[tokio::test]
    async fn clone_from_missing_remote_fails() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("ws");
        let err = GitCli::new()
            .clone_repo(&scratch.path().join("nowhere").to_string_lossy(), &root)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ColdCloneFailed { .. }));
    }

    #[tokio::test]
    async fn checkout_force_discards_local_edits() {
        let origin = make_origin();
        let sha = run_git(origin.path(), &["rev-parse", "HEAD"]);
        std::fs::write(origin.path().join("README"), "edited\n").unwrap();

        GitCli::new()
            .checkout_force(origin.path(), &sha)
            .await
            .unwrap();

        let contents = std::fs::read_to_string(origin.path().join("README")).unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[tokio::test]
    async fn head_commit_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GitCli::new().head_commit(dir.path()).await.is_err());
    }
}
