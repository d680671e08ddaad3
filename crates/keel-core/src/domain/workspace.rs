//! The persistent on-disk working copy reused across pipeline runs.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Lock files, relative to the git directory, that an interrupted run can leave behind.
pub const STALE_LOCKS: &[&str] = &[
    "index.lock",
    "shallow.lock",
    "HEAD.lock",
    "config.lock",
    "packed-refs.lock",
    "hooks/post-checkout.lock",
];

/// A long-lived build checkout.
///
/// Mutated only by the synchronizer, which takes it by value for the duration
/// of a sync. The core never deletes the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workspace {
    pub root: PathBuf,
    pub current_commit: Option<String>,
    pub has_git_dir: bool,
    pub lock_files: BTreeSet<PathBuf>,
    /// HEAD after an integration merge, when one was applied.
    pub integrated_head: Option<String>,
}

impl Workspace {
    /// A workspace that has not been looked at yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current_commit: None,
            has_git_dir: false,
            lock_files: BTreeSet::new(),
            integrated_head: None,
        }
    }

    /// Read the on-disk state of `root`. A missing root is not an error.
    pub fn inspect(root: impl Into<PathBuf>) -> io::Result<Self> {
        let mut ws = Self::new(root);
        ws.refresh()?;
        Ok(ws)
    }

    pub fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    /// Re-read metadata presence and lock files from disk.
    pub fn refresh(&mut self) -> io::Result<()> {
        let git_dir = self.git_dir();
        self.has_git_dir = git_dir.is_dir();
        self.lock_files = if self.has_git_dir {
            find_lock_files(&git_dir)?
        } else {
            BTreeSet::new()
        };
        Ok(())
    }
}

/// Collect known stale locks plus every `*.lock` under `refs/`.
pub fn find_lock_files(git_dir: &Path) -> io::Result<BTreeSet<PathBuf>> {
    let mut found = BTreeSet::new();
    for rel in STALE_LOCKS {
        let path = git_dir.join(rel);
        if path.is_file() {
            found.insert(path);
        }
    }
    collect_ref_locks(&git_dir.join("refs"), &mut found)?;
    Ok(found)
}

fn collect_ref_locks(dir: &Path, found: &mut BTreeSet<PathBuf>) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_ref_locks(&path, found)?;
        } else if path.extension().is_some_and(|ext| ext == "lock") {
            found.insert(path);
        }
    }
    Ok(())
}
