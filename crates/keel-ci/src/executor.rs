//! Job execution contexts and the command-execution collaborator.
//!
//! Script steps are opaque: the executor hands them to a shell and reports
//! only the exit code. Output goes to the job's own log file and is never
//! parsed.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::process::Command;

use keel_core::domain::digest::sha256_hex;
use keel_core::{JobError, JobSpec, ScriptStep, Trigger, Workspace};

/// How a job's working directory relates to the shared checkout.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
    /// Each job gets a private copy of the tree.
    #[default]
    PrivateCopy,
    /// Jobs run in the synchronized root. Only for trusted jobs that never
    /// write to the checkout.
    Shared,
}

/// Private execution context for one job.
///
/// The scratch directory (and any private tree inside it) is removed when the
/// context is dropped.
#[derive(Debug)]
pub struct JobContext {
    pub job_name: String,
    pub work_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub log_path: PathBuf,
    scratch: TempDir,
}

impl JobContext {
    /// Build the context for `job` from the synchronized `workspace`.
    pub fn prepare(
        job: &JobSpec,
        workspace: &Workspace,
        trigger: &Trigger,
        isolation: Isolation,
        log_dir: &Path,
    ) -> io::Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("keel-{}-", sanitize(&job.name)))
            .tempdir()?;

        let work_dir = match isolation {
            Isolation::Shared => workspace.root.clone(),
            Isolation::PrivateCopy => {
                let tree = scratch.path().join("tree");
                copy_tree(&workspace.root, &tree)?;
                tree
            }
        };

        fs::create_dir_all(log_dir)?;
        let log_path = log_dir.join(log_file_name(&job.name));
        fs::write(&log_path, b"")?;

        let commit = workspace
            .current_commit
            .clone()
            .unwrap_or_else(|| trigger.commit_id().to_string());

        let mut env = BTreeMap::new();
        env.insert("KEEL_JOB_NAME".to_string(), job.name.clone());
        env.insert("KEEL_JOB_STAGE".to_string(), job.stage.clone());
        env.insert("KEEL_COMMIT_SHA".to_string(), commit);
        env.insert("KEEL_BRANCH".to_string(), trigger.branch_ref().to_string());
        env.insert("KEEL_TRIGGER".to_string(), trigger.kind().to_string());
        env.insert(
            "KEEL_SCRATCH_DIR".to_string(),
            scratch.path().to_string_lossy().into_owned(),
        );
        env.insert(
            "TMPDIR".to_string(),
            scratch.path().to_string_lossy().into_owned(),
        );
        if let Some(image) = &job.image {
            env.insert("KEEL_JOB_IMAGE".to_string(), image.clone());
        }
        env.extend(job.variables.clone());

        Ok(Self {
            job_name: job.name.clone(),
            work_dir,
            env,
            log_path,
            scratch,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

/// Runs one opaque script step and reports its exit code.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute `step` in `ctx`. `Ok(code)` for any exit, `Err` only when the
    /// step could not be started.
    async fn execute(&self, step: &ScriptStep, ctx: &JobContext) -> Result<i32, JobError>;
}

/// [`CommandExecutor`] that runs each step with `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("sh"),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, step: &ScriptStep, ctx: &JobContext) -> Result<i32, JobError> {
        let spawn_err = |e: io::Error| JobError::Spawn(e.to_string());

        let mut log = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&ctx.log_path)
            .map_err(spawn_err)?;
        writeln!(log, "$ {}", step.as_str()).map_err(spawn_err)?;
        let stderr = log.try_clone().map_err(spawn_err)?;

        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(step.as_str())
            .current_dir(&ctx.work_dir)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status()
            .await
            .map_err(spawn_err)?;

        // Killed by a signal.
        Ok(status.code().unwrap_or(-1))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Sanitized job name plus a digest prefix, since distinct names can
/// sanitize to the same string.
fn log_file_name(job_name: &str) -> String {
    let digest = sha256_hex(job_name.as_bytes());
    format!("{}-{}.log", sanitize(job_name), &digest[..8])
}

/// Recursively copy `src` into `dst`, preserving symlinks on unix.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(root: &Path) -> Workspace {
        let mut ws = Workspace::new(root);
        ws.current_commit = Some("abc123".to_string());
        ws
    }

    #[test]
    fn test_prepare_shared_context() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let mut job = JobSpec::new("unit tests", "check-compile", ["cargo test"]);
        job.variables.insert("RUST_BACKTRACE".into(), "1".into());

        let ctx = JobContext::prepare(
            &job,
            &workspace(root.path()),
            &Trigger::push("master", "abc123"),
            Isolation::Shared,
            logs.path(),
        )
        .unwrap();

        assert_eq!(ctx.work_dir, root.path());
        assert_eq!(ctx.env["KEEL_COMMIT_SHA"], "abc123");
        assert_eq!(ctx.env["KEEL_TRIGGER"], "push");
        assert_eq!(ctx.env["RUST_BACKTRACE"], "1");
        assert_eq!(ctx.log_path, logs.path().join(log_file_name("unit tests")));
        assert!(ctx
            .log_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("unit_tests-"));
        assert!(ctx.scratch_dir().is_dir());
    }

    #[test]
    fn test_log_names_stay_distinct() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let ws = workspace(root.path());
        let trigger = Trigger::push("master", "abc123");

        let spaced = JobSpec::new("unit tests", "check-compile", ["true"]);
        let underscored = JobSpec::new("unit_tests", "check-compile", ["true"]);
        let a = JobContext::prepare(&spaced, &ws, &trigger, Isolation::Shared, logs.path())
            .unwrap();
        let b = JobContext::prepare(&underscored, &ws, &trigger, Isolation::Shared, logs.path())
            .unwrap();

        assert_ne!(a.log_path, b.log_path);
        fs::write(&a.log_path, "first").unwrap();
        fs::write(&b.log_path, "second").unwrap();
        assert_eq!(fs::read_to_string(&a.log_path).unwrap(), "first");
    }

    #[test]
    fn test_private_copy_is_isolated() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("assets")).unwrap();
        fs::write(root.path().join("assets/a.txt"), "a").unwrap();

        let job = JobSpec::new("fmt", "check-compile", ["true"]);
        let ctx = JobContext::prepare(
            &job,
            &workspace(root.path()),
            &Trigger::push("master", "abc123"),
            Isolation::PrivateCopy,
            logs.path(),
        )
        .unwrap();

        assert_ne!(ctx.work_dir, root.path());
        fs::write(ctx.work_dir.join("assets/a.txt"), "changed").unwrap();
        assert_eq!(fs::read_to_string(root.path().join("assets/a.txt")).unwrap(), "a");

        let scratch = ctx.scratch_dir().to_path_buf();
        drop(ctx);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_shell_executor_exit_codes_and_log() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let job = JobSpec::new("echo", "check-compile", ["true"]);
        let ctx = JobContext::prepare(
            &job,
            &workspace(root.path()),
            &Trigger::push("master", "abc123"),
            Isolation::Shared,
            logs.path(),
        )
        .unwrap();

        let exec = ShellExecutor::new();
        let ok = exec
            .execute(&ScriptStep::new("echo hello-from-$KEEL_JOB_NAME"), &ctx)
            .await
            .unwrap();
        assert_eq!(ok, 0);

        let code = exec.execute(&ScriptStep::new("exit 3"), &ctx).await.unwrap();
        assert_eq!(code, 3);

        let log = fs::read_to_string(&ctx.log_path).unwrap();
        assert!(log.contains("hello-from-echo"));
        assert!(log.contains("$ exit 3"));
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_error() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let job = JobSpec::new("x", "s", ["true"]);
        let ctx = JobContext::prepare(
            &job,
            &workspace(root.path()),
            &Trigger::push("master", "abc123"),
            Isolation::Shared,
            logs.path(),
        )
        .unwrap();

        let err = ShellExecutor::new()
            .with_shell("/nonexistent/keel-sh")
            .execute(&ScriptStep::new("true"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Spawn(_)));
    }
}
