//! Artifact packaging for successfully completed jobs.
//!
//! The archive format belongs to the [`ArchiveSink`] collaborator; the
//! publisher resolves declared paths, refuses to skip missing ones, and
//! stamps the archive with the job's retention.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use keel_core::domain::digest::{file_sha256_hex, sha256_hex};
use keel_core::{HumanDuration, JobSpec, PublishError};

/// Where a sink put an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveLocation {
    pub path: PathBuf,
    pub manifest_digest: String,
}

/// One archived file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// Stores a named set of files.
pub trait ArchiveSink: Send + Sync {
    /// Archive `files` (relative to `root`) under `name`.
    fn store(&self, name: &str, root: &Path, files: &[PathBuf])
        -> Result<ArchiveLocation, PublishError>;
}

/// [`ArchiveSink`] that copies files into `<dir>/<name>/` next to a `manifest.json`.
#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    dir: PathBuf,
}

impl DirectoryArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArchiveSink for DirectoryArchive {
    fn store(
        &self,
        name: &str,
        root: &Path,
        files: &[PathBuf],
    ) -> Result<ArchiveLocation, PublishError> {
        let target = self.dir.join(name);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::create_dir_all(&target)?;

        let mut manifest = Vec::with_capacity(files.len());
        for rel in files {
            let from = root.join(rel);
            let to = target.join("files").join(rel);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            let size = fs::copy(&from, &to)?;
            manifest.push(ManifestEntry {
                path: rel.clone(),
                sha256: file_sha256_hex(&to)?,
                size,
            });
        }

        let bytes = serde_json::to_vec_pretty(&manifest)?;
        fs::write(target.join("manifest.json"), &bytes)?;

        Ok(ArchiveLocation {
            path: target,
            manifest_digest: sha256_hex(&bytes),
        })
    }
}

/// A published archive with its declared expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedArtifact {
    pub name: String,
    pub job_name: String,
    pub files: Vec<PathBuf>,
    pub location: ArchiveLocation,
    pub retention: Option<HumanDuration>,
    pub published_at: DateTime<Utc>,
    /// Storage may reclaim the archive after this instant; not enforced here.
    pub expires_at: Option<DateTime<Utc>>,
}

/// A publish that failed without affecting the job's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishFailure {
    pub job_name: String,
    pub error: String,
}

/// Packages declared job outputs into named archives.
pub struct ArtifactPublisher {
    sink: Arc<dyn ArchiveSink>,
}

impl ArtifactPublisher {
    pub fn new(sink: Arc<dyn ArchiveSink>) -> Self {
        Self { sink }
    }

    /// Archive `job`'s declared paths found under `root`.
    ///
    /// `tag` distinguishes archives of the same job across runs (typically the
    /// short commit id). Every pattern must match at least one file.
    pub fn publish(
        &self,
        job: &JobSpec,
        root: &Path,
        tag: &str,
    ) -> Result<PublishedArtifact, PublishError> {
        let files = resolve_paths(root, &job.artifact_paths)?;
        let name = archive_name(&job.name, tag);
        let location = self.sink.store(&name, root, &files)?;

        let published_at = Utc::now();
        let expires_at = job
            .retention
            .as_ref()
            .map(|r| published_at + r.to_chrono());

        Ok(PublishedArtifact {
            name,
            job_name: job.name.clone(),
            files,
            location,
            retention: job.retention.clone(),
            published_at,
            expires_at,
        })
    }
}

pub fn archive_name(job: &str, tag: &str) -> String {
    if tag.is_empty() {
        job.to_string()
    } else {
        format!("{job}-{tag}")
    }
}

/// Expand every pattern to files relative to `root`, in declaration order.
pub fn resolve_paths(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, PublishError> {
    let mut files: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        let matched = if is_glob(pattern) {
            let matcher = Glob::new(pattern)
                .map_err(|e| PublishError::InvalidPattern {
                    pattern: pattern.clone(),
                    detail: e.to_string(),
                })?
                .compile_matcher();
            let mut found = Vec::new();
            walk_matches(root, root, &matcher, &mut found)?;
            found.sort();
            found
        } else {
            let path = root.join(pattern);
            if path.is_dir() {
                let mut found = Vec::new();
                collect_files(root, &path, &mut found)?;
                found.sort();
                found
            } else if path.is_file() {
                vec![PathBuf::from(pattern)]
            } else {
                Vec::new()
            }
        };

        if matched.is_empty() {
            return Err(PublishError::MissingPath {
                pattern: pattern.clone(),
            });
        }
        for file in matched {
            if !files.contains(&file) {
                files.push(file);
            }
        }
    }
    Ok(files)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn walk_matches(
    base: &Path,
    current: &Path,
    matcher: &GlobMatcher,
    out: &mut Vec<PathBuf>,
) -> io::Result<()> {
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name() == ".git" {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_matches(base, &path, matcher, out)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            if matcher.is_match(rel) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(base, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("target/release")).unwrap();
        fs::create_dir_all(dir.path().join("assets/voxygen")).unwrap();
        fs::write(dir.path().join("target/release/game"), b"elf").unwrap();
        fs::write(dir.path().join("target/release/server.exe"), b"pe").unwrap();
        fs::write(dir.path().join("assets/voxygen/a.vox"), b"vox").unwrap();
        dir
    }

    #[test]
    fn test_resolve_literal_glob_and_dir() {
        let root = tree();
        let files = resolve_paths(
            root.path(),
            &[
                "target/release/game".to_string(),
                "target/release/*.exe".to_string(),
                "assets/".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("target/release/game"),
                PathBuf::from("target/release/server.exe"),
                PathBuf::from("assets/voxygen/a.vox"),
            ]
        );
    }

    #[test]
    fn test_missing_path_is_hard_failure() {
        let root = tree();
        let err = resolve_paths(root.path(), &["target/release/nope".to_string()]).unwrap_err();
        assert!(matches!(err, PublishError::MissingPath { pattern } if pattern == "target/release/nope"));

        let err = resolve_paths(root.path(), &["**/*.dmg".to_string()]).unwrap_err();
        assert!(matches!(err, PublishError::MissingPath { .. }));
    }

    #[test]
    fn test_publish_writes_manifest_and_expiry() {
        let root = tree();
        let store = tempfile::tempdir().unwrap();
        let publisher = ArtifactPublisher::new(Arc::new(DirectoryArchive::new(store.path())));
        let job = JobSpec::new("linux", "post-build", ["cargo build --release"])
            .with_artifacts(["target/release/game"], "1 week".parse().unwrap());

        let artifact = publisher.publish(&job, root.path(), "abc12345").unwrap();

        assert_eq!(artifact.name, "linux-abc12345");
        assert_eq!(artifact.files, vec![PathBuf::from("target/release/game")]);
        let expires = artifact.expires_at.unwrap();
        assert_eq!(expires - artifact.published_at, chrono::Duration::weeks(1));

        let archived = store.path().join("linux-abc12345/files/target/release/game");
        assert_eq!(fs::read(archived).unwrap(), b"elf");

        let manifest: Vec<ManifestEntry> = serde_json::from_slice(
            &fs::read(store.path().join("linux-abc12345/manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].sha256, sha256_hex(b"elf"));
        assert_eq!(manifest[0].size, 3);
    }

    #[test]
    fn test_invalid_glob() {
        let root = tree();
        let err = resolve_paths(root.path(), &["target/[".to_string()]).unwrap_err();
        assert!(matches!(err, PublishError::InvalidPattern { .. }));
    }
}
