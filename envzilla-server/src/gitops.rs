//! Shallow clone of a PR branch into a per-PR temporary directory.

use envzilla_core::{ErrorKind, ExecError};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::info;

/// A cloned working copy. The directory is removed when this is dropped,
/// which covers both the success path (the clone is only needed for the
/// image build) and every failure path.
#[derive(Debug)]
pub struct ClonedRepo {
    dir: TempDir,
}

impl ClonedRepo {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// `git clone --depth=1 --branch <branch>` into a fresh directory under
/// `tmp_root`. The directory name carries the PR number plus a unique
/// suffix so concurrent builds of the same PR cannot collide.
pub async fn shallow_clone(
    clone_url: &str,
    branch: &str,
    pr_number: u64,
    tmp_root: &Path,
    timeout: Duration,
) -> Result<ClonedRepo, ExecError> {
    let dir = tempfile::Builder::new()
        .prefix(&format!("preview-pr-{pr_number}-"))
        .tempdir_in(tmp_root)
        .map_err(|e| {
            ExecError::new(
                ErrorKind::CloneFailed,
                format!("could not create clone dir: {e}"),
            )
        })?;

    let dest = dir.path().join("src");
    info!("cloning {branch} for pr {pr_number}");

    let mut cmd = Command::new("git");
    cmd.args([
        "clone",
        "--depth=1",
        "--branch",
        branch,
        "--single-branch",
        clone_url,
    ])
    .arg(&dest)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            ExecError::new(
                ErrorKind::CloneFailed,
                format!("clone timed out after {timeout:?}"),
            )
        })?
        .map_err(|e| ExecError::new(ErrorKind::CloneFailed, format!("git did not start: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExecError::new(
            ErrorKind::CloneFailed,
            format!("git exited with {}: {}", output.status, stderr.trim()),
        ));
    }

    Ok(ClonedRepo { dir })
}

/// Path of the checked-out tree inside a [`ClonedRepo`].
pub fn checkout_path(repo: &ClonedRepo) -> std::path::PathBuf {
    repo.path().join("src")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clone_failure_removes_the_temp_dir() {
        let tmp_root = tempfile::tempdir().unwrap();
        let err = shallow_clone(
            "file:///nonexistent/repo.git",
            "main",
            42,
            tmp_root.path(),
            Duration::from_secs(30),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::CloneFailed);
        // The per-PR directory must not linger after the failure.
        let leftovers: Vec<_> = std::fs::read_dir(tmp_root.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "clone dir leaked: {leftovers:?}");
    }

    #[tokio::test]
    async fn clone_of_a_local_repo_succeeds() {
        // Build a tiny real repository to clone from.
        let upstream = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(upstream.path())
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.test")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.test")
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "-q", "-b", "main"]);
        std::fs::write(upstream.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        run(&["add", "."]);
        run(&["-c", "commit.gpgsign=false", "commit", "-q", "-m", "init"]);

        let tmp_root = tempfile::tempdir().unwrap();
        let url = format!("file://{}", upstream.path().display());
        let repo = shallow_clone(&url, "main", 7, tmp_root.path(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(checkout_path(&repo).join("Dockerfile").exists());
        let kept = repo.path().to_path_buf();
        drop(repo);
        assert!(!kept.exists(), "dropping the clone must remove it");
    }
}
