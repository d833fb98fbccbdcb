//! Container-engine CLI wrapper.
//!
//! Every call shells out to the engine binary (`docker` by default) with
//! an explicit timeout; a timed-out child is killed via `kill_on_drop`.
//! Callers classify failures into the error taxonomy; this module only
//! reports what the engine did.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine command timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn engine binary: {0}")]
    Spawn(String),
    #[error("engine exited with {status}: {stderr}")]
    NonZero { status: i32, stderr: String },
}

pub struct ContainerEngine {
    binary: String,
}

impl ContainerEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[&str], timeout: Duration) -> Result<String, EngineError> {
        debug!("engine: {} {}", self.binary, args.join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(EngineError::NonZero {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Engine reachability probe; the build executor treats a failure here
    /// as `engine-unavailable`.
    pub async fn version(&self, timeout: Duration) -> Result<String, EngineError> {
        self.exec(&["version", "--format", "{{.Server.Version}}"], timeout)
            .await
    }

    pub async fn build_image(
        &self,
        context: &Path,
        build_file: &str,
        tag: &str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let context_str = context.display().to_string();
        let build_file_path = context.join(build_file).display().to_string();
        self.exec(
            &["build", "-t", tag, "-f", &build_file_path, &context_str],
            timeout,
        )
        .await
        .map(|_| ())
    }

    /// Starts a detached container and returns its id.
    pub async fn run_detached(
        &self,
        image: &str,
        name: &str,
        host_port: u16,
        container_port: u16,
        timeout: Duration,
    ) -> Result<String, EngineError> {
        let publish = format!("127.0.0.1:{host_port}:{container_port}");
        self.exec(&["run", "-d", "--name", name, "-p", &publish, image], timeout)
            .await
    }

    pub async fn stop(
        &self,
        target: &str,
        grace: Duration,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let grace_secs = grace.as_secs().to_string();
        self.exec(&["stop", "-t", &grace_secs, target], timeout)
            .await
            .map(|_| ())
    }

    pub async fn remove(
        &self,
        target: &str,
        force: bool,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let args: &[&str] = if force {
            &["rm", "-f", target]
        } else {
            &["rm", target]
        };
        self.exec(args, timeout).await.map(|_| ())
    }

    pub async fn remove_image(&self, image: &str, timeout: Duration) -> Result<(), EngineError> {
        self.exec(&["rmi", "-f", image], timeout).await.map(|_| ())
    }

    /// Image reference the container was started from.
    pub async fn image_of(&self, container: &str, timeout: Duration) -> Result<String, EngineError> {
        self.exec(&["inspect", "--format", "{{.Image}}", container], timeout)
            .await
    }

    /// Engine-level health status, when the image defines a healthcheck.
    /// Returns `None` for containers without one.
    pub async fn health_status(
        &self,
        container: &str,
        timeout: Duration,
    ) -> Result<Option<String>, EngineError> {
        let out = self
            .exec(
                &[
                    "inspect",
                    "--format",
                    "{{if .State.Health}}{{.State.Health.Status}}{{end}}",
                    container,
                ],
                timeout,
            )
            .await?;
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    /// Ids of containers (running or not) whose name matches exactly.
    pub async fn containers_named(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, EngineError> {
        let filter = format!("name={name}");
        let out = self
            .exec(
                &[
                    "ps",
                    "-a",
                    "--filter",
                    &filter,
                    "--format",
                    "{{.ID}} {{.Names}}",
                ],
                timeout,
            )
            .await?;
        // The name filter is a substring match; keep exact matches only.
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let id = parts.next()?;
                let names = parts.next()?;
                names
                    .split(',')
                    .any(|n| n == name)
                    .then(|| id.to_string())
            })
            .collect())
    }

    /// Image references (`repo:tag`) whose repository starts with `prefix`.
    pub async fn images_with_prefix(
        &self,
        prefix: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, EngineError> {
        let out = self
            .exec(
                &["images", "--format", "{{.Repository}}:{{.Tag}}"],
                timeout,
            )
            .await?;
        Ok(out
            .lines()
            .filter(|line| {
                line.split(':')
                    .next()
                    .is_some_and(|repo| repo == prefix || repo.starts_with(prefix))
            })
            .map(|line| line.to_string())
            .collect())
    }
}
