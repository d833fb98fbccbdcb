//! Job kinds and payloads carried through the work queue.
//!
//! Payloads are immutable after enqueue. Fields that are sensitive in
//! transit (`clone_url`, `commit_sha`) travel as [`Sealed`] ciphertext and
//! are only opened inside the executor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::sealed::Sealed;

/// The kinds of work a queue worker can be handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    BuildContainer,
    DestroyContainer,
    CleanupStale,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::BuildContainer => "build-container",
            JobKind::DestroyContainer => "destroy-container",
            JobKind::CleanupStale => "cleanup-stale",
        }
    }

    /// Hard ceiling on a single attempt, from which the worker derives the
    /// per-job deadline. Builds dominate: clone (5 min) + image build
    /// (10 min) + run/probe/tunnel margins.
    pub fn max_runtime(&self) -> Duration {
        match self {
            JobKind::BuildContainer => Duration::from_secs(20 * 60),
            JobKind::DestroyContainer => Duration::from_secs(3 * 60),
            JobKind::CleanupStale => Duration::from_secs(5 * 60),
        }
    }

    /// Queue priority namespace. Lower pops first.
    pub fn priority(&self) -> u8 {
        match self {
            JobKind::BuildContainer => 1,
            JobKind::DestroyContainer => 2,
            JobKind::CleanupStale => 3,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build-container" => Ok(JobKind::BuildContainer),
            "destroy-container" => Ok(JobKind::DestroyContainer),
            "cleanup-stale" => Ok(JobKind::CleanupStale),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Payload of a `build-container` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJobPayload {
    pub pr_number: u64,
    pub branch: String,
    pub repo_full_name: String,
    pub author: String,
    pub installation_id: u64,
    /// Sealed clone URL; opened by the executor just before `git clone`.
    pub clone_url: Sealed,
    /// Sealed head commit SHA.
    pub commit_sha: Sealed,
}

/// Payload of a `destroy-container` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyJobPayload {
    pub pr_number: u64,
    /// Known container id, if the record had one. When absent the executor
    /// falls back to enumerating containers named `preview-<N>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Remove the built image(s) as well as the container.
    #[serde(default = "default_true")]
    pub remove_images: bool,
}

fn default_true() -> bool {
    true
}

/// Payload of a `cleanup-stale` job (sweeper-triggered).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupJobPayload {
    pub max_age_hours: u64,
}
