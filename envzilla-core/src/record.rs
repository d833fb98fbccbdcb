//! Per-PR deployment bookkeeping: the record and its status state machine.
//!
//! The record is the authoritative description of one preview environment.
//! Status changes go through [`DeploymentStatus::can_transition`]; any
//! writer that would violate the state machine must be rejected by the
//! store with a `state-conflict`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a preview deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Accepted by the dispatcher, waiting for a worker.
    Queued,
    /// A build job is executing.
    Building,
    /// Container up, port bound, tunnel (possibly) live.
    Running,
    /// A destroy job is executing (or about to).
    Destroying,
    /// The last build or destroy attempt failed. Non-terminal: a new PR
    /// event returns the record to `Queued`.
    Failed,
    /// Container stopped out-of-band; kept for bookkeeping until reaped.
    Stopped,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Destroying => "destroying",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Stopped => "stopped",
        }
    }

    /// Whether the transition `from` (None = no record yet) to `self` is
    /// one the state machine permits.
    ///
    /// Permitted edges:
    ///
    /// ```text
    ///   (none)     ── enqueue ──▶ queued
    ///   queued     ── start ────▶ building
    ///   building   ── ok ───────▶ running
    ///   building   ── fail ─────▶ failed
    ///   running    ── close ────▶ destroying
    ///   failed     ── close ────▶ destroying
    ///   destroying ── fail ─────▶ failed
    ///   failed     ── retry ────▶ building   (queue re-attempt)
    ///   any non-terminal ── ttl ▶ destroying   (sweeper)
    ///   failed/running/stopped ─▶ queued       (re-dispatch)
    ///   running    ── halt ─────▶ stopped
    /// ```
    ///
    /// Deletion is not a status; the destroy executor removes the record
    /// outright after `destroying` succeeds.
    pub fn can_transition(from: Option<DeploymentStatus>, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        match (from, to) {
            (None, Queued) => true,
            (None, _) => false,
            // Re-dispatch: a finished or dead preview can be rebuilt. A
            // queued record may be refreshed in place by a duplicate event.
            (Some(Queued | Running | Failed | Stopped), Queued) => true,
            (Some(Queued), Building) => true,
            // Worker entry refreshes the status the dispatcher already set;
            // a queue retry re-enters the build after the previous attempt
            // marked the record failed.
            (Some(Building | Failed), Building) => true,
            (Some(Building), Running) => true,
            (Some(Building), Failed) => true,
            (Some(Destroying), Failed) => true,
            // Close or TTL expiry; every live status can be promoted to
            // destroying (the sweeper reaps any non-terminal record).
            (Some(Queued | Building | Running | Failed | Stopped | Destroying), Destroying) => {
                true
            }
            (Some(Running), Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DeploymentStatus::Queued),
            "building" => Ok(DeploymentStatus::Building),
            "running" => Ok(DeploymentStatus::Running),
            "destroying" => Ok(DeploymentStatus::Destroying),
            "failed" => Ok(DeploymentStatus::Failed),
            "stopped" => Ok(DeploymentStatus::Stopped),
            other => Err(format!("unknown deployment status: {other}")),
        }
    }
}

/// PR metadata captured from the webhook payload when a deployment is
/// created or refreshed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrMetadata {
    pub branch: String,
    pub commit_sha: String,
    pub title: String,
    pub author: String,
    pub repo_full_name: String,
    pub clone_url: String,
}

/// The authoritative per-PR deployment record (keyed by PR number).
///
/// Invariants enforced by the store:
/// - `status == Running` implies `container_id` and `host_port` are set.
/// - status changes follow [`DeploymentStatus::can_transition`].
/// - at most one record per PR number; only the destroy path deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub pr_number: u64,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    pub branch: String,
    pub commit_sha: String,
    pub title: String,
    pub author: String,
    pub repo_full_name: String,
    pub clone_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
}

impl DeploymentRecord {
    /// Fresh `queued` record from webhook metadata.
    pub fn new_queued(pr_number: u64, meta: PrMetadata, now: DateTime<Utc>) -> Self {
        Self {
            pr_number,
            status: DeploymentStatus::Queued,
            container_id: None,
            host_port: None,
            image_ref: None,
            branch: meta.branch,
            commit_sha: meta.commit_sha,
            title: meta.title,
            author: meta.author,
            repo_full_name: meta.repo_full_name,
            clone_url: meta.clone_url,
            created_at: now,
            updated_at: now,
            build_started_at: None,
            build_completed_at: None,
            last_error: None,
            tunnel_url: None,
        }
    }

    /// Refresh metadata in place for a re-dispatched PR, clearing the
    /// artifacts of the previous run but keeping `created_at`.
    pub fn requeue(&mut self, meta: PrMetadata, now: DateTime<Utc>) {
        self.status = DeploymentStatus::Queued;
        self.branch = meta.branch;
        self.commit_sha = meta.commit_sha;
        self.title = meta.title;
        self.author = meta.author;
        self.repo_full_name = meta.repo_full_name;
        self.clone_url = meta.clone_url;
        self.updated_at = now;
        self.build_started_at = None;
        self.build_completed_at = None;
        self.last_error = None;
    }

    /// `status == Running` requires a container id and a bound host port.
    pub fn running_invariant_holds(&self) -> bool {
        self.status != DeploymentStatus::Running
            || (self
                .container_id
                .as_deref()
                .is_some_and(|id| !id.is_empty())
                && self.host_port.is_some())
    }

    /// Age since the last status refresh.
    pub fn age_since_update(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn all_statuses() -> [DeploymentStatus; 6] {
        [
            DeploymentStatus::Queued,
            DeploymentStatus::Building,
            DeploymentStatus::Running,
            DeploymentStatus::Destroying,
            DeploymentStatus::Failed,
            DeploymentStatus::Stopped,
        ]
    }

    fn meta() -> PrMetadata {
        PrMetadata {
            branch: "feat/x".into(),
            commit_sha: "abc123def456abc123def456abc123def456abcd".into(),
            title: "Add x".into(),
            author: "octocat".into(),
            repo_full_name: "example/repo".into(),
            clone_url: "https://example.test/u/r.git".into(),
        }
    }

    #[test]
    fn happy_path_edges_are_legal() {
        use DeploymentStatus::*;
        assert!(DeploymentStatus::can_transition(None, Queued));
        assert!(DeploymentStatus::can_transition(Some(Queued), Building));
        assert!(DeploymentStatus::can_transition(Some(Building), Running));
        assert!(DeploymentStatus::can_transition(Some(Running), Destroying));
    }

    #[test]
    fn failure_edges_are_legal() {
        use DeploymentStatus::*;
        assert!(DeploymentStatus::can_transition(Some(Building), Failed));
        assert!(DeploymentStatus::can_transition(Some(Destroying), Failed));
        assert!(DeploymentStatus::can_transition(Some(Failed), Destroying));
        // A failed deployment is not terminal.
        assert!(DeploymentStatus::can_transition(Some(Failed), Queued));
    }

    #[test]
    fn illegal_edges_are_rejected() {
        use DeploymentStatus::*;
        // A second `opened` during a build must not corrupt it.
        assert!(!DeploymentStatus::can_transition(Some(Building), Queued));
        assert!(!DeploymentStatus::can_transition(Some(Queued), Running));
        assert!(!DeploymentStatus::can_transition(Some(Destroying), Running));
        assert!(!DeploymentStatus::can_transition(Some(Running), Building));
        assert!(!DeploymentStatus::can_transition(None, Running));
        assert!(!DeploymentStatus::can_transition(None, Destroying));
    }

    #[test]
    fn sweeper_can_promote_any_live_status() {
        for s in all_statuses() {
            assert!(
                DeploymentStatus::can_transition(Some(s), DeploymentStatus::Destroying),
                "sweeper must be able to reap {s}"
            );
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in all_statuses() {
            assert_eq!(s.as_str().parse::<DeploymentStatus>().unwrap(), s);
        }
        assert!("deleted".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn running_invariant() {
        let now = Utc::now();
        let mut rec = DeploymentRecord::new_queued(42, meta(), now);
        assert!(rec.running_invariant_holds());

        rec.status = DeploymentStatus::Running;
        assert!(!rec.running_invariant_holds());

        rec.container_id = Some("abc123def456".into());
        rec.host_port = Some(5001);
        assert!(rec.running_invariant_holds());

        rec.container_id = Some(String::new());
        assert!(!rec.running_invariant_holds());
    }

    #[test]
    fn requeue_clears_previous_run() {
        let now = Utc::now();
        let mut rec = DeploymentRecord::new_queued(42, meta(), now);
        rec.status = DeploymentStatus::Failed;
        rec.last_error = Some("build-failed: exit status 1".into());
        rec.build_started_at = Some(now);

        let mut m = meta();
        m.commit_sha = "ffff".into();
        let later = now + chrono::Duration::seconds(5);
        rec.requeue(m, later);

        assert_eq!(rec.status, DeploymentStatus::Queued);
        assert_eq!(rec.commit_sha, "ffff");
        assert!(rec.last_error.is_none());
        assert!(rec.build_started_at.is_none());
        assert_eq!(rec.created_at, now);
        assert_eq!(rec.updated_at, later);
    }

    #[test]
    fn record_serde_round_trip() {
        let now = Utc::now();
        let mut rec = DeploymentRecord::new_queued(7, meta(), now);
        rec.status = DeploymentStatus::Running;
        rec.container_id = Some("0123456789ab".into());
        rec.host_port = Some(5123);
        rec.tunnel_url = Some("https://seven.example.trycloudflare.com".into());

        let json = serde_json::to_string(&rec).unwrap();
        let back: DeploymentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
        assert!(json.contains("\"status\":\"running\""));
    }

    fn arb_status() -> impl Strategy<Value = DeploymentStatus> {
        prop_oneof![
            Just(DeploymentStatus::Queued),
            Just(DeploymentStatus::Building),
            Just(DeploymentStatus::Running),
            Just(DeploymentStatus::Destroying),
            Just(DeploymentStatus::Failed),
            Just(DeploymentStatus::Stopped),
        ]
    }

    proptest! {
        /// Every legal edge out of a fresh store starts at `queued`.
        #[test]
        fn only_queued_is_creatable(to in arb_status()) {
            let legal = DeploymentStatus::can_transition(None, to);
            prop_assert_eq!(legal, to == DeploymentStatus::Queued);
        }

        /// `building` is only reachable from `queued`, itself (worker-entry
        /// refresh), or `failed` (queue retry); nothing else may sneak
        /// into a build.
        #[test]
        fn building_is_guarded(from in arb_status()) {
            let legal = DeploymentStatus::can_transition(Some(from), DeploymentStatus::Building);
            prop_assert_eq!(
                legal,
                matches!(
                    from,
                    DeploymentStatus::Queued
                        | DeploymentStatus::Building
                        | DeploymentStatus::Failed
                )
            );
        }

        /// `running` is only reachable from `building`.
        #[test]
        fn running_is_guarded(from in arb_status()) {
            let legal = DeploymentStatus::can_transition(Some(from), DeploymentStatus::Running);
            prop_assert_eq!(legal, from == DeploymentStatus::Building);
        }
    }
}
