//! Signed-webhook ingress and event dispatch.
//!
//! The verification middleware consumes the raw request bytes exactly as
//! received (never re-serialized from a parsed object), enforces the body
//! cap before anything else, and checks the HMAC in constant time. Only
//! then does the dispatcher parse the payload, classify the action, write
//! the store, and enqueue work. The `202` goes out before any executor
//! runs.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use envzilla_core::{BuildJobPayload, DeploymentStatus, DestroyJobPayload, JobKind, PrMetadata};

use crate::queue::{Job, JobQueue};
use crate::store::StoreError;
use crate::AppState;

/// Bodies above this are rejected before signature verification.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";

type HmacSha256 = Hmac<Sha256>;

/// Per-delivery id threaded through dispatch, jobs, and executor logs.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequest>,
    pub repository: Option<Repository>,
    pub installation: Option<Installation>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub merged: Option<bool>,
    pub head: PullRequestRef,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
    #[serde(default)]
    pub repo: Option<HeadRepo>,
}

#[derive(Debug, Deserialize)]
pub struct HeadRepo {
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub full_name: String,
    #[serde(default)]
    pub clone_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookResponse {
    fn accepted() -> Self {
        Self {
            status: "accepted",
            reason: None,
        }
    }

    fn ignored(reason: &str) -> Self {
        Self {
            status: "ignored",
            reason: Some(reason.to_string()),
        }
    }

    fn rejected(reason: &str) -> Self {
        Self {
            status: "rejected",
            reason: Some(reason.to_string()),
        }
    }

    fn error(reason: &str) -> Self {
        Self {
            status: "error",
            reason: Some(reason.to_string()),
        }
    }
}

/// Constant-time signature check over the raw body bytes.
///
/// The header carries `sha256=<hex>`; a missing prefix, bad hex, or a
/// digest of the wrong length fails without a full comparison.
pub fn verify_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let Some(signature_hex) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    // verify_slice is constant-time (and rejects wrong lengths up front).
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Middleware: cap the body, verify the signature against the raw bytes,
/// then hand the request (with its body restored) to the handler.
async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!("payload-too-large: webhook body exceeded {MAX_BODY_BYTES} bytes");
            return Err((
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(WebhookResponse::error("payload-too-large")),
            )
                .into_response());
        }
    };

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            warn!("signature-invalid: missing {SIGNATURE_HEADER} header");
            (
                StatusCode::UNAUTHORIZED,
                Json(WebhookResponse::error("signature-invalid")),
            )
                .into_response()
        })?;

    if !verify_signature(&state.config.webhook_secret, &bytes, signature) {
        error!("signature-invalid: webhook signature did not verify");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(WebhookResponse::error("signature-invalid")),
        )
            .into_response());
    }

    let correlation_id = CorrelationId(Uuid::new_v4().to_string());
    let mut request = Request::from_parts(parts, axum::body::Body::from(bytes));
    request.extensions_mut().insert(correlation_id);
    Ok(next.run(request).await)
}

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Response {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone());

    let event_type = request
        .headers()
        .get(EVENT_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (_parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse::error("unreadable body")),
            )
                .into_response()
        }
    };

    // Only the pull-request lifecycle event is actionable.
    if event_type != "pull_request" {
        info!("ignoring {event_type:?} event");
        return (
            StatusCode::OK,
            Json(WebhookResponse::ignored("unsupported-event")),
        )
            .into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("malformed pull_request payload: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse::error("malformed payload")),
            )
                .into_response();
        }
    };

    let action = payload.action.as_deref().unwrap_or("");
    match action {
        "opened" | "reopened" | "synchronize" => {
            handle_create_or_update(state, payload, correlation_id).await
        }
        // The forge delivers merges as `closed` with `merged=true`; both
        // take the destroy path.
        "closed" | "merged" => handle_destroy(state, payload, correlation_id).await,
        other => {
            info!("ignoring pull_request action {other:?}");
            (
                StatusCode::OK,
                Json(WebhookResponse::ignored("unsupported-action")),
            )
                .into_response()
        }
    }
}

async fn handle_create_or_update(
    state: Arc<AppState>,
    payload: WebhookPayload,
    correlation_id: Option<String>,
) -> Response {
    let Some(pr) = payload.pull_request else {
        return (
            StatusCode::BAD_REQUEST,
            Json(WebhookResponse::error("missing pull_request")),
        )
            .into_response();
    };
    let pr_number = pr.number;

    let repo_full_name = pr
        .head
        .repo
        .as_ref()
        .and_then(|r| r.full_name.clone())
        .or_else(|| payload.repository.as_ref().map(|r| r.full_name.clone()))
        .unwrap_or_default();
    let clone_url = pr
        .head
        .repo
        .as_ref()
        .and_then(|r| r.clone_url.clone())
        .or_else(|| payload.repository.as_ref().and_then(|r| r.clone_url.clone()));
    let Some(clone_url) = clone_url else {
        return (
            StatusCode::BAD_REQUEST,
            Json(WebhookResponse::error("missing clone_url")),
        )
            .into_response();
    };

    let meta = PrMetadata {
        branch: pr.head.ref_name.clone(),
        commit_sha: pr.head.sha.clone(),
        title: pr.title.clone().unwrap_or_default(),
        author: pr.user.as_ref().map(|u| u.login.clone()).unwrap_or_default(),
        repo_full_name: repo_full_name.clone(),
        clone_url: clone_url.clone(),
    };

    match state.store.upsert_queued(pr_number, meta).await {
        Ok(_) => {}
        Err(e @ StoreError::Conflict { .. }) => {
            // A build is already in flight for this PR; the event is
            // coalesced rather than allowed to corrupt it.
            info!("state-conflict dispatching pr {pr_number}: {e}");
            return (
                StatusCode::CONFLICT,
                Json(WebhookResponse::rejected("state-conflict")),
            )
                .into_response();
        }
        Err(e) => {
            error!("store write failed for pr {pr_number}: {e}");
            return internal_error();
        }
    }

    // Sensitive fields are sealed for their trip through the queue.
    let (sealed_url, sealed_sha) = match (
        state.cipher.seal_str(&clone_url),
        state.cipher.seal_str(&pr.head.sha),
    ) {
        (Ok(url), Ok(sha)) => (url, sha),
        (Err(e), _) | (_, Err(e)) => {
            error!("sealing job payload for pr {pr_number} failed: {e}");
            return internal_error();
        }
    };

    let job_payload = BuildJobPayload {
        pr_number,
        branch: pr.head.ref_name.clone(),
        repo_full_name,
        author: pr.user.as_ref().map(|u| u.login.clone()).unwrap_or_default(),
        installation_id: payload.installation.as_ref().map(|i| i.id).unwrap_or(0),
        clone_url: sealed_url,
        commit_sha: sealed_sha,
    };
    let job = match Job::new(
        JobKind::BuildContainer,
        &job_payload,
        state.config.job_max_attempts,
        correlation_id,
    ) {
        Ok(job) => job,
        Err(e) => {
            error!("building job for pr {pr_number} failed: {e}");
            return internal_error();
        }
    };

    let job_id = match state.queue.enqueue(job).await {
        Ok(id) => id,
        Err(e) => {
            error!("enqueue for pr {pr_number} failed: {e}");
            return internal_error();
        }
    };

    if let Err(e) = state
        .store
        .transition(pr_number, DeploymentStatus::Building, |_| {})
        .await
    {
        // The job is already queued; the worker's own entry transition
        // will set the status. Just note the oddity.
        warn!("could not pre-mark pr {pr_number} building: {e}");
    }

    info!("accepted build for pr {pr_number} as job {job_id}");
    (StatusCode::ACCEPTED, Json(WebhookResponse::accepted())).into_response()
}

async fn handle_destroy(
    state: Arc<AppState>,
    payload: WebhookPayload,
    correlation_id: Option<String>,
) -> Response {
    let Some(pr) = payload.pull_request else {
        return (
            StatusCode::BAD_REQUEST,
            Json(WebhookResponse::error("missing pull_request")),
        )
            .into_response();
    };
    let pr_number = pr.number;
    if pr.merged == Some(true) {
        info!("pr {pr_number} was merged, destroying preview");
    }

    let record = match state.store.get(pr_number).await {
        Ok(record) => record,
        Err(e) => {
            error!("store read failed for pr {pr_number}: {e}");
            return internal_error();
        }
    };
    let container_id = record
        .as_ref()
        .and_then(|r| r.container_id.clone())
        .filter(|id| !id.is_empty());
    if record.is_none() || container_id.is_none() {
        info!("no deployment to destroy for pr {pr_number}");
        return (
            StatusCode::OK,
            Json(WebhookResponse::ignored("no-deployment")),
        )
            .into_response();
    }

    if let Err(e) = state
        .store
        .transition(pr_number, DeploymentStatus::Destroying, |_| {})
        .await
    {
        warn!("state-conflict destroying pr {pr_number}: {e}");
        return (
            StatusCode::CONFLICT,
            Json(WebhookResponse::rejected("state-conflict")),
        )
            .into_response();
    }

    let job_payload = DestroyJobPayload {
        pr_number,
        container_id,
        remove_images: true,
    };
    let job = match Job::new(
        JobKind::DestroyContainer,
        &job_payload,
        state.config.job_max_attempts,
        correlation_id,
    ) {
        Ok(job) => job,
        Err(e) => {
            error!("building destroy job for pr {pr_number} failed: {e}");
            return internal_error();
        }
    };
    match state.queue.enqueue(job).await {
        Ok(job_id) => {
            info!("accepted destroy for pr {pr_number} as job {job_id}");
            (StatusCode::ACCEPTED, Json(WebhookResponse::accepted())).into_response()
        }
        Err(e) => {
            error!("enqueue destroy for pr {pr_number} failed: {e}");
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    // Opaque message at the boundary; details stay in the logs.
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(WebhookResponse::error("internal")),
    )
        .into_response()
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhooks/github", post(webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::queue::{InMemoryJobQueue, JobQueue};
    use crate::store::InMemoryDeploymentRepository;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::json;
    use tower::ServiceExt;

    const SECRET: &str = "test-webhook-secret";

    fn sign(body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn test_state() -> Arc<AppState> {
        let config = Config::test_defaults(&std::env::temp_dir());
        Arc::new(AppState::new(
            config,
            Arc::new(InMemoryDeploymentRepository::new()),
            Arc::new(InMemoryJobQueue::default()),
        ))
    }

    fn app(state: Arc<AppState>) -> Router {
        webhook_router(state.clone()).with_state(state)
    }

    fn pr_event(action: &str, number: u64) -> Vec<u8> {
        json!({
            "action": action,
            "pull_request": {
                "number": number,
                "title": "Add x",
                "merged": action == "merged",
                "user": { "login": "octocat" },
                "head": {
                    "ref": "feat/x",
                    "sha": "abc123def456abc123def456abc123def456abcd",
                    "repo": {
                        "clone_url": "https://example.test/u/r.git",
                        "full_name": "example/repo"
                    }
                }
            },
            "repository": {
                "full_name": "example/repo",
                "clone_url": "https://example.test/u/r.git"
            },
            "installation": { "id": 1234 }
        })
        .to_string()
        .into_bytes()
    }

    async fn post_event(
        state: &Arc<AppState>,
        event: &str,
        body: Vec<u8>,
        signature: Option<String>,
    ) -> (StatusCode, serde_json::Value) {
        let signature = signature.unwrap_or_else(|| sign(&body));
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/webhooks/github")
            .header("content-type", "application/json")
            .header(EVENT_HEADER, event)
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[test]
    fn signature_verification_round_trips() {
        let body = b"{\"action\":\"opened\"}";
        let signature = sign(body);
        assert!(verify_signature(SECRET, body, &signature));
        assert!(!verify_signature("other-secret", body, &signature));
        assert!(!verify_signature(SECRET, b"tampered", &signature));
    }

    #[test]
    fn malformed_signature_headers_fail_fast() {
        let body = b"{}";
        assert!(!verify_signature(SECRET, body, "deadbeef"));
        assert!(!verify_signature(SECRET, body, "sha256=nothex"));
        // Wrong-length digest rejected before comparison.
        assert!(!verify_signature(SECRET, body, "sha256=dead"));
        assert!(!verify_signature(SECRET, body, ""));
    }

    /// S1 (ingress half): a signed `opened` event is accepted, the record
    /// is created, and a priority-1 build job is queued.
    #[tokio::test]
    async fn opened_event_is_accepted_and_enqueued() {
        let state = test_state();
        let (status, body) = post_event(&state, "pull_request", pr_event("opened", 42), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");

        let record = state.store.get(42).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Building);
        assert_eq!(record.branch, "feat/x");
        assert_eq!(record.clone_url, "https://example.test/u/r.git");

        let job = state.queue.reserve().await.unwrap().unwrap();
        assert_eq!(job.kind, JobKind::BuildContainer);
        assert_eq!(job.priority, 1);
        // The clone URL travels sealed, not in the clear.
        assert!(job.payload.get("clone_url").unwrap().get("ciphertext").is_some());
        let raw = job.payload.to_string();
        assert!(!raw.contains("https://example.test/u/r.git"));
    }

    /// S2: close on an unknown PR is an ignored no-op.
    #[tokio::test]
    async fn close_on_unknown_pr_is_no_deployment() {
        let state = test_state();
        let (status, body) = post_event(&state, "pull_request", pr_event("closed", 999), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ignored");
        assert_eq!(body["reason"], "no-deployment");
        assert!(state.store.get(999).await.unwrap().is_none());
        assert_eq!(state.queue.stats().await.unwrap().waiting, 0);
    }

    /// S3: a bad signature yields 401 and leaves no trace.
    #[tokio::test]
    async fn bad_signature_is_rejected_with_no_side_effects() {
        let state = test_state();
        let (status, body) = post_event(
            &state,
            "pull_request",
            pr_event("opened", 42),
            Some(format!("sha256={}", "de".repeat(32))),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["reason"], "signature-invalid");
        assert!(state.store.get(42).await.unwrap().is_none());
        assert_eq!(state.queue.stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn missing_signature_header_is_unauthorized() {
        let state = test_state();
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/webhooks/github")
            .header(EVENT_HEADER, "pull_request")
            .body(Body::from(pr_event("opened", 42)))
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_verification() {
        let state = test_state();
        let body = vec![b'x'; MAX_BODY_BYTES + 1];
        // Deliberately unsigned: the cap must trip first.
        let (status, resp) = post_event(
            &state,
            "pull_request",
            body,
            Some("sha256=unchecked".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(resp["reason"], "payload-too-large");
    }

    #[tokio::test]
    async fn non_pull_request_events_are_ignored() {
        let state = test_state();
        let (status, body) = post_event(&state, "push", pr_event("opened", 42), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ignored");
        assert!(state.store.get(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_actions_are_ignored() {
        let state = test_state();
        let (status, body) =
            post_event(&state, "pull_request", pr_event("labeled", 42), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reason"], "unsupported-action");
    }

    /// §5 ordering: a second `opened` while the first build is in flight
    /// is coalesced with a state-conflict, not allowed to corrupt it.
    #[tokio::test]
    async fn duplicate_opened_during_build_is_a_state_conflict() {
        let state = test_state();
        let (status, _) = post_event(&state, "pull_request", pr_event("opened", 42), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = post_event(&state, "pull_request", pr_event("opened", 42), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "state-conflict");
    }

    /// Re-delivery of an identical `opened` for a PR that is already
    /// `running` requeues the same record (one record, one new build job)
    /// instead of minting a duplicate.
    #[tokio::test]
    async fn opened_on_running_deployment_requeues_it() {
        let state = test_state();
        let (status, _) = post_event(&state, "pull_request", pr_event("opened", 42), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let build_job = state.queue.reserve().await.unwrap().unwrap();
        state.queue.complete(&build_job.id).await.unwrap();
        state
            .store
            .transition(42, DeploymentStatus::Running, |rec| {
                rec.container_id = Some("abc123def456".into());
                rec.host_port = Some(5001);
            })
            .await
            .unwrap();

        let (status, body) = post_event(&state, "pull_request", pr_event("opened", 42), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");

        let records = state.store.list().await.unwrap();
        assert_eq!(records.len(), 1, "requeue must not duplicate the record");
        assert_eq!(records[0].status, DeploymentStatus::Building);
        assert_eq!(state.queue.stats().await.unwrap().waiting, 1);
    }

    /// Destroy path: a running deployment is promoted to `destroying` and
    /// a priority-2 destroy job carries its container id.
    #[tokio::test]
    async fn close_on_running_deployment_enqueues_destroy() {
        let state = test_state();
        let (status, _) = post_event(&state, "pull_request", pr_event("opened", 42), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        // Drain the build job, then simulate the build finishing.
        let build_job = state.queue.reserve().await.unwrap().unwrap();
        state.queue.complete(&build_job.id).await.unwrap();
        state
            .store
            .transition(42, DeploymentStatus::Running, |rec| {
                rec.container_id = Some("abc123def456".into());
                rec.host_port = Some(5001);
            })
            .await
            .unwrap();

        let (status, body) = post_event(&state, "pull_request", pr_event("closed", 42), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");

        let record = state.store.get(42).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Destroying);

        let job = state.queue.reserve().await.unwrap().unwrap();
        assert_eq!(job.kind, JobKind::DestroyContainer);
        assert_eq!(job.priority, 2);
        assert_eq!(job.payload["container_id"], "abc123def456");
    }

    /// A record that never got a container (still queued/failed early)
    /// also reports `no-deployment` on close.
    #[tokio::test]
    async fn close_without_container_is_no_deployment() {
        let state = test_state();
        let (status, _) = post_event(&state, "pull_request", pr_event("opened", 42), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = post_event(&state, "pull_request", pr_event("closed", 42), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reason"], "no-deployment");
    }
}
