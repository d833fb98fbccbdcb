//! Read-side and admin HTTP handlers: deployment listings, the manual
//! sweep trigger, and queue/job inspection.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::queue::JobQueue;
use crate::sweeper;
use crate::AppState;

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deployments", get(list_deployments))
        .route("/deployments/:pr", get(get_deployment))
        .route("/admin/cleanup", post(trigger_cleanup))
        .route("/admin/queue/stats", get(queue_stats))
        .route("/admin/jobs/:id", get(get_job))
}

async fn list_deployments(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list().await {
        Ok(mut records) => {
            records.sort_by_key(|r| r.pr_number);
            Json(json!({ "count": records.len(), "deployments": records })).into_response()
        }
        Err(e) => {
            error!("listing deployments failed: {e}");
            internal_error()
        }
    }
}

async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(pr): Path<u64>,
) -> Response {
    match state.store.get(pr).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no deployment for pr {pr}") })),
        )
            .into_response(),
        Err(e) => {
            error!("reading deployment {pr} failed: {e}");
            internal_error()
        }
    }
}

#[derive(Debug, Deserialize)]
struct CleanupParams {
    /// Override the age threshold, in hours.
    #[serde(rename = "maxAge")]
    max_age: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CleanupResult {
    reaped: usize,
    max_age_hours: u64,
}

async fn trigger_cleanup(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CleanupParams>,
) -> Response {
    let max_age = params
        .max_age
        .map(|hours| Duration::from_secs(hours * 3600))
        .unwrap_or(state.config.sweep_max_age);

    match sweeper::sweep_once(&state, max_age).await {
        Ok(reaped) => Json(CleanupResult {
            reaped,
            max_age_hours: max_age.as_secs() / 3600,
        })
        .into_response(),
        Err(e) => {
            error!("manual cleanup failed: {e}");
            internal_error()
        }
    }
}

async fn queue_stats(State(state): State<Arc<AppState>>) -> Response {
    match state.queue.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!("queue stats failed: {e}");
            internal_error()
        }
    }
}

async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.queue.get(&id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no job {id}") })),
        )
            .into_response(),
        Err(e) => {
            error!("reading job {id} failed: {e}");
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal" })),
    )
        .into_response()
}
