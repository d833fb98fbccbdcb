//! System health snapshot.
//!
//! Served at `/health` (200 healthy / 206 degraded / 503 unhealthy) and
//! refreshed on demand; the classification is pure so it can be tested
//! without an engine.

use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use envzilla_core::DeploymentStatus;

use crate::AppState;

const ENGINE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthLevel,
    pub engine_reachable: bool,
    /// Record counts keyed by deployment status.
    pub deployments: BTreeMap<&'static str, usize>,
    pub memory_used_percent: f64,
    pub uptime_secs: u64,
    pub version: String,
}

/// `unhealthy` when more previews are failed than running; `degraded`
/// when the engine is down or host memory is above 90%; `healthy`
/// otherwise.
pub fn classify(
    engine_reachable: bool,
    memory_used_percent: f64,
    failed: usize,
    running: usize,
) -> HealthLevel {
    if failed > running {
        HealthLevel::Unhealthy
    } else if !engine_reachable || memory_used_percent > 90.0 {
        HealthLevel::Degraded
    } else {
        HealthLevel::Healthy
    }
}

/// Host memory usage from /proc/meminfo; 0.0 where unavailable.
fn memory_used_percent() -> f64 {
    let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else {
        return 0.0;
    };
    let field = |name: &str| -> Option<f64> {
        contents
            .lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse::<f64>()
            .ok()
    };
    match (field("MemTotal:"), field("MemAvailable:")) {
        (Some(total), Some(available)) if total > 0.0 => {
            ((total - available) / total * 100.0).clamp(0.0, 100.0)
        }
        _ => 0.0,
    }
}

pub async fn snapshot(state: &AppState) -> HealthSnapshot {
    let engine_reachable = state.engine.version(ENGINE_PROBE_TIMEOUT).await.is_ok();

    let mut deployments: BTreeMap<&'static str, usize> = BTreeMap::new();
    if let Ok(counts) = state.store.counts_by_status().await {
        for (status, count) in counts {
            deployments.insert(status.as_str(), count);
        }
    }
    let failed = *deployments
        .get(DeploymentStatus::Failed.as_str())
        .unwrap_or(&0);
    let running = *deployments
        .get(DeploymentStatus::Running.as_str())
        .unwrap_or(&0);

    let memory = memory_used_percent();
    HealthSnapshot {
        status: classify(engine_reachable, memory, failed, running),
        engine_reachable,
        deployments,
        memory_used_percent: memory,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: crate::get_server_version(),
    }
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = snapshot(&state).await;
    let code = match snapshot.status {
        HealthLevel::Healthy => StatusCode::OK,
        HealthLevel::Degraded => StatusCode::PARTIAL_CONTENT,
        HealthLevel::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(snapshot))
}
