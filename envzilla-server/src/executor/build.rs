//! Build executor: clone → image build → port → run → readiness → tunnel
//! → verification → record finalization → comment.
//!
//! Fatal steps return a classified error after compensating the artifacts
//! acquired so far (clone dir, dangling image, half-started container,
//! reserved port). Readiness, tunnel verification, and the comment are
//! warnings: they never fail the job.

use chrono::Utc;
use envzilla_core::{
    container_name, image_tag, BuildJobPayload, DeploymentStatus, ErrorKind, ExecError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::JobProgress;
use crate::gitops;
use crate::store::StoreError;
use crate::tunnel::{verify_public_url, VerifyPolicy};
use crate::AppState;

/// Engine reachability probe timeout (step 1).
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for best-effort compensation calls.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-request timeout for local readiness probes.
const READY_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn store_err(e: StoreError) -> ExecError {
    match e {
        StoreError::Conflict { .. } => ExecError::new(ErrorKind::StateConflict, e.to_string()),
        StoreError::NotFound(_) => ExecError::new(ErrorKind::StateConflict, e.to_string()),
        StoreError::Storage(msg) => ExecError::new(ErrorKind::Internal, msg),
    }
}

pub async fn execute(
    state: Arc<AppState>,
    payload: BuildJobPayload,
    progress: &JobProgress,
) -> Result<(), ExecError> {
    let pr = payload.pr_number;

    // Worker entry: the record enters (or re-enters, on retry) `building`.
    state
        .store
        .transition(pr, DeploymentStatus::Building, |rec| {
            rec.build_started_at = Some(Utc::now());
            rec.last_error = None;
        })
        .await
        .map_err(store_err)?;
    progress.report(5).await;

    // Sensitive fields travel sealed; open them just before use.
    let clone_url = state
        .cipher
        .open_str(&payload.clone_url)
        .map_err(|e| ExecError::new(ErrorKind::DecryptError, e.to_string()))?;
    let commit_sha = state
        .cipher
        .open_str(&payload.commit_sha)
        .map_err(|e| ExecError::new(ErrorKind::DecryptError, e.to_string()))?;

    // 1. Pre-flight: is the engine even there?
    state
        .engine
        .version(PREFLIGHT_TIMEOUT)
        .await
        .map_err(|e| ExecError::new(ErrorKind::EngineUnavailable, e.to_string()))?;
    progress.report(10).await;

    // 2. Shallow clone. The temp dir removes itself on every exit path.
    let repo = gitops::shallow_clone(
        &clone_url,
        &payload.branch,
        pr,
        &state.config.tmp_root,
        state.config.clone_timeout,
    )
    .await?;
    progress.report(25).await;

    // 3. Image build with a fresh monotonic tag.
    let tag = image_tag(pr, Utc::now().timestamp().max(0) as u64);
    let checkout = gitops::checkout_path(&repo);
    if let Err(e) = state
        .engine
        .build_image(
            &checkout,
            &state.config.build_file,
            &tag,
            state.config.build_timeout,
        )
        .await
    {
        let _ = state.engine.remove_image(&tag, CLEANUP_TIMEOUT).await;
        return Err(ExecError::new(ErrorKind::BuildFailed, e.to_string()));
    }
    drop(repo); // clone dir no longer needed once the image exists
    progress.report(50).await;

    // 4. Free host port, excluding ports held by running deployments.
    let in_use = state.store.ports_in_use().await.map_err(store_err)?;
    let host_port = match state.ports.allocate(&in_use).await {
        Ok(port) => port,
        Err(e) => {
            let _ = state.engine.remove_image(&tag, CLEANUP_TIMEOUT).await;
            return Err(e);
        }
    };
    progress.report(55).await;

    // 5. Run detached. A stale container with our name (from an earlier
    // half-run) is removed first.
    let name = container_name(pr);
    let _ = state.engine.remove(&name, true, CLEANUP_TIMEOUT).await;
    let container_id = match state
        .engine
        .run_detached(
            &tag,
            &name,
            host_port,
            state.config.container_port,
            state.config.run_timeout,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => {
            let _ = state.engine.remove(&name, true, CLEANUP_TIMEOUT).await;
            let _ = state.engine.remove_image(&tag, CLEANUP_TIMEOUT).await;
            state.ports.release(host_port);
            return Err(ExecError::new(ErrorKind::RunFailed, e.to_string()));
        }
    };
    progress.report(65).await;

    // 6. Readiness. Failure here is a warning: the tunnel may still come
    // up while the app finishes booting.
    if !wait_until_ready(&state, &container_id, host_port).await {
        warn!(
            "readiness-timeout: pr {pr} container {container_id} not ready after {} probes",
            state.config.service_ready_attempts
        );
    }
    progress.report(75).await;

    // 7. Tunnel. Failure keeps the local URL.
    let local_url = format!("http://127.0.0.1:{host_port}");
    let tunnel_url = match state.tunnels.start(pr, host_port).await {
        Ok(url) => Some(url),
        Err(e) => {
            warn!("tunnel-failed for pr {pr}, keeping local URL: {e}");
            None
        }
    };
    progress.report(85).await;

    // 8. Two-phase verification of the public URL; unverified is a warning.
    let mut verified = true;
    if let Some(url) = &tunnel_url {
        let policy = VerifyPolicy {
            get_attempts: state.config.preview_url_attempts,
            base_delay: state.config.preview_url_delay,
            delay_cap: Duration::from_secs(15),
            request_timeout: state.config.preview_url_request_timeout,
        };
        verified = verify_public_url(&state.http, url, &policy).await;
        if !verified {
            warn!("tunnel-unverified: {url} for pr {pr} never answered, continuing");
        }
    }
    progress.report(90).await;

    // 9. Finalize the record.
    let preview_url = tunnel_url.clone().unwrap_or_else(|| local_url.clone());
    let record_url = preview_url.clone();
    let container_for_record = container_id.clone();
    let image_for_record = tag.clone();
    state
        .store
        .transition(pr, DeploymentStatus::Running, move |rec| {
            rec.container_id = Some(container_for_record.clone());
            rec.host_port = Some(host_port);
            rec.image_ref = Some(image_for_record.clone());
            rec.tunnel_url = Some(record_url.clone());
            rec.build_completed_at = Some(Utc::now());
            rec.last_error = None;
        })
        .await
        .map_err(store_err)?;
    progress.report(95).await;

    // 10. Best-effort PR comment.
    if let Some(forge) = &state.forge {
        let content = format_preview_comment(
            pr,
            &payload.branch,
            &commit_sha,
            &preview_url,
            host_port,
            &container_id,
            verified,
        );
        if let Err(e) = forge
            .upsert_preview_comment(
                payload.installation_id,
                &payload.repo_full_name,
                pr,
                &content,
            )
            .await
        {
            warn!("comment-failed for pr {pr}: {e}");
        }
    } else {
        info!("forge credentials not configured, skipping comment for pr {pr}");
    }

    info!("preview for pr {pr} is running at {preview_url}");
    Ok(())
}

/// Probe until the container answers. Prefers the engine-level health
/// status when the image defines one; otherwise any non-5xx HTTP response
/// on the bound port counts as ready.
async fn wait_until_ready(state: &AppState, container_id: &str, host_port: u16) -> bool {
    let url = format!("http://127.0.0.1:{host_port}/");
    for attempt in 0..state.config.service_ready_attempts {
        if attempt > 0 {
            tokio::time::sleep(state.config.service_ready_delay).await;
        }

        if let Ok(Some(status)) = state
            .engine
            .health_status(container_id, state.config.container_health_timeout)
            .await
        {
            if status == "healthy" {
                return true;
            }
            // Defined but not yet healthy: fall through to the HTTP probe.
        }

        let responded = state
            .http
            .get(&url)
            .timeout(READY_REQUEST_TIMEOUT)
            .send()
            .await
            .map(|resp| !resp.status().is_server_error())
            .unwrap_or(false);
        if responded {
            return true;
        }
    }
    false
}

fn format_preview_comment(
    pr_number: u64,
    branch: &str,
    commit_sha: &str,
    preview_url: &str,
    host_port: u16,
    container_id: &str,
    verified: bool,
) -> String {
    let short_sha = &commit_sha[..commit_sha.len().min(12)];
    let availability = if verified {
        "The preview is live.".to_string()
    } else {
        "The preview URL may still be propagating; give it a minute before retrying.".to_string()
    };
    format!(
        "🚀 **Preview environment ready**\n\n\
        {availability}\n\n\
        **URL:** {preview_url}\n\
        **Branch:** `{branch}`\n\
        **Commit:** `{short_sha}`\n\
        **Host port:** `{host_port}`\n\
        **Container:** `{container_id}`\n\n\
        This environment is rebuilt on every push and removed when PR #{pr_number} closes."
    )
}
