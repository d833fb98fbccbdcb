//! Destroy executor: best-effort teardown with aggregated failure
//! accounting.
//!
//! Every step runs even when an earlier one failed; errors are collected
//! and reported together. Container removal is the bar that matters:
//! once the container is gone the record is deleted, and leftover image
//! or tunnel trouble is only logged as `destroy-partial`.

use envzilla_core::{
    container_name, image_tag_prefix, is_valid_container_id, DestroyJobPayload, ErrorKind,
    ExecError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::JobProgress;
use crate::AppState;

/// Graceful stop window before the engine escalates inside the container.
const STOP_GRACE: Duration = Duration::from_secs(30);
/// Engine call budget for the stop itself (grace plus engine overhead).
const STOP_TIMEOUT: Duration = Duration::from_secs(35);
/// Engine call budget for each removal attempt.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(15);
/// Engine call budget for lookups (inspect, ps, images).
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn execute(
    state: Arc<AppState>,
    payload: DestroyJobPayload,
    progress: &JobProgress,
) -> Result<(), ExecError> {
    let pr = payload.pr_number;
    let name = container_name(pr);
    let mut errors: Vec<String> = Vec::new();

    // Malformed ids never reach the engine.
    let direct_target = match payload.container_id.as_deref() {
        Some(id) if !id.is_empty() => {
            if !is_valid_container_id(id) {
                return Err(ExecError::new(
                    ErrorKind::InvalidContainerId,
                    format!("refusing to destroy container with malformed id {id:?}"),
                ));
            }
            Some(id.to_string())
        }
        _ => None,
    };
    progress.report(10).await;

    let containers: Vec<String> = match &direct_target {
        Some(id) => vec![id.clone()],
        None => match state.engine.containers_named(&name, LOOKUP_TIMEOUT).await {
            Ok(found) => found,
            Err(e) => {
                errors.push(format!("enumerate {name}: {e}"));
                Vec::new()
            }
        },
    };

    // Resolve images before the containers disappear.
    let mut images: Vec<String> = Vec::new();
    if payload.remove_images {
        for container in &containers {
            match state.engine.image_of(container, LOOKUP_TIMEOUT).await {
                Ok(image) => images.push(image),
                Err(e) => errors.push(format!("inspect {container}: {e}")),
            }
        }
    }
    progress.report(25).await;

    // Stop, then remove; a failed remove escalates to a forced remove.
    let mut containers_removed = 0usize;
    for container in &containers {
        if let Err(e) = state
            .engine
            .stop(container, STOP_GRACE, STOP_TIMEOUT)
            .await
        {
            warn!("graceful stop of {container} failed: {e}");
        }
        match state.engine.remove(container, false, REMOVE_TIMEOUT).await {
            Ok(()) => containers_removed += 1,
            Err(first) => match state.engine.remove(container, true, REMOVE_TIMEOUT).await {
                Ok(()) => containers_removed += 1,
                Err(second) => {
                    errors.push(format!("remove {container}: {first}; forced: {second}"));
                }
            },
        }
    }
    progress.report(50).await;

    // Image cleanup: the inspected images plus anything tagged for this PR.
    if payload.remove_images {
        match state
            .engine
            .images_with_prefix(&image_tag_prefix(pr), LOOKUP_TIMEOUT)
            .await
        {
            Ok(tagged) => images.extend(tagged),
            Err(e) => errors.push(format!("list images: {e}")),
        }
        images.sort();
        images.dedup();
        for image in &images {
            if let Err(e) = state.engine.remove_image(image, REMOVE_TIMEOUT).await {
                errors.push(format!("rmi {image}: {e}"));
            }
        }
    }
    progress.report(70).await;

    // Residual sweep: anything still wearing the preview name goes too.
    let mut residual_failures = 0usize;
    match state.engine.containers_named(&name, LOOKUP_TIMEOUT).await {
        Ok(residuals) => {
            for container in residuals {
                match state.engine.remove(&container, true, REMOVE_TIMEOUT).await {
                    Ok(()) => containers_removed += 1,
                    Err(e) => {
                        residual_failures += 1;
                        errors.push(format!("residual remove {container}: {e}"));
                    }
                }
            }
        }
        Err(e) => errors.push(format!("residual sweep: {e}")),
    }
    progress.report(85).await;

    // Tunnel teardown is independent of engine outcomes.
    state.tunnels.stop(pr).await;
    progress.report(90).await;

    // Container removal (or there being nothing to remove) is the bar for
    // dropping the record; lesser failures are reported but not fatal.
    let container_gone =
        residual_failures == 0 && (containers.is_empty() || containers_removed > 0);
    if container_gone {
        if !errors.is_empty() {
            warn!(
                "destroy-partial for pr {pr}, record dropped anyway: {}",
                errors.join("; ")
            );
        }
        match state.store.delete(pr).await {
            Ok(_) => info!("preview for pr {pr} destroyed"),
            Err(e) => {
                return Err(ExecError::new(
                    ErrorKind::Internal,
                    format!("container removed but record delete failed: {e}"),
                ))
            }
        }
        Ok(())
    } else {
        Err(ExecError::new(
            ErrorKind::DestroyPartial,
            errors.join("; "),
        ))
    }
}
