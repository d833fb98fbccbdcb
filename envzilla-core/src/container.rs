//! Naming conventions and id validation for preview containers.

/// Container name for a PR's preview: `preview-<N>`.
pub fn container_name(pr_number: u64) -> String {
    format!("preview-{pr_number}")
}

/// Image tag for a PR's build: `preview-pr-<N>:<monotonic>`.
///
/// The monotonic component keeps rebuild tags distinct so a failed build
/// can be garbage-collected without touching a still-running image.
pub fn image_tag(pr_number: u64, monotonic: u64) -> String {
    format!("preview-pr-{pr_number}:{monotonic}")
}

/// Repository part of a PR's image tags, used as a removal prefix.
pub fn image_tag_prefix(pr_number: u64) -> String {
    format!("preview-pr-{pr_number}")
}

/// Validate a container id before it is handed to the engine.
///
/// Accepts a full 64-hex-char id, or a prefix id of 3 to 64 alphanumeric
/// characters. Anything else must be rejected without contacting the
/// engine (`invalid-container-id`).
pub fn is_valid_container_id(id: &str) -> bool {
    if id.len() == 64 {
        return id.chars().all(|c| c.is_ascii_hexdigit());
    }
    (3..=64).contains(&id.len()) && id.chars().all(|c| c.is_ascii_alphanumeric())
}
