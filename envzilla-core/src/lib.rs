pub mod container;
pub mod error;
pub mod job;
pub mod record;
pub mod sealed;

pub use container::{container_name, image_tag, image_tag_prefix, is_valid_container_id};
pub use error::{ErrorKind, ExecError};
pub use job::{BuildJobPayload, CleanupJobPayload, DestroyJobPayload, JobKind};
pub use record::{DeploymentRecord, DeploymentStatus, PrMetadata};
pub use sealed::{PayloadCipher, SealError, Sealed};

/// Returns the controller version as baked in at compile time.
pub fn get_library_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
