//! Stable error taxonomy shared by the dispatcher, queue, and executors.
//!
//! Every failure that can surface in a deployment record's `last_error`
//! or in logs is identified by one of these kinds. The string forms are
//! stable identifiers; operators grep for them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classified failure kinds.
///
/// Three classes matter operationally:
/// - fatal kinds fail the job (and may retry, see [`ErrorKind::is_retryable`]),
/// - warning kinds (`readiness-timeout`, `tunnel-unverified`, `comment-failed`)
///   are logged on an otherwise successful job,
/// - `state-conflict` is surfaced at the HTTP boundary and never enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    SignatureInvalid,
    PayloadTooLarge,
    DecryptError,
    StateConflict,
    EngineUnavailable,
    CloneFailed,
    BuildFailed,
    NoFreePort,
    RunFailed,
    ReadinessTimeout,
    TunnelFailed,
    TunnelUnverified,
    CommentFailed,
    InvalidContainerId,
    DestroyPartial,
    QueueStalled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SignatureInvalid => "signature-invalid",
            ErrorKind::PayloadTooLarge => "payload-too-large",
            ErrorKind::DecryptError => "decrypt-error",
            ErrorKind::StateConflict => "state-conflict",
            ErrorKind::EngineUnavailable => "engine-unavailable",
            ErrorKind::CloneFailed => "clone-failed",
            ErrorKind::BuildFailed => "build-failed",
            ErrorKind::NoFreePort => "no-free-port",
            ErrorKind::RunFailed => "run-failed",
            ErrorKind::ReadinessTimeout => "readiness-timeout",
            ErrorKind::TunnelFailed => "tunnel-failed",
            ErrorKind::TunnelUnverified => "tunnel-unverified",
            ErrorKind::CommentFailed => "comment-failed",
            ErrorKind::InvalidContainerId => "invalid-container-id",
            ErrorKind::DestroyPartial => "destroy-partial",
            ErrorKind::QueueStalled => "queue-stalled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a job failing with this kind may be re-attempted by the queue.
    ///
    /// Non-retryable kinds are deterministic: re-running the job cannot
    /// change the outcome (bad ciphertext stays bad, a malformed container
    /// id stays malformed).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::InvalidContainerId
                | ErrorKind::DecryptError
                | ErrorKind::SignatureInvalid
        )
    }

    /// Warning kinds never fail the job they occur in.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            ErrorKind::ReadinessTimeout | ErrorKind::TunnelUnverified | ErrorKind::CommentFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified executor failure: a stable kind plus free-form detail.
///
/// The `Display` form (`<kind>: <detail>`) is what lands in
/// `DeploymentRecord::last_error`, so the kind identifier is always the
/// prefix.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct ExecError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ExecError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_kebab_case_and_stable() {
        assert_eq!(ErrorKind::EngineUnavailable.as_str(), "engine-unavailable");
        assert_eq!(ErrorKind::NoFreePort.as_str(), "no-free-port");
        assert_eq!(ErrorKind::InvalidContainerId.as_str(), "invalid-container-id");
    }

    #[test]
    fn serde_form_matches_as_str() {
        let json = serde_json::to_string(&ErrorKind::CloneFailed).unwrap();
        assert_eq!(json, "\"clone-failed\"");
        let back: ErrorKind = serde_json::from_str("\"tunnel-failed\"").unwrap();
        assert_eq!(back, ErrorKind::TunnelFailed);
    }

    #[test]
    fn non_retryable_kinds_bypass_retry() {
        assert!(!ErrorKind::DecryptError.is_retryable());
        assert!(!ErrorKind::InvalidContainerId.is_retryable());
        assert!(!ErrorKind::SignatureInvalid.is_retryable());
        assert!(ErrorKind::CloneFailed.is_retryable());
        assert!(ErrorKind::BuildFailed.is_retryable());
    }

    #[test]
    fn warnings_never_include_fatal_kinds() {
        for kind in [
            ErrorKind::ReadinessTimeout,
            ErrorKind::TunnelUnverified,
            ErrorKind::CommentFailed,
        ] {
            assert!(kind.is_warning());
        }
        assert!(!ErrorKind::BuildFailed.is_warning());
        assert!(!ErrorKind::DestroyPartial.is_warning());
    }

    #[test]
    fn exec_error_display_is_kind_prefixed() {
        let err = ExecError::new(ErrorKind::BuildFailed, "exit status 1");
        assert_eq!(err.to_string(), "build-failed: exit status 1");
    }
}
