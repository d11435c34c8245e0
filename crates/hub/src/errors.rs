//! Error taxonomy and retry-policy types for the control plane.
//!
//! [`RemoteError`] is what a [`crate::RemoteClient`] returns when a node call
//! fails. [`HubError`] is what the aggregation engine surfaces to its callers:
//! every remote failure plus the registry and request-validation conditions.
//!
//! Every error maps onto a stable [`ErrorKind`] so that the HTTP edge can tell
//! callers *which* kind of failure happened, not just that one did.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::NodeId;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Adapters consult this for idempotent reads only. Mutating calls
/// (`start_job`, `delete_build`, ...) are never retried regardless of policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Stable, wire-visible classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The node did not respond within the call timeout.
    Unreachable,
    /// The node rejected the supplied credentials.
    AuthRejected,
    /// A node, view, job, or build id is unknown.
    NotFound,
    /// The remote system returned a domain error.
    RemoteError,
    /// Registry conflict.
    Duplicate,
    /// The request itself is malformed or references an unsupported node kind.
    InvalidRequest,
    /// The durable node store failed.
    Storage,
}

impl ErrorKind {
    /// Returns the snake_case wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::AuthRejected => "auth_rejected",
            Self::NotFound => "not_found",
            Self::RemoteError => "remote_error",
            Self::Duplicate => "duplicate",
            Self::InvalidRequest => "invalid_request",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Remote (adapter) errors
// ---------------------------------------------------------------------------

/// Typed failure of a single adapter call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Connection refused, DNS failure, or no response within the timeout.
    #[error("node unreachable: {message}")]
    Unreachable {
        /// Transport-level description (never contains credentials).
        message: String,
    },

    /// HTTP 401/403 or the remote's equivalent.
    #[error("credentials rejected by node")]
    AuthRejected,

    /// The addressed view, job, build, or stage does not exist on the node.
    #[error("not found on node: {what}")]
    NotFound {
        /// What was being looked up (e.g. `"job deploy"`).
        what: String,
    },

    /// The remote system answered with an error of its own.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Remote status code (HTTP status for HTTP-based adapters).
        code: u16,
        /// Message reported by the remote, truncated by the adapter.
        message: String,
    },
}

impl RemoteError {
    /// Shorthand for an [`RemoteError::Unreachable`] with the given message.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
        }
    }

    /// Shorthand for a [`RemoteError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Returns the wire classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable { .. } => ErrorKind::Unreachable,
            Self::AuthRejected => ErrorKind::AuthRejected,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Remote { .. } => ErrorKind::RemoteError,
        }
    }

    /// Whether an idempotent call that failed this way may be repeated.
    ///
    /// Only transport failures are retryable; a node that answered (even with
    /// a 5xx) has made its decision.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Unreachable { .. } => RetryPolicy::Retryable { after: None },
            _ => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Failure of the durable node store behind [`crate::NodeStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing medium failed.
    #[error("node store I/O failed: {message}")]
    Io {
        /// Description of the I/O failure.
        message: String,
    },

    /// A stored entry could not be encoded or decoded.
    #[error("node store entry is malformed: {message}")]
    Malformed {
        /// Description of the encoding failure.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Engine-level errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the aggregation engine to its callers.
#[derive(Debug, Error)]
pub enum HubError {
    /// An adapter call failed (or timed out, which is reported as unreachable).
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// No node with this id is registered.
    #[error("node {id} is not registered")]
    NodeNotFound {
        /// The id that was looked up.
        id: NodeId,
    },

    /// Another node is already registered for the same endpoint.
    #[error("a node for {account}@{host}:{port} is already registered")]
    Duplicate {
        /// Conflicting host.
        host: String,
        /// Conflicting port.
        port: u16,
        /// Conflicting account.
        account: String,
    },

    /// The request is malformed or cannot be routed.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What is wrong with the request.
        message: String,
    },

    /// The durable node store failed; the registry was not changed.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl HubError {
    /// Shorthand for an [`HubError::InvalidRequest`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Returns the wire classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(e) => e.kind(),
            Self::NodeNotFound { .. } => ErrorKind::NotFound,
            Self::Duplicate { .. } => ErrorKind::Duplicate,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Returns `true` if this is a remote transport failure.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::Unreachable { .. }))
    }
}

// ---------------------------------------------------------------------------
// Wire annotation
// ---------------------------------------------------------------------------

/// Serialisable description of a failure: the kind plus a human message.
///
/// Used both as the `data` of a failed response and as the warning attached
/// to stale reads and per-node fan-out entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNote {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl From<&HubError> for ErrorNote {
    fn from(err: &HubError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<&RemoteError> for ErrorNote {
    fn from(err: &RemoteError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert_eq!(
            RemoteError::unreachable("connection refused").retry_policy(),
            RetryPolicy::Retryable { after: None }
        );
        assert_eq!(RemoteError::AuthRejected.retry_policy(), RetryPolicy::NonRetryable);
        assert_eq!(
            RemoteError::Remote {
                code: 503,
                message: "maintenance".into()
            }
            .retry_policy(),
            RetryPolicy::NonRetryable
        );
    }

    #[test]
    fn hub_errors_keep_the_remote_kind() {
        let err = HubError::from(RemoteError::not_found("job deploy"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_unreachable());
        assert!(HubError::from(RemoteError::unreachable("timeout")).is_unreachable());
    }

    #[test]
    fn error_notes_serialise_kind_in_snake_case() {
        let note = ErrorNote::from(&HubError::from(RemoteError::AuthRejected));
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["kind"], "auth_rejected");
        assert_eq!(json["message"], "credentials rejected by node");
    }
}
