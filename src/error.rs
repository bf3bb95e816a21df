// SPDX-License-Identifier: BSD-3-Clause

//! Error types for kubeq.
//!
//! The taxonomy follows the request lifecycle: resolution and syntax errors
//! are reported before anything touches the network, transport errors are
//! propagated from the underlying client with "not found" kept machine
//! distinguishable, and pipeline errors abort a single chain execution only.

use std::sync::Arc;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for kubeq operations.
///
/// `Clone` so a fluent chain can hold its first error while later calls on
/// the same branch still observe it.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Unknown table/kind, ambiguous CRD match, or missing GVK on input.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Malformed SQL or selector fragment; carries the offending input.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// A resource that was looked up does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    /// Underlying Kubernetes client failure, propagated verbatim.
    #[error("kubernetes error: {0}")]
    Kube(Arc<kube::Error>),

    /// Token fetch or parse failure at the credential provider boundary.
    #[error("credential error: {0}")]
    Credential(String),

    /// A callback step failed; aborts the remaining chain for one request.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a resolution error with the given message.
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Create a syntax error with the given message.
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }

    /// Create a not-found error for the given kind and name.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a credential error with the given message.
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create a pipeline error with the given message.
    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline(msg.into())
    }

    /// Whether this error means "the resource does not exist".
    ///
    /// Covers both the explicit [`Error::NotFound`] variant and an API-level
    /// 404 from the transport, so callers (apply-or-update, existence
    /// checks) can branch without string matching.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(e) => matches!(e.as_ref(), kube::Error::Api(resp) if resp.code == 404),
            _ => false,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Self::Kube(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
