//! Error types for the trust root controller
//!
//! Every error is scoped to a single reconciliation pass. Conflicts are
//! retried locally by [`crate::retry::retry_on_conflict`] and only escape
//! once the retry budget is exhausted.

use thiserror::Error;

/// Main error type for trust root reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that is neither a conflict nor a missing object
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic-concurrency collision on a conditional write
    #[error("conflict updating {kind} {name}")]
    Conflict {
        /// Resource kind (e.g. "Secret")
        kind: String,
        /// Resource name, namespaced as `namespace/name` when applicable
        name: String,
    },

    /// Referenced resource does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "MutatingWebhookConfiguration")
        kind: String,
        /// Resource name, namespaced as `namespace/name` when applicable
        name: String,
    },

    /// CA or leaf certificate issuance failed
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// Stored certificate could not be read when it was required
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Trust secret lacks a required key
    #[error("missing {field} field in {secret} secret")]
    MissingField {
        /// Secret name
        secret: String,
        /// Data key that was expected
        field: String,
    },

    /// A consumer resource update failed after exhausting retries
    #[error("failed to propagate CA bundle to {target}: {source}")]
    Propagation {
        /// Human readable target, e.g. "ValidatingWebhookConfiguration/foo"
        target: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Sibling fleet could not be identified
    #[error("fleet discovery failed: {0}")]
    Discovery(String),

    /// Invalid configuration input
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a conflict error for the given resource
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a not-found error for the given resource
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a generation error with the given message
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Create a certificate error with the given message
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create a discovery error with the given message
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Wrap an error as a propagation failure for `target`
    pub fn propagation(target: impl Into<String>, source: Error) -> Self {
        Self::Propagation {
            target: target.into(),
            source: Box::new(source),
        }
    }

    /// Whether this is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether the referenced resource was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Translate a kube API error, keeping 409 and 404 distinguishable
    pub fn from_api(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref e) if e.code == 409 => Self::conflict(kind, name),
            kube::Error::Api(ref e) if e.code == 404 => Self::not_found(kind, name),
            other => Self::Kube(other),
        }
    }
}
