//! Error types for the controllers.
//!
//! Defines the operator's error enum with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration or user input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Metrics scrape against a pod failed
    #[error("Scrape of pod {pod} failed: {message}")]
    Scrape { pod: String, message: String },

    /// The type mapper has no storage resource for a group/kind
    #[error("No resource mapping for {group}/{kind}")]
    UnknownResourceType { group: String, kind: String },

    /// The surrounding task was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Several independent operations failed in one batch
    #[error("{} operations failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            Error::Aggregate(errors) => !errors.is_empty() && errors.iter().all(Error::is_not_found),
            _ => false,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on conflicts, rate limiting, server and transport errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_) | kube::Error::HyperError(_))
            }
            Error::Transient(_) | Error::Scrape { .. } => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_retryable),
            Error::Validation(_)
            | Error::Serialization(_)
            | Error::UnknownResourceType { .. }
            | Error::Cancelled => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_conflict() {
            Duration::from_secs(1)
        } else if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(300)
        }
    }

    /// Collapse a list of errors into `Ok`, the single error, or an aggregate.
    pub fn from_batch(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
