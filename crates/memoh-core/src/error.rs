//! Global error hierarchy for memoh.
//!
//! Every fallible operation in the workspace resolves to one of these kinds.
//! The API layer maps them onto HTTP status codes; the CLI exits non-zero
//! with the display form on stderr.

use std::time::Duration;
use thiserror::Error;

/// Workspace-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: bad user id, empty required parameter, path outside
    /// the data mount, unknown encoding, bad hunk header.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Container, task, snapshot, file, directory or version absent.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Container label disagrees with the caller's user id.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Patch context or deletion lines do not match the original file.
    #[error("{0}")]
    PatchMismatch(String),

    /// Stop deadline exceeded without force.
    #[error("timeout waiting for task to stop after {timeout:?}")]
    TaskStopTimeout { timeout: Duration },

    /// Concurrent version creations raced despite the per-user lock.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Runtime, database or host-OS failure.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Error::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether this error represents a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::not_found("path", err.to_string())
        } else {
            Error::Internal(err.to_string())
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
