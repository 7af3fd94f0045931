//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Every sync target and remote API
//! implementation reports failures through these kinds so that the engine can
//! decide between retrying, skipping and aborting without inspecting strings.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Node does not exist
    #[display("node not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Access denied (filesystem permissions or remote ACLs)
    #[display("permission denied: {_0}")]
    PermissionDenied(#[error(not(source))] String),
    /// A sibling with the same name already exists
    #[display("node already exists: {_0}")]
    AlreadyExists(#[error(not(source))] String),
    /// Folder still has children and cannot be removed
    #[display("folder not empty: {_0}")]
    NotEmpty(#[error(not(source))] String),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Network-related error reported by a remote API client
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// The session handle was rejected and could not be renewed
    #[display("unauthorized")]
    Unauthorized,
    /// Path contains invalid characters or escapes root
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Node identifier or name is not acceptable for the target
    #[display("invalid node identifier: {_0}")]
    InvalidId(#[error(not(source))] String),
    /// Backend-specific error
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Network(_) | Self::BackendError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::Network("connection reset".to_string()), true)]
    #[case(ErrorKind::BackendError("503".to_string()), true)]
    #[case(ErrorKind::Io(IoError::other("locked")), true)]
    #[case(ErrorKind::NotFound("abc".to_string()), false)]
    #[case(ErrorKind::PermissionDenied("abc".to_string()), false)]
    #[case(ErrorKind::AlreadyExists("abc".to_string()), false)]
    #[case(ErrorKind::NotEmpty("abc".to_string()), false)]
    #[case(ErrorKind::Unauthorized, false)]
    fn test_retryable(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(kind.is_retryable(), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorKind::NotFound("a/b".to_string()).to_string(), "node not found: a/b");
        assert_eq!(ErrorKind::Unauthorized.to_string(), "unauthorized");
        assert_eq!(ErrorKind::InvalidPath(PathBuf::from("../x")).to_string(), "invalid path: ../x");
    }
}
