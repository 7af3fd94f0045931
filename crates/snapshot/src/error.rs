//! Snapshot Error Types
//!
//! Uses [`exn`] for automatic location tracking and error tree construction.
//! Storage failures are raised into one of these kinds with `or_raise` so the
//! original [`drivesync_storage::error::ErrorKind`] stays in the error tree.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A snapshot error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for snapshot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Cycle-level failures while building snapshots or handling the baseline.
///
/// Per-node problems (unreadable subtrees, malformed records) are not errors;
/// they are collected in the scan results instead.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The remote listing failed and retries were exhausted.
    #[display("remote unavailable")]
    RemoteUnavailable,
    /// The remote rejected the session and it could not be renewed.
    #[display("remote session expired")]
    AuthExpired,
    /// The local sync root itself could not be read.
    #[display("local root unreadable: {}", _0.display())]
    LocalUnreadable(#[error(not(source))] PathBuf),
    /// A record's parent never appeared and orphans are rejected.
    #[display("orphaned record: {_0}")]
    Orphaned(#[error(not(source))] String),
    /// Records form a parent cycle and cycles are rejected.
    #[display("parent cycle through record: {_0}")]
    Cycle(#[error(not(source))] String),
    /// The baseline file could not be read, parsed or written.
    #[display("baseline file error: {}", _0.display())]
    Baseline(#[error(not(source))] PathBuf),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable)
    }
}
