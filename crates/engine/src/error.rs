//! Engine Error Types
//!
//! Only cycle-level failures are errors. Everything that goes wrong for a
//! single node (conflicts, failed or skipped operations, unreadable paths)
//! is reported in the [`CycleReport`](crate::CycleReport) instead.

use derive_more::{Display, Error};

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a cycle was aborted before applying anything.
///
/// ### Transient
/// - [`ErrorKind::RemoteUnavailable`]
/// - [`ErrorKind::LocalUnreadable`]
///
/// ### Needs attention
/// - [`ErrorKind::AuthExpired`] - credentials must be renewed out of band.
/// - [`ErrorKind::MalformedTree`] - the remote listing could not be turned
///   into a tree under the configured orphan policy.
/// - [`ErrorKind::Baseline`] - fatal; the process should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum ErrorKind {
    #[display("remote session expired and could not be renewed")]
    AuthExpired,
    #[display("remote unavailable")]
    RemoteUnavailable,
    #[display("local sync root unreadable")]
    LocalUnreadable,
    #[display("remote listing does not form a tree")]
    MalformedTree,
    #[display("baseline could not be read or written")]
    Baseline,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable | Self::LocalUnreadable)
    }

    /// Returns `true` if syncing cannot continue at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::AuthExpired, false, false)]
    #[case(ErrorKind::RemoteUnavailable, true, false)]
    #[case(ErrorKind::LocalUnreadable, true, false)]
    #[case(ErrorKind::MalformedTree, false, false)]
    #[case(ErrorKind::Baseline, false, true)]
    fn test_classification(#[case] kind: ErrorKind, #[case] retryable: bool, #[case] fatal: bool) {
        assert_eq!(kind.is_retryable(), retryable);
        assert_eq!(kind.is_fatal(), fatal);
    }
}
