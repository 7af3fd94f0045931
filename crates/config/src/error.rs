//! Configuration Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Every configuration error is fatal: the process cannot sync without a
/// usable configuration.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A source could not be read or did not match the expected shape.
    #[display("configuration could not be loaded")]
    Load,
    /// A value was read but is not acceptable.
    #[display("invalid configuration value: {_0}")]
    InvalidValue(#[error(not(source))] String),
    /// The home directory is unknown, or a configured directory could not
    /// be created.
    #[display("directory unavailable: {}", _0.display())]
    Directories(#[error(not(source))] PathBuf),
}
