//! Snapshots of both sides of a sync, and the baseline they are diffed against.

mod baseline;
pub mod error;
mod local;
mod remote;
mod tree;

pub use crate::baseline::{Baseline, BaselineEntry, BaselineStore, BaselineViews, FORMAT_VERSION};
pub use crate::local::{LocalScan, SkippedPath, build_local};
pub use crate::remote::{RemoteScan, build_remote};
pub use crate::tree::{Assembled, MalformedRecord, OrphanPolicy, Problem, Snapshot};
