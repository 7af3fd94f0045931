//! Three-way synchronization between a local folder and a remote drive.
//!
//! A cycle snapshots both sides, diffs each against the baseline recorded at
//! the end of the previous cycle, replays the non-conflicting changes on the
//! opposite side and records what actually happened as the next baseline.
//! Start with [`Engine::run_one_cycle`].

mod apply;
mod cycle;
mod diff;
pub mod error;
mod report;

pub use crate::apply::{OpOutcome, OpStatus, Reconciler, StopSignal, WorkingTree};
pub use crate::cycle::{Engine, EngineOptions};
pub use crate::diff::{
    ChangeOp, Changeset, Conflict, ConflictReason, Convergence, Diff, PlannedOp, Side, SyncKey, diff,
};
pub use crate::report::CycleReport;
