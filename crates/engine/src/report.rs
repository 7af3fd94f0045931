//! What a cycle did.

use crate::apply::{OpOutcome, OpStatus};
use crate::diff::{Conflict, Convergence};
use drivesync_snapshot::{MalformedRecord, SkippedPath};
use drivesync_storage::NodeId;
use std::fmt;
use time::UtcDateTime;

/// Summary of one [`Engine::run_one_cycle`](crate::Engine::run_one_cycle).
///
/// Nothing here is an error for the cycle as a whole: conflicts, failed
/// operations and unreadable paths are all picked up again next cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: UtcDateTime,
    pub finished_at: UtcDateTime,
    /// Targets were wrapped read-only and the baseline was not written.
    pub dry_run: bool,
    /// `false` when the cycle was stopped (timeout, cancellation or a
    /// rejected session) before every operation was attempted.
    pub complete: bool,
    /// Remote changes first, then local ones, each in changeset order.
    pub outcomes: Vec<OpOutcome>,
    pub conflicts: Vec<Conflict>,
    pub converged: Vec<Convergence>,
    /// Remote records that were skipped while building the remote tree.
    pub malformed: Vec<MalformedRecord>,
    /// Local paths that could not be read; their subtrees were left alone.
    pub unreadable: Vec<SkippedPath>,
    /// Local folders that were skipped because they loop back on an ancestor.
    pub cycles: Vec<NodeId>,
}

impl CycleReport {
    fn count(&self, matches: impl Fn(&OpStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|outcome| matches(&outcome.status)).count()
    }

    pub fn applied(&self) -> usize {
        self.count(|status| matches!(status, OpStatus::Applied))
    }

    pub fn failed(&self) -> usize {
        self.count(|status| matches!(status, OpStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|status| matches!(status, OpStatus::Skipped))
    }

    pub fn deferred(&self) -> usize {
        self.count(|status| matches!(status, OpStatus::Deferred))
    }

    /// Whether either side was modified.
    pub fn changed(&self) -> bool {
        self.applied() > 0
    }

    /// Whether anything needs a human (or at least another cycle).
    pub fn has_problems(&self) -> bool {
        !self.complete
            || self.failed() > 0
            || !self.conflicts.is_empty()
            || !self.malformed.is_empty()
            || !self.unreadable.is_empty()
    }

    pub fn duration(&self) -> time::Duration {
        self.finished_at - self.started_at
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} failed, {} skipped, {} deferred, {} conflicts",
            self.applied(),
            self.failed(),
            self.skipped(),
            self.deferred(),
            self.conflicts.len(),
        )?;
        if !self.malformed.is_empty() {
            write!(f, ", {} malformed records", self.malformed.len())?;
        }
        if !self.unreadable.is_empty() {
            write!(f, ", {} unreadable paths", self.unreadable.len())?;
        }
        if !self.cycles.is_empty() {
            write!(f, ", {} link cycles", self.cycles.len())?;
        }
        if self.dry_run {
            f.write_str(" (dry run)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{ChangeOp, ConflictReason, Side, SyncKey};
    use drivesync_storage::NodeKind;

    fn outcome(name: &str, status: OpStatus) -> OpOutcome {
        OpOutcome {
            target: Side::Remote,
            op: ChangeOp::Delete {
                key: SyncKey::Remote(NodeId::new(name)),
                kind: NodeKind::File,
            },
            status,
        }
    }

    fn report(outcomes: Vec<OpOutcome>) -> CycleReport {
        let now = UtcDateTime::now();
        CycleReport {
            started_at: now,
            finished_at: now,
            dry_run: false,
            complete: true,
            outcomes,
            conflicts: Vec::new(),
            converged: Vec::new(),
            malformed: Vec::new(),
            unreadable: Vec::new(),
            cycles: Vec::new(),
        }
    }

    #[test]
    fn test_counts_and_summary() {
        let mut report = report(vec![
            outcome("a", OpStatus::Applied),
            outcome("b", OpStatus::Failed("permission denied".to_string())),
            outcome("c", OpStatus::Skipped),
            outcome("d", OpStatus::Applied),
        ]);
        report.conflicts.push(Conflict {
            key: SyncKey::Remote(NodeId::new("e")),
            name: "e".to_string(),
            reason: ConflictReason::BothModified,
        });
        assert_eq!((report.applied(), report.failed(), report.skipped(), report.deferred()), (2, 1, 1, 0));
        assert!(report.changed());
        assert!(report.has_problems());
        assert_eq!(report.to_string(), "2 applied, 1 failed, 1 skipped, 0 deferred, 1 conflicts");
    }

    #[test]
    fn test_empty_cycle_changed_nothing() {
        let report = report(Vec::new());
        assert!(!report.changed());
        assert!(!report.has_problems());
    }
}
