//! Replaying a changeset on one side.

mod working;

pub use self::working::WorkingTree;

use crate::diff::{ChangeOp, Changeset, Side};
use derive_more::Display;
use drivesync_storage::error::{ErrorKind as StorageErrorKind, Result as StorageResult};
use drivesync_storage::{NodeId, NodeKind, Receipt, RetryPolicy, SyncTarget};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What happened to one operation.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum OpStatus {
    #[display("applied")]
    Applied,
    /// Failed permanently (or after exhausting retries).
    #[display("failed: {_0}")]
    Failed(String),
    /// Not attempted because an operation it depends on failed.
    #[display("skipped")]
    Skipped,
    /// Not attempted because the cycle was stopped; picked up next cycle.
    #[display("deferred")]
    Deferred,
}

#[derive(Debug, Clone)]
pub struct OpOutcome {
    /// Side the operation was replayed on.
    pub target: Side,
    pub op: ChangeOp,
    pub status: OpStatus,
}

/// When to stop dispatching new operations.
///
/// Stops on cancellation of the token, when the deadline passes, or when the
/// remote rejects the session for good (see [`StopSignal::halt`]).
#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancellationToken,
    deadline: Option<Instant>,
}
impl StopSignal {
    pub fn new(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { token, deadline }
    }

    pub fn never() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn halt(&self) {
        self.token.cancel();
    }

    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {},
                    () = tokio::time::sleep_until(deadline) => {},
                }
            },
            None => self.token.cancelled().await,
        }
    }
}

/// An operation with every key resolved to the identifiers its sides use.
#[derive(Debug)]
enum Job {
    Create { parent: NodeId, name: String, kind: NodeKind, source: NodeId },
    Delete { id: NodeId },
    Rename { id: NodeId, name: String },
    Move { id: NodeId, parent: NodeId },
    Write { id: NodeId, source: NodeId },
}

/// How far an operation got.
struct Progress {
    receipt: Option<Receipt>,
    /// Content (if any) reached the target.
    written: bool,
    error: Option<drivesync_storage::error::Error>,
}
impl Progress {
    fn done(receipt: Option<Receipt>) -> Self {
        Self { receipt, written: true, error: None }
    }

    fn failed(receipt: Option<Receipt>, error: drivesync_storage::error::Error) -> Self {
        Self { receipt, written: false, error: Some(error) }
    }
}

type Running<'a> = Pin<Box<dyn Future<Output = (usize, Progress)> + Send + 'a>>;

/// Dispatch bookkeeping for one changeset.
///
/// An operation becomes ready once its dependencies and every earlier
/// operation on an overlapping subtree are settled. Ready operations are
/// handed out lowest index first.
struct Schedule<'c> {
    changeset: &'c Changeset,
    status: Vec<Option<OpStatus>>,
    /// Unsettled prerequisites per operation.
    blockers: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    overlapping: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
}
impl<'c> Schedule<'c> {
    fn new(changeset: &'c Changeset) -> Self {
        let count = changeset.len();
        let overlapping = changeset.overlapping();
        let mut blockers = vec![0; count];
        let mut dependents = vec![Vec::new(); count];
        for (index, planned) in changeset.ops.iter().enumerate() {
            for &dependency in &planned.depends_on {
                dependents[dependency].push(index);
                blockers[index] += 1;
            }
        }
        for later in overlapping.iter().flatten() {
            blockers[*later] += 1;
        }
        let ready = (0..count).filter(|&index| blockers[index] == 0).collect();
        Self {
            changeset,
            status: vec![None; count],
            blockers,
            dependents,
            overlapping,
            ready,
        }
    }

    fn next(&mut self) -> Option<usize> {
        self.ready.pop_first()
    }

    /// Records the final status of `index` and releases whatever waited on it.
    /// Dependents of an operation that did not apply are skipped at once.
    fn settle(&mut self, index: usize, status: OpStatus) {
        let mut settled = vec![(index, status)];
        while let Some((index, status)) = settled.pop() {
            let applied = status == OpStatus::Applied;
            self.status[index] = Some(status);
            for n in 0..self.dependents[index].len() {
                let dependent = self.dependents[index][n];
                if !applied && self.status[dependent].is_none() {
                    let op = &self.changeset.ops[dependent].op;
                    tracing::debug!(side = %self.changeset.target, %op, "Not attempting operation");
                    self.status[dependent] = Some(OpStatus::Skipped);
                    self.ready.remove(&dependent);
                    settled.push((dependent, OpStatus::Skipped));
                } else {
                    self.release(dependent);
                }
            }
            for n in 0..self.overlapping[index].len() {
                let later = self.overlapping[index][n];
                self.release(later);
            }
        }
    }

    fn release(&mut self, index: usize) {
        if self.status[index].is_some() {
            return;
        }
        self.blockers[index] -= 1;
        if self.blockers[index] == 0 {
            self.ready.insert(index);
        }
    }

    /// Anything never settled was held back by a stop.
    fn finish(self) -> Vec<OpStatus> {
        self.status.into_iter().map(|status| status.unwrap_or(OpStatus::Deferred)).collect()
    }
}

/// Applies a [`Changeset`] to one target, reading content from the other side.
///
/// Operations are dispatched in changeset order, up to `concurrency` at a
/// time. An operation starts once everything it depends on is applied, and
/// never while an operation on an overlapping subtree is running or still
/// waiting ahead of it. Retryable errors are retried per step (create, read,
/// write) according to `retry`.
pub struct Reconciler<'a> {
    target: &'a dyn SyncTarget,
    source: &'a dyn SyncTarget,
    retry: RetryPolicy,
    concurrency: usize,
}

impl<'a> Reconciler<'a> {
    pub fn new(target: &'a dyn SyncTarget, source: &'a dyn SyncTarget, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            target,
            source,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Applies `changeset`, recording every confirmed operation in `tree`.
    ///
    /// Returns one outcome per operation, in changeset order.
    pub async fn apply(&self, changeset: &Changeset, tree: &mut WorkingTree, stop: &StopSignal) -> Vec<OpOutcome> {
        let side = changeset.target;
        let mut schedule = Schedule::new(changeset);
        let mut in_flight: FuturesUnordered<Running<'_>> = FuturesUnordered::new();
        let mut stopped = stop.is_stopped();

        loop {
            while !stopped && in_flight.len() < self.concurrency {
                let Some(index) = schedule.next() else {
                    break;
                };
                let op = &changeset.ops[index].op;
                match self.resolve(op, tree, side) {
                    Some(job) => {
                        tracing::debug!(%side, %op, "Dispatching operation");
                        in_flight.push(Box::pin(async move { (index, self.run(job).await) }));
                    },
                    None => {
                        tracing::warn!(%side, %op, "Operation refers to a node that is not known");
                        schedule.settle(index, OpStatus::Failed("node not found in working tree".to_string()));
                    },
                }
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((index, progress)) = in_flight.next() => {
                    let op = &changeset.ops[index].op;
                    match progress.error {
                        None => {
                            tracing::info!(%side, op = %op, "Applied");
                            tree.record(side, op, progress.receipt.as_ref(), progress.written);
                            schedule.settle(index, OpStatus::Applied);
                        },
                        Some(error) => {
                            tracing::warn!(%side, op = %op, error = ?error, "Operation failed");
                            // A file created but not written is still recorded, so the
                            // content is sent again next cycle.
                            if matches!(op, ChangeOp::Create { .. }) && progress.receipt.is_some() {
                                tree.record(side, op, progress.receipt.as_ref(), false);
                            }
                            if matches!(&*error, StorageErrorKind::Unauthorized) {
                                tracing::error!(%side, "Session rejected; not starting any more operations");
                                stop.halt();
                            }
                            schedule.settle(index, OpStatus::Failed((*error).to_string()));
                        },
                    }
                },
                () = stop.wait(), if !stopped => {
                    tracing::warn!(%side, running = in_flight.len(), "Stopping; waiting for running operations");
                    stopped = true;
                },
            }
            stopped = stopped || stop.is_stopped();
        }

        changeset
            .ops
            .iter()
            .zip(schedule.finish())
            .map(|(planned, status)| OpOutcome {
                target: side,
                op: planned.op.clone(),
                status,
            })
            .collect()
    }

    fn resolve(&self, op: &ChangeOp, tree: &WorkingTree, side: Side) -> Option<Job> {
        Some(match op {
            ChangeOp::Create {
                parent,
                name,
                kind,
                source,
                ..
            } => Job::Create {
                parent: tree.locate(parent, side)?,
                name: name.clone(),
                kind: *kind,
                source: source_id(source, tree, side),
            },
            ChangeOp::Delete { key, .. } => Job::Delete { id: tree.locate(key, side)? },
            ChangeOp::Rename { key, name } => Job::Rename {
                id: tree.locate(key, side)?,
                name: name.clone(),
            },
            ChangeOp::Move { key, parent } => Job::Move {
                id: tree.locate(key, side)?,
                parent: tree.locate(parent, side)?,
            },
            ChangeOp::UpdateContent { key, source, .. } => Job::Write {
                id: tree.locate(key, side)?,
                source: source_id(source, tree, side),
            },
        })
    }

    async fn run(&self, job: Job) -> Progress {
        match job {
            Job::Create { parent, name, kind, source } => {
                let created = self.retry.run("create", || self.target.create(&parent, &name, kind)).await;
                let created = match created {
                    Ok(receipt) => receipt,
                    Err(error) => return Progress::failed(None, error),
                };
                if kind == NodeKind::Folder {
                    return Progress::done(Some(created));
                }
                match self.transfer(&source, &created.id).await {
                    Ok(written) => Progress::done(Some(written)),
                    Err(error) => Progress::failed(Some(created), error),
                }
            },
            Job::Delete { id } => match self.retry.run("delete", || self.target.delete(&id)).await {
                Ok(()) => Progress::done(None),
                Err(error) if matches!(&*error, StorageErrorKind::NotFound(_)) => {
                    tracing::debug!(id = %id, "Already gone");
                    Progress::done(None)
                },
                Err(error) => Progress::failed(None, error),
            },
            Job::Rename { id, name } => match self.retry.run("rename", || self.target.rename(&id, &name)).await {
                Ok(receipt) => Progress::done(Some(receipt)),
                Err(error) => Progress::failed(None, error),
            },
            Job::Move { id, parent } => match self.retry.run("move", || self.target.relocate(&id, &parent)).await {
                Ok(receipt) => Progress::done(Some(receipt)),
                Err(error) => Progress::failed(None, error),
            },
            Job::Write { id, source } => match self.transfer(&source, &id).await {
                Ok(receipt) => Progress::done(Some(receipt)),
                Err(error) => Progress::failed(None, error),
            },
        }
    }

    async fn transfer(&self, source: &NodeId, id: &NodeId) -> StorageResult<Receipt> {
        let data = self.retry.run("read", || self.source.read(source)).await?;
        self.retry.run("write", || self.target.write(id, &data)).await
    }
}

/// Content for the local side is read from the remote, which may already
/// have renamed folders above `source` this cycle.
fn source_id(source: &NodeId, tree: &WorkingTree, side: Side) -> NodeId {
    match side {
        Side::Local => tree.current_remote_id(source),
        Side::Remote => source.clone(),
    }
}
