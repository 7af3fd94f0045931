//! One synchronization cycle, end to end.

use crate::apply::{OpStatus, Reconciler, StopSignal, WorkingTree};
use crate::diff::diff;
use crate::error::{ErrorKind, Result};
use crate::report::CycleReport;
use drivesync_snapshot::error::ErrorKind as SnapshotErrorKind;
use drivesync_snapshot::{BaselineStore, OrphanPolicy, build_local, build_remote};
use drivesync_storage::backend::{LocalBackend, ReadOnlyBackend, RemoteTarget};
use drivesync_storage::{CredentialHandle, RemoteHandle, RetryPolicy, SyncTarget, TargetHandle};
use exn::ResultExt;
use std::sync::Arc;
use std::time::Duration;
use time::UtcDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Tuning knobs for [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Operations in flight at once, per side.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub orphan_policy: OrphanPolicy,
    /// Stop dispatching operations once a cycle has run this long.
    pub cycle_timeout: Option<Duration>,
    /// Compute and report everything, but change neither side nor the baseline.
    pub dry_run: bool,
}
impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            orphan_policy: OrphanPolicy::default(),
            cycle_timeout: None,
            dry_run: false,
        }
    }
}

/// Keeps a local folder and a remote drive in sync.
///
/// The engine owns no timer: callers decide when to invoke
/// [`run_one_cycle`](Engine::run_one_cycle). Concurrent calls are serialised.
pub struct Engine {
    local: Arc<LocalBackend>,
    remote: RemoteHandle,
    credentials: CredentialHandle,
    store: BaselineStore,
    options: EngineOptions,
    cancel: CancellationToken,
    running: Mutex<()>,
}

impl Engine {
    pub fn new(
        local: LocalBackend,
        remote: RemoteHandle,
        credentials: CredentialHandle,
        store: BaselineStore,
        options: EngineOptions,
    ) -> Self {
        Self {
            local: Arc::new(local),
            remote,
            credentials,
            store,
            options,
            cancel: CancellationToken::new(),
            running: Mutex::new(()),
        }
    }

    /// Stop cycles early once `token` is cancelled. Operations already in
    /// flight are allowed to finish; the rest are deferred.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Runs a full cycle: snapshot both sides, diff them against the
    /// baseline, apply both changesets and persist the new baseline.
    ///
    /// # Errors
    ///
    /// Only failures that prevent the cycle from starting abort it, and they
    /// do so before anything is applied:
    /// - [`AuthExpired`](ErrorKind::AuthExpired) if no valid session could be
    ///   obtained.
    /// - [`RemoteUnavailable`](ErrorKind::RemoteUnavailable) or
    ///   [`MalformedTree`](ErrorKind::MalformedTree) if the remote tree could
    ///   not be built.
    /// - [`LocalUnreadable`](ErrorKind::LocalUnreadable) if the local root
    ///   could not be read.
    /// - [`Baseline`](ErrorKind::Baseline) if the baseline could not be read,
    ///   or written after applying.
    #[instrument(skip_all, fields(remote = self.remote.name(), dry_run = self.options.dry_run))]
    pub async fn run_one_cycle(&self) -> Result<CycleReport> {
        let _running = self.running.lock().await;
        let started_at = UtcDateTime::now();

        let session = self.credentials.session().await.or_raise(|| ErrorKind::AuthExpired)?;
        let remote = Arc::new(RemoteTarget::new(self.remote.clone(), self.credentials.clone(), session));
        let baseline = self.store.load(remote.root()).await.or_raise(|| ErrorKind::Baseline)?;

        let (local_scan, remote_scan) = tokio::join!(
            build_local(&self.local),
            build_remote(&remote, &self.options.retry, self.options.orphan_policy),
        );
        let remote_scan = match remote_scan {
            Ok(scan) => scan,
            Err(err) => {
                let kind = match &*err {
                    SnapshotErrorKind::AuthExpired => ErrorKind::AuthExpired,
                    SnapshotErrorKind::Orphaned(_) | SnapshotErrorKind::Cycle(_) => ErrorKind::MalformedTree,
                    _ => ErrorKind::RemoteUnavailable,
                };
                return Err(err).or_raise(|| kind);
            },
        };
        let local_scan = local_scan.or_raise(|| ErrorKind::LocalUnreadable)?;
        tracing::debug!(
            local = local_scan.snapshot.len(),
            remote = remote_scan.snapshot.len(),
            pages = remote_scan.pages,
            baseline = baseline.len(),
            "Snapshots taken"
        );

        let diff = diff(&baseline, &local_scan.snapshot, &remote_scan.snapshot);
        for conflict in &diff.conflicts {
            tracing::warn!(%conflict, "Conflict; leaving both sides untouched");
        }
        tracing::info!(
            to_remote = diff.to_remote.len(),
            to_local = diff.to_local.len(),
            conflicts = diff.conflicts.len(),
            converged = diff.converged.len(),
            "Changes computed"
        );

        let mut tree = WorkingTree::new(&baseline, remote.addressing());
        tree.converge(&diff.converged);

        let deadline = self.options.cycle_timeout.map(|timeout| Instant::now() + timeout);
        let stop = StopSignal::new(self.cancel.child_token(), deadline);
        let (remote_target, local_target): (TargetHandle, TargetHandle) = if self.options.dry_run {
            (
                Arc::new(ReadOnlyBackend::new(remote.clone())),
                Arc::new(ReadOnlyBackend::new(self.local.clone())),
            )
        } else {
            (remote.clone(), self.local.clone())
        };

        let concurrency = self.options.concurrency;
        let mut outcomes = Reconciler::new(&*remote_target, &*local_target, self.options.retry, concurrency)
            .apply(&diff.to_remote, &mut tree, &stop)
            .await;
        outcomes.extend(
            Reconciler::new(&*local_target, &*remote_target, self.options.retry, concurrency)
                .apply(&diff.to_local, &mut tree, &stop)
                .await,
        );

        if self.options.dry_run {
            tracing::info!("Dry run; baseline left as it was");
        } else {
            self.store.save(&tree.into_baseline()).await.or_raise(|| ErrorKind::Baseline)?;
        }

        let complete = outcomes.iter().all(|outcome| outcome.status != OpStatus::Deferred);
        let report = CycleReport {
            started_at,
            finished_at: UtcDateTime::now(),
            dry_run: self.options.dry_run,
            complete,
            outcomes,
            conflicts: diff.conflicts,
            converged: diff.converged,
            malformed: remote_scan.malformed,
            unreadable: local_scan.unreadable,
            cycles: local_scan.cycles,
        };
        tracing::info!(%report, "Cycle finished");
        Ok(report)
    }
}
