//! Local tree builder.

use crate::error::{ErrorKind, Result};
use crate::tree::{OrphanPolicy, Snapshot};
use drivesync_storage::NodeId;
use drivesync_storage::backend::{LocalBackend, WalkEvent};
use exn::ResultExt;
use futures::StreamExt;
use tracing::instrument;

/// A subtree left out of a local snapshot.
#[derive(Debug, Clone)]
pub struct SkippedPath {
    pub id: NodeId,
    pub reason: String,
}

/// Result of walking the local sync root.
#[derive(Debug)]
pub struct LocalScan {
    pub snapshot: Snapshot,
    /// Entries or subtrees that could not be read; the walk went on without them.
    pub unreadable: Vec<SkippedPath>,
    /// Directories reached a second time (symlink loops); not descended into.
    pub cycles: Vec<NodeId>,
}

/// Walks the local sync root into a [`Snapshot`].
///
/// Unreadable entries and symlink loops never fail the build: they are left
/// out, reported in the [`LocalScan`], and marked incomplete in the snapshot
/// so that nothing beneath them is mistaken for a deletion. Only an
/// unreadable root is an error.
#[instrument(skip(backend), fields(root = %backend.root().display()))]
pub async fn build_local(backend: &LocalBackend) -> Result<LocalScan> {
    let mut nodes = Vec::new();
    let mut unreadable = Vec::new();
    let mut cycles = Vec::new();
    let mut walk = backend.walk();
    while let Some(event) = walk.next().await {
        match event {
            WalkEvent::Found(node) => nodes.push(node),
            WalkEvent::Unreadable { id, error } if id.is_local_root() => {
                return Err(error).or_raise(|| ErrorKind::LocalUnreadable(backend.root().to_path_buf()));
            },
            WalkEvent::Unreadable { id, error } => {
                let reason = error.to_string();
                tracing::warn!(id = %id, error = reason, "Skipping unreadable local path");
                unreadable.push(SkippedPath { id, reason });
            },
            WalkEvent::CycleDetected { id } => {
                tracing::warn!(id = %id, "Skipping directory already visited; symlink loop?");
                cycles.push(id);
            },
        }
    }

    let assembled = Snapshot::assemble(NodeId::local_root(), nodes, OrphanPolicy::AttachToRoot)?;
    let incomplete: Vec<NodeId> =
        unreadable.iter().map(|skipped| skipped.id.clone()).chain(cycles.iter().cloned()).collect();
    let snapshot = assembled.snapshot.with_incomplete(incomplete);
    tracing::debug!(nodes = snapshot.len(), unreadable = unreadable.len(), "Local snapshot built");
    Ok(LocalScan {
        snapshot,
        unreadable,
        cycles,
    })
}
