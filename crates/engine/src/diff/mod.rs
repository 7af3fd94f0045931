//! Three-way tree diff.
//!
//! Each side's current snapshot is compared with that side's view of the
//! baseline ([`delta`]), the two deltas are merged into one changeset per
//! target side plus conflicts ([`merge`]), and every changeset is put into a
//! dependency-respecting order ([`order`]).

mod delta;
mod merge;
mod order;

use derive_more::Display;
use drivesync_snapshot::{Baseline, Snapshot};
use drivesync_storage::{Fingerprint, NodeId, NodeKind};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// One side of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Side {
    #[display("local")]
    Local,
    #[display("remote")]
    Remote,
}
impl Side {
    pub fn other(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

/// Stable identity of a node across both sides.
///
/// Nodes the remote knows about are keyed by their remote id. Nodes created
/// locally since the last sync are keyed by their local path until the
/// remote assigns them an id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum SyncKey {
    #[display("remote:{_0}")]
    Remote(NodeId),
    #[display("local:{_0}")]
    Local(NodeId),
}

/// One change to replay on a target side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    /// Create `name` under `parent`. For files, the content is read from
    /// `source` on the other side; `fingerprint` is the source fingerprint.
    Create {
        key: SyncKey,
        parent: SyncKey,
        name: String,
        kind: NodeKind,
        source: NodeId,
        fingerprint: Option<Fingerprint>,
    },
    Delete {
        key: SyncKey,
        kind: NodeKind,
    },
    Rename {
        key: SyncKey,
        name: String,
    },
    Move {
        key: SyncKey,
        parent: SyncKey,
    },
    /// Replace the content of a file with the content of `source`.
    UpdateContent {
        key: SyncKey,
        source: NodeId,
        fingerprint: Option<Fingerprint>,
    },
}
impl ChangeOp {
    pub fn key(&self) -> &SyncKey {
        match self {
            Self::Create { key, .. }
            | Self::Delete { key, .. }
            | Self::Rename { key, .. }
            | Self::Move { key, .. }
            | Self::UpdateContent { key, .. } => key,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }

    /// Parent the operation places its node under, if any.
    pub fn new_parent(&self) -> Option<&SyncKey> {
        match self {
            Self::Create { parent, .. } | Self::Move { parent, .. } => Some(parent),
            _ => None,
        }
    }
}
impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { key, name, kind, .. } => write!(f, "create {kind:?} {name:?} ({key})"),
            Self::Delete { key, .. } => write!(f, "delete {key}"),
            Self::Rename { key, name } => write!(f, "rename {key} to {name:?}"),
            Self::Move { key, parent } => write!(f, "move {key} into {parent}"),
            Self::UpdateContent { key, .. } => write!(f, "update content of {key}"),
        }
    }
}

/// An operation with its position-independent scheduling data.
#[derive(Debug, Clone)]
pub struct PlannedOp {
    pub op: ChangeOp,
    /// Indices (into the same changeset) of operations that must be applied
    /// first. Always smaller than this operation's own index.
    pub depends_on: Vec<usize>,
    /// Keys of the node and of every folder above it, before and after the
    /// operation. Two operations whose lineages contain each other's key touch
    /// overlapping subtrees.
    pub lineage: HashSet<SyncKey>,
}

/// Ordered operations for one target side.
#[derive(Debug, Clone)]
pub struct Changeset {
    pub target: Side,
    pub ops: Vec<PlannedOp>,
}
impl Changeset {
    pub fn empty(target: Side) -> Self {
        Self { target, ops: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeOp> {
        self.ops.iter().map(|planned| &planned.op)
    }

    /// For every operation, the later operations touching an overlapping
    /// subtree (one's lineage contains the other's key), in ascending order.
    pub fn overlapping(&self) -> Vec<Vec<usize>> {
        let mut by_key: HashMap<&SyncKey, Vec<usize>> = HashMap::new();
        for (index, planned) in self.ops.iter().enumerate() {
            by_key.entry(planned.op.key()).or_default().push(index);
        }
        let mut later: Vec<Vec<usize>> = vec![Vec::new(); self.ops.len()];
        for (index, planned) in self.ops.iter().enumerate() {
            for other in planned.lineage.iter().filter_map(|key| by_key.get(key)).flatten() {
                match index.cmp(other) {
                    Ordering::Less => later[index].push(*other),
                    Ordering::Greater => later[*other].push(index),
                    Ordering::Equal => {},
                }
            }
        }
        for list in &mut later {
            list.sort_unstable();
            list.dedup();
        }
        later
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConflictReason {
    #[display("renamed differently on both sides")]
    BothRenamed,
    #[display("moved to different folders on both sides")]
    BothMoved,
    #[display("content changed on both sides")]
    BothModified,
    #[display("deleted on the {deleted} side but changed on the other")]
    DeleteModify { deleted: Side },
    #[display("created with the same name on both sides")]
    BothCreated,
    #[display("parent folder is in conflict")]
    ParentInConflict,
    #[display("operations depend on each other in a cycle")]
    DependencyCycle,
}

/// A change that was not applied on either side.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{name} ({key}): {reason}")]
pub struct Conflict {
    pub key: SyncKey,
    pub name: String,
    pub reason: ConflictReason,
}

/// A change both sides already agree on; only the baseline needs updating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    Deleted(NodeId),
    Renamed(NodeId, String),
    /// Moved into the same folder on both sides.
    Moved(NodeId, NodeId),
    /// A folder created on both sides under the same name; the remote folder
    /// `id` and the local one are the same from now on.
    Paired { id: NodeId, name: String, parent: NodeId },
}

/// Result of comparing both snapshots with the baseline.
#[derive(Debug, Clone)]
pub struct Diff {
    pub to_remote: Changeset,
    pub to_local: Changeset,
    pub conflicts: Vec<Conflict>,
    pub converged: Vec<Convergence>,
}
impl Diff {
    /// Returns `true` if there is nothing to apply and nothing to record.
    pub fn is_empty(&self) -> bool {
        self.to_remote.is_empty() && self.to_local.is_empty() && self.converged.is_empty()
    }
}

/// Compares the current snapshots of both sides with the baseline.
///
/// `local` must be path-addressed (rooted at [`NodeId::local_root`]) and
/// `remote` rooted at the baseline's remote root.
pub fn diff(baseline: &Baseline, local: &Snapshot, remote: &Snapshot) -> Diff {
    let views = baseline.views();
    let local_delta = delta::delta(Side::Local, &views.local, local, |id| views.to_remote.get(id).cloned(), true);
    let remote_delta = delta::delta(Side::Remote, &views.remote, remote, |id| Some(id.clone()), false);
    let merged = merge::merge(&views.remote, local_delta, remote_delta);
    let mut conflicts = merged.conflicts;
    let to_remote = order::order(Side::Remote, merged.to_remote, &views.remote, &mut conflicts);
    let to_local = order::order(Side::Local, merged.to_local, &views.remote, &mut conflicts);
    Diff {
        to_remote,
        to_local,
        conflicts,
        converged: merged.converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivesync_snapshot::{BaselineEntry, OrphanPolicy};
    use drivesync_storage::Node;

    fn local_fp(n: u64) -> Fingerprint {
        Fingerprint::Stat { size: n, modified: 1_700_000_000 }
    }

    fn remote_fp(content: &str) -> Fingerprint {
        Fingerprint::of_content(content.as_bytes())
    }

    fn baseline() -> Baseline {
        let entry = |id: &str, name: &str, kind, parent: &str, n: u64| BaselineEntry {
            id: NodeId::new(id),
            name: name.to_string(),
            kind,
            parent: NodeId::new(parent),
            remote_fingerprint: (kind == NodeKind::File).then(|| remote_fp(name)),
            local_fingerprint: (kind == NodeKind::File).then(|| local_fp(n)),
        };
        Baseline::new(
            NodeId::new("root"),
            vec![
                entry("1", "A", NodeKind::File, "root", 1),
                entry("2", "docs", NodeKind::Folder, "root", 0),
                entry("3", "notes.txt", NodeKind::File, "2", 3),
            ],
        )
    }

    fn local(nodes: Vec<Node>) -> Snapshot {
        Snapshot::assemble(NodeId::local_root(), nodes, OrphanPolicy::Error).unwrap().snapshot
    }

    fn remote(nodes: Vec<Node>) -> Snapshot {
        Snapshot::assemble(NodeId::new("root"), nodes, OrphanPolicy::Error).unwrap().snapshot
    }

    fn unchanged_local() -> Vec<Node> {
        vec![
            Node::file("A", "A", ".", local_fp(1)),
            Node::folder("docs", "docs", "."),
            Node::file("docs/notes.txt", "notes.txt", "docs", local_fp(3)),
        ]
    }

    fn unchanged_remote() -> Vec<Node> {
        vec![
            Node::file("1", "A", "root", remote_fp("A")),
            Node::folder("2", "docs", "root"),
            Node::file("3", "notes.txt", "2", remote_fp("notes.txt")),
        ]
    }

    #[test]
    fn test_nothing_changed() {
        let diff = diff(&baseline(), &local(unchanged_local()), &remote(unchanged_remote()));
        assert!(diff.is_empty());
        assert!(diff.conflicts.is_empty());
    }

    #[test]
    fn test_renamed_differently_on_both_sides() {
        let mut ours = unchanged_local();
        ours[0] = Node::file("B", "B", ".", local_fp(1));
        let mut theirs = unchanged_remote();
        theirs[0].name = "C".to_string();
        let diff = diff(&baseline(), &local(ours), &remote(theirs));
        assert_eq!(
            diff.conflicts,
            vec![Conflict { key: SyncKey::Remote(NodeId::new("1")), name: "A".to_string(), reason: ConflictReason::BothRenamed }]
        );
        assert!(diff.to_remote.is_empty());
        assert!(diff.to_local.is_empty());
    }

    #[test]
    fn test_local_rename_becomes_remote_rename() {
        let mut ours = unchanged_local();
        ours[0] = Node::file("B", "B", ".", local_fp(1));
        let diff = diff(&baseline(), &local(ours), &remote(unchanged_remote()));
        let ops: Vec<&ChangeOp> = diff.to_remote.iter().collect();
        assert_eq!(ops, vec![&ChangeOp::Rename { key: SyncKey::Remote(NodeId::new("1")), name: "B".to_string() }]);
    }

    #[test]
    fn test_first_sync_uploads_in_order() {
        let empty = Baseline::empty(NodeId::new("root"));
        let ours = vec![
            Node::file("a/b/c.txt", "c.txt", "a/b", local_fp(1)),
            Node::folder("a/b", "b", "a"),
            Node::folder("a", "a", "."),
        ];
        let diff = diff(&empty, &local(ours), &remote(vec![]));
        assert!(diff.to_local.is_empty());
        let keys: Vec<String> = diff.to_remote.iter().map(|op| op.key().to_string()).collect();
        assert_eq!(keys, vec!["local:a", "local:a/b", "local:a/b/c.txt"]);
        assert!(matches!(
            diff.to_remote.ops[0].op,
            ChangeOp::Create { ref parent, .. } if parent == &SyncKey::Remote(NodeId::new("root"))
        ));
    }

    #[test]
    fn test_remote_folder_deletion_is_ordered_children_first() {
        let theirs = vec![Node::file("1", "A", "root", remote_fp("A"))];
        let diff = diff(&baseline(), &local(unchanged_local()), &remote(theirs));
        let keys: Vec<String> = diff.to_local.iter().map(|op| op.key().to_string()).collect();
        assert_eq!(keys, vec!["remote:3", "remote:2"]);
        assert!(diff.to_local.iter().all(ChangeOp::is_delete));
    }

    #[test]
    fn test_unreadable_local_folder_is_not_a_deletion() {
        let ours = vec![Node::file("A", "A", ".", local_fp(1))];
        let snapshot = local(ours).with_incomplete([NodeId::new("docs")]);
        let diff = diff(&baseline(), &snapshot, &remote(unchanged_remote()));
        assert!(diff.is_empty());
    }
}
