//! Per-side comparison of a current snapshot with that side's baseline view.

use super::{Side, SyncKey};
use drivesync_snapshot::Snapshot;
use drivesync_storage::{Fingerprint, Node, NodeId, NodeKind};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A node that exists on one side but not in the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Created {
    pub parent: SyncKey,
    pub name: String,
    pub kind: NodeKind,
    /// Identifier on the side it was created on.
    pub source: NodeId,
    pub fingerprint: Option<Fingerprint>,
}

/// Attributes of a baseline node that changed on one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct Modification {
    pub name: Option<String>,
    pub parent: Option<SyncKey>,
    /// Identifier on the changed side, and its new fingerprint.
    pub content: Option<(NodeId, Option<Fingerprint>)>,
}
impl Modification {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.parent.is_none() && self.content.is_none()
    }
}

/// Everything that changed on one side since the baseline.
///
/// Deletions and modifications are keyed by remote id, so both sides' deltas
/// line up.
#[derive(Debug, Clone)]
pub(super) struct SideDelta {
    pub side: Side,
    pub created: BTreeMap<SyncKey, Created>,
    pub deleted: BTreeMap<NodeId, NodeKind>,
    pub modified: BTreeMap<NodeId, Modification>,
}
impl SideDelta {
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }
}

/// Compares `current` with `base`, both addressed with the side's own ids.
///
/// `to_remote` translates a baseline id of this side to its remote id. On the
/// local side identifiers are paths, so a renamed or moved node shows up as a
/// missing path plus a new one; `track_moves` pairs them up again: files by
/// their (unique) fingerprint, then folders whose recognized children all came
/// from the same missing folder.
pub(super) fn delta(
    side: Side,
    base: &Snapshot,
    current: &Snapshot,
    to_remote: impl Fn(&NodeId) -> Option<NodeId>,
    track_moves: bool,
) -> SideDelta {
    let mut matched: HashMap<NodeId, NodeId> = HashMap::new();
    matched.insert(current.root().clone(), base.root().clone());
    for node in current.nodes() {
        if base.get(&node.id).is_some_and(|b| b.kind == node.kind) {
            matched.insert(node.id.clone(), node.id.clone());
        }
    }
    if track_moves {
        track(base, current, &mut matched);
    }

    let fresh_key = |id: &NodeId| match side {
        Side::Local => SyncKey::Local(id.clone()),
        Side::Remote => SyncKey::Remote(id.clone()),
    };
    let key_of = |id: &NodeId| match matched.get(id).and_then(&to_remote) {
        Some(remote) => SyncKey::Remote(remote),
        None => fresh_key(id),
    };

    let mut created = BTreeMap::new();
    let mut modified = BTreeMap::new();
    for node in current.nodes() {
        let parent = node.parent.as_ref().map(&key_of).unwrap_or_else(|| key_of(current.root()));
        let Some(base_node) = matched.get(&node.id).and_then(|id| base.get(id)) else {
            created.insert(
                fresh_key(&node.id),
                Created {
                    parent,
                    name: node.name.clone(),
                    kind: node.kind,
                    source: node.id.clone(),
                    fingerprint: node.fingerprint.clone(),
                },
            );
            continue;
        };
        let Some(remote_id) = to_remote(&base_node.id) else {
            continue;
        };
        let base_parent = base_node.parent.as_ref().and_then(&to_remote).map(SyncKey::Remote);
        let change = Modification {
            name: (node.name != base_node.name).then(|| node.name.clone()),
            parent: (Some(&parent) != base_parent.as_ref()).then_some(parent),
            content: (node.kind == NodeKind::File && node.fingerprint != base_node.fingerprint)
                .then(|| (node.id.clone(), node.fingerprint.clone())),
        };
        if !change.is_empty() {
            modified.insert(remote_id, change);
        }
    }

    let found: HashSet<&NodeId> = matched.values().collect();
    let mut deleted = BTreeMap::new();
    for node in base.nodes() {
        if found.contains(&node.id) || shielded(base, current, &node.id) {
            continue;
        }
        if let Some(remote_id) = to_remote(&node.id) {
            deleted.insert(remote_id, node.kind);
        }
    }

    SideDelta {
        side,
        created,
        deleted,
        modified,
    }
}

/// A baseline node missing from an incomplete subtree may still exist.
fn shielded(base: &Snapshot, current: &Snapshot, id: &NodeId) -> bool {
    let incomplete = current.incomplete();
    !incomplete.is_empty() && (incomplete.contains(id) || base.ancestors(id).any(|a| incomplete.contains(a)))
}

fn track(base: &Snapshot, current: &Snapshot, matched: &mut HashMap<NodeId, NodeId>) {
    let claimed: HashSet<NodeId> = matched.values().cloned().collect();
    let missing: Vec<&Node> = base.nodes().filter(|n| !claimed.contains(&n.id)).collect();
    let fresh: Vec<&Node> = current.nodes().filter(|n| !matched.contains_key(&n.id)).collect();

    let by_fingerprint = |nodes: &[&Node]| {
        let mut index: HashMap<Fingerprint, Vec<NodeId>> = HashMap::new();
        for node in nodes.iter().filter(|n| n.kind == NodeKind::File) {
            if let Some(fingerprint) = &node.fingerprint {
                index.entry(fingerprint.clone()).or_default().push(node.id.clone());
            }
        }
        index
    };
    let gone = by_fingerprint(missing.as_slice());
    for (fingerprint, ids) in by_fingerprint(fresh.as_slice()) {
        if let ([id], Some([origin])) = (ids.as_slice(), gone.get(&fingerprint).map(Vec::as_slice)) {
            tracing::debug!(from = %origin, to = %id, "Recognized moved file");
            matched.insert(id.clone(), origin.clone());
        }
    }

    // Deepest folders first, so a renamed folder's subfolders are recognized
    // before the folder itself is looked at.
    let mut folders: Vec<(usize, &NodeId)> =
        fresh.iter().filter(|n| n.is_folder()).map(|n| (current.ancestors(&n.id).count(), &n.id)).collect();
    folders.sort_by(|a, b| b.cmp(a));
    let mut taken: HashSet<NodeId> = HashSet::new();
    for (_, id) in folders {
        let mut origins = current.children(id).filter_map(|child| {
            let origin = matched.get(&child.id)?;
            base.get(origin)?.parent.clone()
        });
        let Some(origin) = origins.next() else {
            continue;
        };
        if origins.any(|other| other != origin)
            || taken.contains(&origin)
            || claimed.contains(&origin)
            || !base.get(&origin).is_some_and(Node::is_folder)
        {
            continue;
        }
        tracing::debug!(from = %origin, to = %id, "Recognized moved folder");
        taken.insert(origin.clone());
        matched.insert(id.clone(), origin);
    }
}
