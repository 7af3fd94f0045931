//! Merging both sides' deltas into per-target operations.

use super::delta::{Created, SideDelta};
use super::{ChangeOp, Conflict, ConflictReason, Convergence, SyncKey};
use drivesync_snapshot::Snapshot;
use drivesync_storage::{NodeId, NodeKind};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Default)]
pub(super) struct Merged {
    pub to_remote: Vec<ChangeOp>,
    pub to_local: Vec<ChangeOp>,
    pub conflicts: Vec<Conflict>,
    pub converged: Vec<Convergence>,
}

/// Keys kept out of both changesets, with the conflicts explaining why.
#[derive(Default)]
struct Exclusions {
    keys: HashSet<SyncKey>,
    conflicts: Vec<Conflict>,
}
impl Exclusions {
    fn conflict(&mut self, key: SyncKey, name: String, reason: ConflictReason) {
        if self.keys.insert(key.clone()) {
            self.conflicts.push(Conflict { key, name, reason });
        }
    }

    fn contains(&self, key: &SyncKey) -> bool {
        self.keys.contains(key)
    }
}

/// Merges the local and remote deltas against the remote view of the baseline.
pub(super) fn merge(base: &Snapshot, mut local: SideDelta, mut remote: SideDelta) -> Merged {
    let mut merged = Merged::default();
    pair_folders(&mut local, &mut remote, &mut merged.converged);

    let mut excluded = Exclusions::default();
    let name_of = |key: &SyncKey| -> String {
        match key {
            SyncKey::Remote(id) if base.contains(id) => base.get(id).map(|n| n.name.clone()).unwrap_or_default(),
            _ => local.created.get(key).or_else(|| remote.created.get(key)).map(|c| c.name.clone()).unwrap_or_default(),
        }
    };

    deletes_against_changes(base, &local, &remote, &mut excluded, &name_of);
    deletes_against_changes(base, &remote, &local, &mut excluded, &name_of);

    let ids: BTreeSet<&NodeId> = local
        .deleted
        .keys()
        .chain(remote.deleted.keys())
        .chain(local.modified.keys())
        .chain(remote.modified.keys())
        .collect();
    for id in ids {
        let key = SyncKey::Remote(id.clone());
        if excluded.contains(&key) {
            continue;
        }
        match (local.deleted.get(id), remote.deleted.get(id)) {
            (Some(_), Some(_)) => {
                merged.converged.push(Convergence::Deleted(id.clone()));
                continue;
            },
            (Some(kind), None) => {
                merged.to_remote.push(ChangeOp::Delete { key, kind: *kind });
                continue;
            },
            (None, Some(kind)) => {
                merged.to_local.push(ChangeOp::Delete { key, kind: *kind });
                continue;
            },
            (None, None) => {},
        }

        let ours = local.modified.get(id).cloned().unwrap_or_default();
        let theirs = remote.modified.get(id).cloned().unwrap_or_default();
        let reason = match (&ours, &theirs) {
            (o, t) if o.name.is_some() && t.name.is_some() && o.name != t.name => Some(ConflictReason::BothRenamed),
            (o, t) if o.parent.is_some() && t.parent.is_some() && o.parent != t.parent => Some(ConflictReason::BothMoved),
            (o, t) if o.content.is_some() && t.content.is_some() => Some(ConflictReason::BothModified),
            _ => None,
        };
        if let Some(reason) = reason {
            tracing::info!(id = %id, %reason, "Conflict");
            excluded.conflict(key, name_of(&SyncKey::Remote(id.clone())), reason);
            continue;
        }

        match (ours.name, theirs.name) {
            (Some(name), Some(_)) => merged.converged.push(Convergence::Renamed(id.clone(), name)),
            (Some(name), None) => merged.to_remote.push(ChangeOp::Rename { key: key.clone(), name }),
            (None, Some(name)) => merged.to_local.push(ChangeOp::Rename { key: key.clone(), name }),
            (None, None) => {},
        }
        match (ours.parent, theirs.parent) {
            (Some(SyncKey::Remote(parent)), Some(_)) => merged.converged.push(Convergence::Moved(id.clone(), parent)),
            (Some(parent), None) => merged.to_remote.push(ChangeOp::Move { key: key.clone(), parent }),
            (None, Some(parent)) => merged.to_local.push(ChangeOp::Move { key: key.clone(), parent }),
            _ => {},
        }
        match (ours.content, theirs.content) {
            (Some((source, fingerprint)), None) => {
                merged.to_remote.push(ChangeOp::UpdateContent { key, source, fingerprint });
            },
            (None, Some((source, fingerprint))) => {
                merged.to_local.push(ChangeOp::UpdateContent { key, source, fingerprint });
            },
            _ => {},
        }
    }

    // Same name under the same parent on both sides, where not paired above.
    let slots: HashMap<(&SyncKey, &str), &SyncKey> =
        remote.created.iter().map(|(key, created)| ((&created.parent, created.name.as_str()), key)).collect();
    for (key, created) in &local.created {
        if let Some(theirs) = slots.get(&(&created.parent, created.name.as_str())) {
            tracing::info!(name = created.name, parent = %created.parent, "Conflict: created on both sides");
            excluded.conflict(key.clone(), created.name.clone(), ConflictReason::BothCreated);
            excluded.conflict((*theirs).clone(), created.name.clone(), ConflictReason::BothCreated);
        }
    }
    for (key, created) in &local.created {
        if !excluded.contains(key) {
            merged.to_remote.push(create(key, created));
        }
    }
    for (key, created) in &remote.created {
        if !excluded.contains(key) {
            merged.to_local.push(create(key, created));
        }
    }

    move_cycles(base, &mut merged, &mut excluded, &name_of);
    orphaned_by_exclusions(&mut merged, &mut excluded, &name_of);

    merged.conflicts = excluded.conflicts;
    merged
}

fn create(key: &SyncKey, created: &Created) -> ChangeOp {
    ChangeOp::Create {
        key: key.clone(),
        parent: created.parent.clone(),
        name: created.name.clone(),
        kind: created.kind,
        source: created.source.clone(),
        fingerprint: created.fingerprint.clone(),
    }
}

/// Folders created on both sides under the same name are the same folder.
///
/// Their local key is replaced by the remote one, so that their contents
/// line up and are merged like any other children.
fn pair_folders(local: &mut SideDelta, remote: &mut SideDelta, converged: &mut Vec<Convergence>) {
    loop {
        let slots: HashMap<(&SyncKey, &str), &SyncKey> = remote
            .created
            .iter()
            .filter(|(_, c)| c.kind == NodeKind::Folder)
            .map(|(key, c)| ((&c.parent, c.name.as_str()), key))
            .collect();
        let pairs: Vec<(SyncKey, SyncKey)> = local
            .created
            .iter()
            .filter(|(_, c)| c.kind == NodeKind::Folder)
            .filter_map(|(key, c)| Some((key.clone(), (*slots.get(&(&c.parent, c.name.as_str()))?).clone())))
            .collect();
        if pairs.is_empty() {
            return;
        }
        for (ours, theirs) in pairs {
            local.created.remove(&ours);
            let (SyncKey::Remote(id), Some(created)) = (&theirs, remote.created.remove(&theirs)) else {
                continue;
            };
            let SyncKey::Remote(parent) = created.parent else {
                continue;
            };
            tracing::debug!(local = %ours, remote = %theirs, name = created.name, "Pairing folders created on both sides");
            converged.push(Convergence::Paired {
                id: id.clone(),
                name: created.name,
                parent,
            });
            for other in local.created.values_mut() {
                if other.parent == ours {
                    other.parent = theirs.clone();
                }
            }
            for change in local.modified.values_mut() {
                if change.parent.as_ref() == Some(&ours) {
                    change.parent = Some(theirs.clone());
                }
            }
        }
    }
}

/// A folder deleted on one side while the other side changed something in it.
///
/// The folder, every offending change and the whole deleted subtree are kept
/// out of both changesets.
fn deletes_against_changes(
    base: &Snapshot,
    deleting: &SideDelta,
    other: &SideDelta,
    excluded: &mut Exclusions,
    name_of: &impl Fn(&SyncKey) -> String,
) {
    let reason = ConflictReason::DeleteModify { deleted: deleting.side };
    let tops = deleting.deleted.keys().filter(|id| {
        let parent = base.get(id).and_then(|n| n.parent.as_ref());
        !parent.is_some_and(|p| deleting.deleted.contains_key(p))
    });
    for top in tops {
        let subtree: HashSet<NodeId> = base.subtree(top).into_iter().collect();
        let mut offending: Vec<SyncKey> = Vec::new();
        for (id, change) in &other.modified {
            let moved_in = change.parent.as_ref().and_then(|p| anchor(base, other, p)).is_some_and(|a| subtree.contains(&a));
            if subtree.contains(id) || moved_in {
                offending.push(SyncKey::Remote(id.clone()));
            }
        }
        for (key, created) in &other.created {
            if anchor(base, other, &created.parent).is_some_and(|a| subtree.contains(&a)) {
                offending.push(key.clone());
            }
        }
        if offending.is_empty() {
            continue;
        }
        tracing::info!(id = %top, changes = offending.len(), "Conflict: deleted folder changed on the other side");
        excluded.conflict(SyncKey::Remote(top.clone()), name_of(&SyncKey::Remote(top.clone())), reason);
        for key in offending {
            let name = name_of(&key);
            excluded.conflict(key, name, reason);
        }
        excluded.keys.extend(subtree.into_iter().map(SyncKey::Remote));
    }
}

/// Nearest baseline folder a key hangs under, following created parents.
fn anchor(base: &Snapshot, delta: &SideDelta, key: &SyncKey) -> Option<NodeId> {
    let mut current = key;
    for _ in 0..=delta.created.len() {
        match current {
            SyncKey::Remote(id) if base.contains(id) => return Some(id.clone()),
            _ => current = &delta.created.get(current)?.parent,
        }
    }
    None
}

/// Moves that, together, would make a folder its own ancestor.
fn move_cycles(
    base: &Snapshot,
    merged: &mut Merged,
    excluded: &mut Exclusions,
    name_of: &impl Fn(&SyncKey) -> String,
) {
    let mut parents: HashMap<SyncKey, SyncKey> = HashMap::new();
    for node in base.nodes() {
        if let Some(parent) = &node.parent {
            parents.insert(SyncKey::Remote(node.id.clone()), SyncKey::Remote(parent.clone()));
        }
    }
    for convergence in &merged.converged {
        if let Convergence::Moved(id, parent) = convergence {
            parents.insert(SyncKey::Remote(id.clone()), SyncKey::Remote(parent.clone()));
        }
    }
    for op in merged.to_remote.iter().chain(&merged.to_local) {
        if let Some(parent) = op.new_parent() {
            parents.insert(op.key().clone(), parent.clone());
        }
    }
    let moved: Vec<SyncKey> = merged
        .to_remote
        .iter()
        .chain(&merged.to_local)
        .filter(|op| matches!(op, ChangeOp::Move { .. }))
        .map(|op| op.key().clone())
        .collect();
    for key in moved {
        let mut seen = HashSet::new();
        let mut current = parents.get(&key);
        while let Some(parent) = current {
            if parent == &key {
                tracing::info!(key = %key, "Conflict: moves form a cycle");
                excluded.conflict(key.clone(), name_of(&key), ConflictReason::DependencyCycle);
                break;
            }
            if !seen.insert(parent) {
                break;
            }
            current = parents.get(parent);
        }
    }
}

/// Drops every operation on an excluded key, then every operation placing a
/// node beneath one, until nothing changes.
fn orphaned_by_exclusions(merged: &mut Merged, excluded: &mut Exclusions, name_of: &impl Fn(&SyncKey) -> String) {
    loop {
        let mut orphaned: Vec<(SyncKey, String)> = Vec::new();
        for op in merged.to_remote.iter().chain(&merged.to_local) {
            if excluded.contains(op.key()) {
                continue;
            }
            if op.new_parent().is_some_and(|p| excluded.contains(p)) {
                let name = match op {
                    ChangeOp::Create { name, .. } => name.clone(),
                    _ => name_of(op.key()),
                };
                orphaned.push((op.key().clone(), name));
            }
        }
        let done = orphaned.is_empty();
        for (key, name) in orphaned {
            excluded.conflict(key, name, ConflictReason::ParentInConflict);
        }
        merged.to_remote.retain(|op| !excluded.contains(op.key()));
        merged.to_local.retain(|op| !excluded.contains(op.key()));
        if done {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::delta::delta;
    use super::*;
    use drivesync_snapshot::OrphanPolicy;
    use drivesync_storage::{Fingerprint, Node};

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::Stat { size: n, modified: 0 }
    }

    fn remote_tree(nodes: Vec<Node>) -> Snapshot {
        Snapshot::assemble(NodeId::new("root"), nodes, OrphanPolicy::Error).unwrap().snapshot
    }

    /// Runs both deltas on remote-addressed snapshots (no move tracking).
    fn run(base: &Snapshot, local: &Snapshot, remote: &Snapshot) -> Merged {
        let ours = delta(Side::Local, base, local, |id| Some(id.clone()), false);
        let theirs = delta(Side::Remote, base, remote, |id| Some(id.clone()), false);
        merge(base, ours, theirs)
    }

    fn base() -> Snapshot {
        remote_tree(vec![
            Node::folder("1", "docs", "root"),
            Node::file("2", "a.txt", "1", fp(1)),
            Node::file("3", "b.txt", "root", fp(2)),
            Node::folder("4", "photos", "root"),
        ])
    }

    fn with(base: &Snapshot, f: impl FnOnce(&mut Vec<Node>)) -> Snapshot {
        let mut nodes: Vec<Node> = base.nodes().cloned().collect();
        f(&mut nodes);
        remote_tree(nodes)
    }

    fn rename(nodes: &mut [Node], id: &str, name: &str) {
        if let Some(node) = nodes.iter_mut().find(|n| n.id.as_str() == id) {
            node.name = name.to_string();
        }
    }

    #[test]
    fn test_one_sided_changes_propagate() {
        let base = base();
        let local = with(&base, |n| rename(n, "3", "renamed.txt"));
        let remote = with(&base, |n| n.retain(|n| n.id.as_str() != "4"));
        let merged = run(&base, &local, &remote);
        assert!(merged.conflicts.is_empty());
        assert_eq!(merged.to_remote, vec![ChangeOp::Rename { key: SyncKey::Remote("3".into()), name: "renamed.txt".into() }]);
        assert_eq!(merged.to_local, vec![ChangeOp::Delete { key: SyncKey::Remote("4".into()), kind: NodeKind::Folder }]);
    }

    #[test]
    fn test_different_renames_conflict() {
        let base = base();
        let local = with(&base, |n| rename(n, "3", "B"));
        let remote = with(&base, |n| rename(n, "3", "C"));
        let merged = run(&base, &local, &remote);
        assert!(merged.to_remote.is_empty());
        assert!(merged.to_local.is_empty());
        assert_eq!(merged.conflicts.len(), 1);
        assert_eq!(merged.conflicts[0].key, SyncKey::Remote("3".into()));
        assert_eq!(merged.conflicts[0].reason, ConflictReason::BothRenamed);
    }

    #[test]
    fn test_same_rename_converges() {
        let base = base();
        let local = with(&base, |n| rename(n, "3", "B"));
        let merged = run(&base, &local, &local);
        assert!(merged.to_remote.is_empty() && merged.to_local.is_empty() && merged.conflicts.is_empty());
        assert_eq!(merged.converged, vec![Convergence::Renamed("3".into(), "B".into())]);
    }

    #[test]
    fn test_disjoint_attributes_merge() {
        let base = base();
        let local = with(&base, |n| rename(n, "2", "renamed.txt"));
        let remote = with(&base, |n| {
            if let Some(node) = n.iter_mut().find(|n| n.id.as_str() == "2") {
                node.fingerprint = Some(fp(9));
            }
        });
        let merged = run(&base, &local, &remote);
        assert!(merged.conflicts.is_empty());
        assert_eq!(merged.to_remote.len(), 1);
        assert!(matches!(&merged.to_local[..], [ChangeOp::UpdateContent { source, .. }] if source.as_str() == "2"));
    }

    #[test]
    fn test_content_changed_on_both_sides_conflicts() {
        let base = base();
        let change = |n: &mut Vec<Node>| {
            if let Some(node) = n.iter_mut().find(|n| n.id.as_str() == "3") {
                node.fingerprint = Some(fp(7));
            }
        };
        let merged = run(&base, &with(&base, change), &with(&base, change));
        assert_eq!(merged.conflicts[0].reason, ConflictReason::BothModified);
        assert!(merged.to_remote.is_empty() && merged.to_local.is_empty());
    }

    #[test]
    fn test_delete_against_change_inside() {
        let base = base();
        let local = with(&base, |n| n.retain(|n| !matches!(n.id.as_str(), "1" | "2")));
        let remote = with(&base, |n| {
            if let Some(node) = n.iter_mut().find(|n| n.id.as_str() == "2") {
                node.fingerprint = Some(fp(5));
            }
            n.push(Node::file("9", "new.txt", "1", fp(6)));
        });
        let merged = run(&base, &local, &remote);
        assert!(merged.to_remote.is_empty());
        assert!(merged.to_local.is_empty());
        let keys: BTreeSet<&str> = merged
            .conflicts
            .iter()
            .map(|c| match &c.key {
                SyncKey::Remote(id) | SyncKey::Local(id) => id.as_str(),
            })
            .collect();
        assert_eq!(keys, BTreeSet::from(["1", "2", "9"]));
        assert!(
            merged.conflicts.iter().all(|c| c.reason == ConflictReason::DeleteModify { deleted: Side::Local })
        );
    }

    #[test]
    fn test_delete_on_both_sides_converges() {
        let base = base();
        let gone = with(&base, |n| n.retain(|n| n.id.as_str() != "3"));
        let merged = run(&base, &gone, &gone);
        assert_eq!(merged.converged, vec![Convergence::Deleted("3".into())]);
    }

    #[test]
    fn test_same_file_created_on_both_sides_conflicts() {
        let base = base();
        let local = with(&base, |n| n.push(Node::file("l", "new.txt", "4", fp(1))));
        let remote = with(&base, |n| n.push(Node::file("r", "new.txt", "4", fp(2))));
        let merged = run(&base, &local, &remote);
        assert_eq!(merged.conflicts.len(), 2);
        assert!(merged.conflicts.iter().all(|c| c.reason == ConflictReason::BothCreated));
        assert!(merged.to_remote.is_empty() && merged.to_local.is_empty());
    }

    #[test]
    fn test_folders_created_on_both_sides_are_paired() {
        let base = remote_tree(vec![]);
        let local = snapshot_local(vec![
            Node::folder("music", "music", "."),
            Node::file("music/a.mp3", "a.mp3", "music", fp(1)),
        ]);
        let remote = remote_tree(vec![Node::folder("r1", "music", "root"), Node::file("r2", "b.mp3", "r1", fp(2))]);
        let views = drivesync_snapshot::Baseline::empty(NodeId::new("root")).views();
        let ours = delta(Side::Local, &views.local, &local, |id| views.to_remote.get(id).cloned(), true);
        let theirs = delta(Side::Remote, &views.remote, &remote, |id| Some(id.clone()), false);
        let merged = merge(&base, ours, theirs);
        assert!(merged.conflicts.is_empty());
        assert_eq!(
            merged.converged,
            vec![Convergence::Paired { id: "r1".into(), name: "music".into(), parent: "root".into() }]
        );
        assert!(matches!(
            &merged.to_remote[..],
            [ChangeOp::Create { parent: SyncKey::Remote(p), name, .. }] if p.as_str() == "r1" && name == "a.mp3"
        ));
        assert!(matches!(&merged.to_local[..], [ChangeOp::Create { name, .. }] if name == "b.mp3"));
    }

    #[test]
    fn test_children_of_conflicting_creates_are_excluded() {
        let base = remote_tree(vec![]);
        let local = snapshot_local(vec![
            Node::file("x", "x", ".", fp(1)),
            Node::folder("dir", "dir", "."),
            Node::file("dir/inner", "inner", "dir", fp(1)),
        ]);
        let remote = remote_tree(vec![Node::folder("r1", "x", "root")]);
        let views = drivesync_snapshot::Baseline::empty(NodeId::new("root")).views();
        let ours = delta(Side::Local, &views.local, &local, |id| views.to_remote.get(id).cloned(), true);
        let theirs = delta(Side::Remote, &views.remote, &remote, |id| Some(id.clone()), false);
        let merged = merge(&base, ours, theirs);
        // "x" is a file here and a folder there; "dir" goes through.
        assert_eq!(merged.conflicts.len(), 2);
        assert_eq!(merged.to_remote.len(), 2);
        assert!(merged.to_local.is_empty());
    }

    #[test]
    fn test_moves_into_each_other_conflict() {
        let base = remote_tree(vec![Node::folder("a", "a", "root"), Node::folder("b", "b", "root")]);
        let local = remote_tree(vec![Node::folder("a", "a", "b"), Node::folder("b", "b", "root")]);
        let remote = remote_tree(vec![Node::folder("a", "a", "root"), Node::folder("b", "b", "a")]);
        let merged = run(&base, &local, &remote);
        assert!(merged.to_remote.is_empty() && merged.to_local.is_empty());
        assert!(merged.conflicts.iter().all(|c| c.reason == ConflictReason::DependencyCycle));
        assert_eq!(merged.conflicts.len(), 2);
    }

    fn snapshot_local(nodes: Vec<Node>) -> Snapshot {
        Snapshot::assemble(NodeId::local_root(), nodes, OrphanPolicy::Error).unwrap().snapshot
    }
}
