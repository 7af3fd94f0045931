//! Dependency ordering of one changeset.

use super::{ChangeOp, Changeset, Conflict, ConflictReason, PlannedOp, Side, SyncKey};
use drivesync_snapshot::Snapshot;
use std::collections::{BTreeSet, HashMap, HashSet};

type Slot = (SyncKey, String);

/// Orders `ops` so that every operation comes after the ones it depends on:
///
/// - a Create or Move after the Create or Move of its new parent;
/// - anything taking a name in a folder after whatever frees that name;
/// - a folder's Delete after the Deletes of its children and the Moves out
///   of it;
/// - operations on the same node in the order they were produced.
///
/// Among the operations that are ready, non-deletes go first, then by key.
/// Operations that can never become ready depend on each other in a cycle;
/// they are removed and reported as conflicts.
pub(super) fn order(target: Side, ops: Vec<ChangeOp>, base: &Snapshot, conflicts: &mut Vec<Conflict>) -> Changeset {
    let deps = dependencies(&ops, base);

    let sorted = {
        let mut blocking: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ops.len()];
        for (index, before) in deps.iter().enumerate() {
            for &dependency in before {
                dependents[dependency].push(index);
            }
        }
        let mut ready: BTreeSet<(bool, &SyncKey, usize)> = (0..ops.len())
            .filter(|&index| blocking[index] == 0)
            .map(|index| (ops[index].is_delete(), ops[index].key(), index))
            .collect();
        let mut sorted = Vec::with_capacity(ops.len());
        while let Some((_, _, index)) = ready.pop_first() {
            sorted.push(index);
            for &dependent in &dependents[index] {
                blocking[dependent] -= 1;
                if blocking[dependent] == 0 {
                    ready.insert((ops[dependent].is_delete(), ops[dependent].key(), dependent));
                }
            }
        }
        sorted
    };

    if sorted.len() < ops.len() {
        let placed: HashSet<usize> = sorted.iter().copied().collect();
        let mut reported: HashSet<SyncKey> = conflicts.iter().map(|c| c.key.clone()).collect();
        for (_, op) in ops.iter().enumerate().filter(|(index, _)| !placed.contains(index)) {
            tracing::info!(%target, op = %op, "Conflict: operations wait on each other");
            if reported.insert(op.key().clone()) {
                conflicts.push(Conflict {
                    key: op.key().clone(),
                    name: display_name(op, base),
                    reason: ConflictReason::DependencyCycle,
                });
            }
        }
    }

    let position: HashMap<usize, usize> = sorted.iter().enumerate().map(|(new, &old)| (old, new)).collect();
    let mut placed: HashMap<&SyncKey, Vec<&SyncKey>> = HashMap::new();
    for op in &ops {
        if let Some(parent) = op.new_parent() {
            placed.entry(op.key()).or_default().push(parent);
        }
    }
    let lineages: Vec<HashSet<SyncKey>> = sorted.iter().map(|&old| lineage(ops[old].key(), &placed, base)).collect();
    let mut slots: Vec<Option<ChangeOp>> = ops.into_iter().map(Some).collect();
    let planned = sorted
        .iter()
        .zip(lineages)
        .filter_map(|(&old, lineage)| {
            let mut depends_on: Vec<usize> = deps[old].iter().filter_map(|d| position.get(d).copied()).collect();
            depends_on.sort_unstable();
            depends_on.dedup();
            Some(PlannedOp {
                op: slots[old].take()?,
                depends_on,
                lineage,
            })
        })
        .collect();
    Changeset { target, ops: planned }
}

fn display_name(op: &ChangeOp, base: &Snapshot) -> String {
    match op {
        ChangeOp::Create { name, .. } | ChangeOp::Rename { name, .. } => name.clone(),
        _ => match op.key() {
            SyncKey::Remote(id) => base.get(id).map(|n| n.name.clone()).unwrap_or_default(),
            SyncKey::Local(path) => path.to_string(),
        },
    }
}

fn dependencies(ops: &[ChangeOp], base: &Snapshot) -> Vec<Vec<usize>> {
    let baseline_parent = |key: &SyncKey| match key {
        SyncKey::Remote(id) => base.get(id).and_then(|n| n.parent.clone()).map(SyncKey::Remote),
        SyncKey::Local(_) => None,
    };
    let baseline_name = |key: &SyncKey| match key {
        SyncKey::Remote(id) => base.get(id).map(|n| n.name.clone()),
        SyncKey::Local(_) => None,
    };
    let new_name: HashMap<&SyncKey, &str> = ops
        .iter()
        .filter_map(|op| match op {
            ChangeOp::Rename { key, name } => Some((key, name.as_str())),
            _ => None,
        })
        .collect();

    let mut by_key: HashMap<&SyncKey, Vec<usize>> = HashMap::new();
    let mut vacating: HashMap<Slot, Vec<usize>> = HashMap::new();
    let mut claims: Vec<Option<Slot>> = vec![None; ops.len()];
    for (index, op) in ops.iter().enumerate() {
        by_key.entry(op.key()).or_default().push(index);
        let before = baseline_parent(op.key()).zip(baseline_name(op.key()));
        match op {
            ChangeOp::Create { parent, name, .. } => claims[index] = Some((parent.clone(), name.clone())),
            ChangeOp::Delete { .. } => {
                if let Some(slot) = before {
                    vacating.entry(slot).or_default().push(index);
                }
            },
            ChangeOp::Rename { name, .. } => {
                if let Some((parent, old)) = before {
                    claims[index] = Some((parent.clone(), name.clone()));
                    vacating.entry((parent, old)).or_default().push(index);
                }
            },
            ChangeOp::Move { key, parent } => {
                if let Some((old_parent, old_name)) = before {
                    let name = new_name.get(key).map_or(old_name, |n| n.to_string());
                    claims[index] = Some((parent.clone(), name.clone()));
                    vacating.entry((old_parent, name)).or_default().push(index);
                }
            },
            ChangeOp::UpdateContent { .. } => {},
        }
    }

    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); ops.len()];
    for (index, op) in ops.iter().enumerate() {
        let key = op.key();
        let earlier = by_key.get(key).into_iter().flatten().copied().filter(|&other| other < index);
        deps[index].extend(earlier);
        if let Some(parent) = op.new_parent() {
            let placing = by_key.get(parent).into_iter().flatten().copied();
            deps[index].extend(placing.filter(|&p| matches!(ops[p], ChangeOp::Create { .. } | ChangeOp::Move { .. })));
        }
        if let Some(slot) = &claims[index] {
            let freeing = vacating.get(slot).into_iter().flatten().copied();
            deps[index].extend(freeing.filter(|&v| ops[v].key() != key));
        }
        if matches!(op, ChangeOp::Delete { kind: drivesync_storage::NodeKind::Folder, .. }) {
            let clearing = ops.iter().enumerate().filter(|(_, other)| {
                matches!(other, ChangeOp::Delete { .. } | ChangeOp::Move { .. })
                    && baseline_parent(other.key()).as_ref() == Some(key)
            });
            deps[index].extend(clearing.map(|(other, _)| other));
        }
        deps[index].sort_unstable();
        deps[index].dedup();
        deps[index].retain(|&other| other != index);
    }
    deps
}

/// `key` and every folder above it, before or after the changeset.
fn lineage(key: &SyncKey, placed: &HashMap<&SyncKey, Vec<&SyncKey>>, base: &Snapshot) -> HashSet<SyncKey> {
    let mut lineage = HashSet::new();
    let mut stack = vec![key.clone()];
    while let Some(key) = stack.pop() {
        if lineage.contains(&key) {
            continue;
        }
        if let SyncKey::Remote(id) = &key {
            stack.extend(base.get(id).and_then(|n| n.parent.clone()).map(SyncKey::Remote));
        }
        stack.extend(placed.get(&key).into_iter().flatten().map(|p| (*p).clone()));
        lineage.insert(key);
    }
    lineage
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivesync_snapshot::OrphanPolicy;
    use drivesync_storage::{Node, NodeId, NodeKind};

    fn base() -> Snapshot {
        let nodes = vec![
            Node::folder("1", "docs", "root"),
            Node::folder("2", "old", "1"),
            Node::folder("3", "a", "root"),
            Node::folder("4", "b", "root"),
        ];
        Snapshot::assemble(NodeId::new("root"), nodes, OrphanPolicy::Error).unwrap().snapshot
    }

    fn remote(id: &str) -> SyncKey {
        SyncKey::Remote(NodeId::new(id))
    }

    fn local(path: &str) -> SyncKey {
        SyncKey::Local(NodeId::new(path))
    }

    fn create(path: &str, parent: SyncKey, kind: NodeKind) -> ChangeOp {
        ChangeOp::Create {
            key: local(path),
            parent,
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            kind,
            source: NodeId::new(path),
            fingerprint: None,
        }
    }

    fn keys(changeset: &Changeset) -> Vec<String> {
        changeset.iter().map(|op| op.key().to_string()).collect()
    }

    #[test]
    fn test_parents_are_created_first() {
        let ops = vec![
            create("z/y/x.txt", local("z/y"), NodeKind::File),
            create("z/y", local("z"), NodeKind::Folder),
            create("z", remote("root"), NodeKind::Folder),
        ];
        let mut conflicts = Vec::new();
        let changeset = order(Side::Remote, ops, &base(), &mut conflicts);
        assert!(conflicts.is_empty());
        assert_eq!(keys(&changeset), vec!["local:z", "local:z/y", "local:z/y/x.txt"]);
        assert_eq!(changeset.ops[1].depends_on, vec![0]);
        assert_eq!(changeset.ops[2].depends_on, vec![1]);
    }

    #[test]
    fn test_children_are_deleted_first_and_deletes_go_last() {
        let ops = vec![
            ChangeOp::Delete { key: remote("1"), kind: NodeKind::Folder },
            ChangeOp::Delete { key: remote("2"), kind: NodeKind::Folder },
            create("new", remote("root"), NodeKind::Folder),
        ];
        let mut conflicts = Vec::new();
        let changeset = order(Side::Local, ops, &base(), &mut conflicts);
        assert_eq!(keys(&changeset), vec!["local:new", "remote:2", "remote:1"]);
        assert_eq!(changeset.ops[2].depends_on, vec![1]);
    }

    #[test]
    fn test_moves_out_precede_delete() {
        let ops = vec![
            ChangeOp::Delete { key: remote("1"), kind: NodeKind::Folder },
            ChangeOp::Move { key: remote("2"), parent: remote("3") },
        ];
        let mut conflicts = Vec::new();
        let changeset = order(Side::Local, ops, &base(), &mut conflicts);
        assert_eq!(keys(&changeset), vec!["remote:2", "remote:1"]);
        assert_eq!(changeset.ops[1].depends_on, vec![0]);
    }

    #[test]
    fn test_freed_name_is_taken_afterwards() {
        // "a" is deleted and a new "a" created in its place.
        let ops = vec![
            create("a", remote("root"), NodeKind::File),
            ChangeOp::Delete { key: remote("3"), kind: NodeKind::Folder },
        ];
        let mut conflicts = Vec::new();
        let changeset = order(Side::Remote, ops, &base(), &mut conflicts);
        assert_eq!(keys(&changeset), vec!["remote:3", "local:a"]);
    }

    #[test]
    fn test_swapped_names_are_a_cycle() {
        let ops = vec![
            ChangeOp::Rename { key: remote("3"), name: "b".to_string() },
            ChangeOp::Rename { key: remote("4"), name: "a".to_string() },
        ];
        let mut conflicts = Vec::new();
        let changeset = order(Side::Local, ops, &base(), &mut conflicts);
        assert!(changeset.is_empty());
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.iter().all(|c| c.reason == ConflictReason::DependencyCycle));
    }

    #[test]
    fn test_overlap() {
        let ops = vec![
            ChangeOp::Rename { key: remote("1"), name: "documents".to_string() },
            ChangeOp::Rename { key: remote("2"), name: "older".to_string() },
            ChangeOp::Rename { key: remote("4"), name: "c".to_string() },
        ];
        let mut conflicts = Vec::new();
        let changeset = order(Side::Local, ops, &base(), &mut conflicts);
        assert_eq!(keys(&changeset), vec!["remote:1", "remote:2", "remote:4"]);
        assert_eq!(changeset.overlapping(), vec![vec![1], vec![], vec![]]);
    }
}
