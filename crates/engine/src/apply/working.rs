//! The baseline as it is being rewritten by one cycle.

use crate::diff::{ChangeOp, Convergence, Side, SyncKey};
use drivesync_snapshot::{Baseline, BaselineEntry};
use drivesync_storage::{Addressing, Fingerprint, NodeId, NodeKind, Receipt};
use std::collections::{HashMap, HashSet};

/// Working copy of the baseline, keyed by remote id.
///
/// Seeded from the last baseline and mutated only by confirmed operations,
/// so that at any point it describes what both sides are known to agree on.
/// It also resolves sync keys into the identifiers each side understands.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    remote_root: NodeId,
    remote_addressing: Addressing,
    entries: HashMap<NodeId, BaselineEntry>,
    /// Remote ids handed out for nodes that were created from local ones.
    rekeyed: HashMap<NodeId, NodeId>,
    /// Current id of remote nodes whose id changed during the cycle.
    moved: HashMap<NodeId, NodeId>,
}

impl WorkingTree {
    pub fn new(baseline: &Baseline, remote_addressing: Addressing) -> Self {
        Self {
            remote_root: baseline.remote_root().clone(),
            remote_addressing,
            entries: baseline.entries().iter().map(|e| (e.id.clone(), e.clone())).collect(),
            rekeyed: HashMap::new(),
            moved: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&BaselineEntry> {
        self.entries.get(id)
    }

    /// Records changes both sides already agree on.
    pub fn converge(&mut self, convergences: &[Convergence]) {
        for convergence in convergences {
            match convergence {
                Convergence::Deleted(id) => {
                    self.entries.remove(id);
                },
                Convergence::Renamed(id, name) => {
                    if let Some(entry) = self.entries.get_mut(id) {
                        entry.name = name.clone();
                    }
                },
                Convergence::Moved(id, parent) => {
                    if let Some(entry) = self.entries.get_mut(id) {
                        entry.parent = parent.clone();
                    }
                },
                Convergence::Paired { id, name, parent } => {
                    self.entries.insert(
                        id.clone(),
                        BaselineEntry {
                            id: id.clone(),
                            name: name.clone(),
                            kind: NodeKind::Folder,
                            parent: parent.clone(),
                            remote_fingerprint: None,
                            local_fingerprint: None,
                        },
                    );
                },
            }
        }
    }

    /// Remote id of the node behind `key`, if it exists on the remote.
    pub fn remote_id(&self, key: &SyncKey) -> Option<NodeId> {
        match key {
            SyncKey::Remote(id) => Some(self.current_remote_id(id)),
            SyncKey::Local(path) => self.rekeyed.get(path).cloned(),
        }
    }

    /// Where remote node `id` is now. On a path-addressed remote this also
    /// covers nodes below a folder that was renamed or moved this cycle.
    pub fn current_remote_id(&self, id: &NodeId) -> NodeId {
        if let Some(current) = self.moved.get(id) {
            return current.clone();
        }
        if self.remote_addressing == Addressing::Path && !self.moved.is_empty() {
            let mut ancestor = id.parent_path();
            while let Some(folder) = ancestor {
                if let Some(current) = self.moved.get(&folder) {
                    let below = id.as_str()[folder.as_str().len()..].trim_start_matches('/');
                    return current.child(below);
                }
                ancestor = folder.parent_path();
            }
        }
        id.clone()
    }

    /// Identifier of the node behind `key` on `side`.
    ///
    /// Remote ids follow any rekeying earlier in the cycle; local ids are
    /// paths rebuilt from the chain of names, so they follow earlier renames
    /// and moves.
    pub fn locate(&self, key: &SyncKey, side: Side) -> Option<NodeId> {
        let id = self.remote_id(key)?;
        match side {
            Side::Remote => Some(id),
            Side::Local => self.path_of(&id),
        }
    }

    fn path_of(&self, id: &NodeId) -> Option<NodeId> {
        let mut names = Vec::new();
        let mut current = id;
        while current != &self.remote_root {
            let entry = self.entries.get(current)?;
            names.push(entry.name.as_str());
            if names.len() > self.entries.len() {
                return None;
            }
            current = &entry.parent;
        }
        Some(names.iter().rev().fold(NodeId::local_root(), |path, name| path.child(name)))
    }

    /// Records a confirmed operation on `target`.
    ///
    /// `receipt` is what the target reported last. For files, `written` tells
    /// whether the content made it across: a file that was created but not
    /// written is recorded without a source fingerprint, so that the next
    /// cycle sees the source as changed and sends the content again.
    pub fn record(&mut self, target: Side, op: &ChangeOp, receipt: Option<&Receipt>, written: bool) {
        let fingerprints = |entry: &mut BaselineEntry, source: Option<Fingerprint>| {
            let (on_target, on_source) = match target {
                Side::Remote => (&mut entry.remote_fingerprint, &mut entry.local_fingerprint),
                Side::Local => (&mut entry.local_fingerprint, &mut entry.remote_fingerprint),
            };
            if let Some(fingerprint) = receipt.and_then(|r| r.fingerprint.clone()) {
                *on_target = Some(fingerprint);
            }
            *on_source = if written { source } else { None };
        };
        match op {
            ChangeOp::Create {
                key,
                parent,
                name,
                kind,
                fingerprint,
                ..
            } => {
                let id = match (target, receipt) {
                    (Side::Remote, Some(receipt)) => receipt.id.clone(),
                    (Side::Remote, None) => return,
                    (Side::Local, _) => match self.remote_id(key) {
                        Some(id) => id,
                        None => return,
                    },
                };
                let Some(parent) = self.remote_id(parent) else {
                    return;
                };
                if let SyncKey::Local(path) = key {
                    self.rekeyed.insert(path.clone(), id.clone());
                }
                let mut entry = BaselineEntry {
                    id: id.clone(),
                    name: name.clone(),
                    kind: *kind,
                    parent,
                    remote_fingerprint: None,
                    local_fingerprint: None,
                };
                if *kind == NodeKind::File {
                    fingerprints(&mut entry, fingerprint.clone());
                }
                self.entries.insert(id, entry);
            },
            ChangeOp::Delete { key, .. } => {
                if let Some(id) = self.remote_id(key) {
                    self.entries.remove(&id);
                }
            },
            ChangeOp::Rename { key, name } => {
                let Some(id) = self.remote_id(key) else {
                    return;
                };
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.name = name.clone();
                }
                self.follow_receipt(target, &id, receipt);
            },
            ChangeOp::Move { key, parent } => {
                let (Some(id), Some(parent)) = (self.remote_id(key), self.remote_id(parent)) else {
                    return;
                };
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.parent = parent;
                }
                self.follow_receipt(target, &id, receipt);
            },
            ChangeOp::UpdateContent { key, fingerprint, .. } => {
                let Some(id) = self.remote_id(key) else {
                    return;
                };
                if let Some(entry) = self.entries.get_mut(&id) {
                    fingerprints(entry, fingerprint.clone());
                }
            },
        }
    }

    /// A path-addressed remote hands out a new id after a rename or move.
    fn follow_receipt(&mut self, target: Side, id: &NodeId, receipt: Option<&Receipt>) {
        match (target, receipt) {
            (Side::Remote, Some(receipt)) if &receipt.id != id => self.rekey(id, &receipt.id),
            _ => {},
        }
    }

    fn rekey(&mut self, old: &NodeId, new: &NodeId) {
        let Some(mut entry) = self.entries.remove(old) else {
            return;
        };
        entry.id = new.clone();
        self.entries.insert(new.clone(), entry);
        for id in self.rekeyed.values_mut().chain(self.moved.values_mut()).filter(|id| **id == *old) {
            *id = new.clone();
        }
        // An id already in the map was vacated earlier and now belongs to a
        // node created this cycle.
        self.moved.entry(old.clone()).or_insert_with(|| new.clone());
        let children: Vec<(NodeId, String)> = self
            .entries
            .values()
            .filter(|e| &e.parent == old)
            .map(|e| (e.id.clone(), e.name.clone()))
            .collect();
        for (child, name) in children {
            if let Some(entry) = self.entries.get_mut(&child) {
                entry.parent = new.clone();
            }
            if self.remote_addressing == Addressing::Path {
                self.rekey(&child, &new.child(&name));
            }
        }
    }

    /// The new baseline: every entry still reachable from the remote root.
    pub fn into_baseline(self) -> Baseline {
        let mut reachable: HashSet<NodeId> = HashSet::from([self.remote_root.clone()]);
        let mut children: HashMap<&NodeId, Vec<&BaselineEntry>> = HashMap::new();
        for entry in self.entries.values() {
            children.entry(&entry.parent).or_default().push(entry);
        }
        let mut stack = vec![&self.remote_root];
        let mut entries = Vec::with_capacity(self.entries.len());
        while let Some(id) = stack.pop() {
            for child in children.get(id).into_iter().flatten() {
                if reachable.insert(child.id.clone()) {
                    entries.push((*child).clone());
                    stack.push(&child.id);
                }
            }
        }
        if entries.len() < self.entries.len() {
            tracing::warn!(dropped = self.entries.len() - entries.len(), "Dropping unreachable baseline entries");
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Baseline::new(self.remote_root.clone(), entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: &str, kind: NodeKind, parent: &str) -> BaselineEntry {
        BaselineEntry {
            id: NodeId::new(id),
            name: name.to_string(),
            kind,
            parent: NodeId::new(parent),
            remote_fingerprint: None,
            local_fingerprint: None,
        }
    }

    fn tree(addressing: Addressing) -> WorkingTree {
        let root = match addressing {
            Addressing::Opaque => "root",
            Addressing::Path => ".",
        };
        let entries = match addressing {
            Addressing::Opaque => vec![entry("1", "docs", NodeKind::Folder, root), entry("2", "a.txt", NodeKind::File, "1")],
            Addressing::Path => vec![
                entry("docs", "docs", NodeKind::Folder, root),
                entry("docs/a.txt", "a.txt", NodeKind::File, "docs"),
            ],
        };
        WorkingTree::new(&Baseline::new(NodeId::new(root), entries), addressing)
    }

    #[test]
    fn test_local_paths_follow_renames() {
        let mut tree = tree(Addressing::Opaque);
        let key = SyncKey::Remote(NodeId::new("2"));
        assert_eq!(tree.locate(&key, Side::Local), Some(NodeId::new("docs/a.txt")));
        assert_eq!(tree.locate(&key, Side::Remote), Some(NodeId::new("2")));
        let rename = ChangeOp::Rename { key: SyncKey::Remote(NodeId::new("1")), name: "papers".to_string() };
        tree.record(Side::Local, &rename, None, true);
        assert_eq!(tree.locate(&key, Side::Local), Some(NodeId::new("papers/a.txt")));
    }

    #[test]
    fn test_created_nodes_are_rekeyed() {
        let mut tree = tree(Addressing::Opaque);
        let key = SyncKey::Local(NodeId::new("docs/new.txt"));
        let create = ChangeOp::Create {
            key: key.clone(),
            parent: SyncKey::Remote(NodeId::new("1")),
            name: "new.txt".to_string(),
            kind: NodeKind::File,
            source: NodeId::new("docs/new.txt"),
            fingerprint: Some(Fingerprint::Stat { size: 1, modified: 1 }),
        };
        let receipt = Receipt { id: NodeId::new("77"), fingerprint: Some(Fingerprint::of_content(b"x")) };
        tree.record(Side::Remote, &create, Some(&receipt), true);
        assert_eq!(tree.remote_id(&key), Some(NodeId::new("77")));
        let entry = tree.get(&NodeId::new("77")).unwrap();
        assert_eq!(entry.local_fingerprint, Some(Fingerprint::Stat { size: 1, modified: 1 }));
        assert_eq!(entry.remote_fingerprint, Some(Fingerprint::of_content(b"x")));
    }

    #[test]
    fn test_unwritten_file_has_no_source_fingerprint() {
        let mut tree = tree(Addressing::Opaque);
        let create = ChangeOp::Create {
            key: SyncKey::Remote(NodeId::new("9")),
            parent: SyncKey::Remote(NodeId::new("root")),
            name: "b.txt".to_string(),
            kind: NodeKind::File,
            source: NodeId::new("9"),
            fingerprint: Some(Fingerprint::of_content(b"remote")),
        };
        let receipt = Receipt { id: NodeId::new("b.txt"), fingerprint: Some(Fingerprint::Stat { size: 0, modified: 5 }) };
        tree.record(Side::Local, &create, Some(&receipt), false);
        let entry = tree.get(&NodeId::new("9")).unwrap();
        assert_eq!(entry.remote_fingerprint, None);
        assert_eq!(entry.local_fingerprint, Some(Fingerprint::Stat { size: 0, modified: 5 }));
    }

    #[test]
    fn test_path_addressed_remote_rekeys_subtree() {
        let mut tree = tree(Addressing::Path);
        let rename = ChangeOp::Rename { key: SyncKey::Remote(NodeId::new("docs")), name: "papers".to_string() };
        let receipt = Receipt { id: NodeId::new("papers"), fingerprint: None };
        tree.record(Side::Remote, &rename, Some(&receipt), true);
        assert!(tree.get(&NodeId::new("docs")).is_none());
        let child = tree.get(&NodeId::new("papers/a.txt")).unwrap();
        assert_eq!(child.parent, NodeId::new("papers"));
    }

    #[test]
    fn test_remote_keys_follow_rekeyed_ids() {
        let mut tree = tree(Addressing::Path);
        let rename = ChangeOp::Rename { key: SyncKey::Remote(NodeId::new("docs")), name: "papers".to_string() };
        tree.record(Side::Remote, &rename, Some(&Receipt { id: NodeId::new("papers"), fingerprint: None }), true);
        let docs = SyncKey::Remote(NodeId::new("docs"));
        assert_eq!(tree.locate(&docs, Side::Remote), Some(NodeId::new("papers")));
        assert_eq!(tree.locate(&docs, Side::Local), Some(NodeId::new("papers")));
        assert_eq!(tree.remote_id(&SyncKey::Remote(NodeId::new("docs/a.txt"))), Some(NodeId::new("papers/a.txt")));

        // A second rekey of the same node is followed from its original id.
        let archive = ChangeOp::Create {
            key: SyncKey::Local(NodeId::new("archive")),
            parent: SyncKey::Remote(NodeId::new(".")),
            name: "archive".to_string(),
            kind: NodeKind::Folder,
            source: NodeId::new("archive"),
            fingerprint: None,
        };
        tree.record(Side::Remote, &archive, Some(&Receipt { id: NodeId::new("archive"), fingerprint: None }), true);
        let relocate = ChangeOp::Move { key: docs.clone(), parent: SyncKey::Local(NodeId::new("archive")) };
        let receipt = Receipt { id: NodeId::new("archive/papers"), fingerprint: None };
        tree.record(Side::Remote, &relocate, Some(&receipt), true);
        assert_eq!(tree.remote_id(&docs), Some(NodeId::new("archive/papers")));
        assert_eq!(
            tree.remote_id(&SyncKey::Remote(NodeId::new("docs/a.txt"))),
            Some(NodeId::new("archive/papers/a.txt"))
        );

        // Creating under the renamed folder lands in its new location.
        let create = ChangeOp::Create {
            key: SyncKey::Local(NodeId::new("archive/papers/new.txt")),
            parent: docs,
            name: "new.txt".to_string(),
            kind: NodeKind::File,
            source: NodeId::new("archive/papers/new.txt"),
            fingerprint: None,
        };
        let receipt = Receipt { id: NodeId::new("archive/papers/new.txt"), fingerprint: None };
        tree.record(Side::Remote, &create, Some(&receipt), true);
        let entry = tree.get(&NodeId::new("archive/papers/new.txt")).unwrap();
        assert_eq!(entry.parent, NodeId::new("archive/papers"));
        assert_eq!(tree.into_baseline().len(), 4);
    }

    #[test]
    fn test_unknown_remote_nodes_follow_renamed_folders() {
        let mut tree = tree(Addressing::Path);
        let rename = ChangeOp::Rename { key: SyncKey::Remote(NodeId::new("docs")), name: "papers".to_string() };
        tree.record(Side::Remote, &rename, Some(&Receipt { id: NodeId::new("papers"), fingerprint: None }), true);
        assert_eq!(tree.current_remote_id(&NodeId::new("docs/sub/new.txt")), NodeId::new("papers/sub/new.txt"));
        assert_eq!(tree.current_remote_id(&NodeId::new("docsy.txt")), NodeId::new("docsy.txt"));
    }

    #[test]
    fn test_unreachable_entries_are_dropped() {
        let mut tree = tree(Addressing::Opaque);
        tree.converge(&[Convergence::Deleted(NodeId::new("1"))]);
        let baseline = tree.into_baseline();
        assert!(baseline.is_empty());
    }
}
