//! Immutable node trees and their two-pass assembly from flat records.

use crate::error::{ErrorKind, Result};
use derive_more::Display;
use drivesync_storage::{Node, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use time::UtcDateTime;

/// What to do with a record whose parent never shows up (or that is part of
/// a parent cycle).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrphanPolicy {
    /// Hang the record directly below the root and report it.
    #[default]
    #[serde(rename = "attach")]
    AttachToRoot,
    /// Fail the whole build.
    #[serde(rename = "error")]
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Problem {
    #[display("missing identifier")]
    MissingId,
    #[display("duplicate identifier")]
    DuplicateId,
    #[display("duplicate sibling name")]
    DuplicateName,
    #[display("parent not found, attached to root")]
    Orphaned,
    #[display("parent cycle, attached to root")]
    Cycle,
}

/// A record that was dropped or repaired while assembling a tree.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{name} ({problem})")]
pub struct MalformedRecord {
    pub id: Option<NodeId>,
    pub name: String,
    pub problem: Problem,
}
impl MalformedRecord {
    pub fn new(id: Option<NodeId>, name: impl Into<String>, problem: Problem) -> Self {
        Self {
            id,
            name: name.into(),
            problem,
        }
    }
}

/// Result of [`Snapshot::assemble`].
#[derive(Debug)]
pub struct Assembled {
    pub snapshot: Snapshot,
    pub malformed: Vec<MalformedRecord>,
}

/// Immutable, timestamped tree of one side of a sync.
///
/// Always contains its root. Children are derived from parent links and kept
/// ordered by name, then id. Some subtrees may be marked *incomplete*: they
/// could not be read entirely, so a node missing beneath them says nothing
/// about whether it still exists.
#[derive(Debug, Clone)]
pub struct Snapshot {
    taken_at: UtcDateTime,
    root: NodeId,
    nodes: HashMap<NodeId, Node>,
    children: HashMap<NodeId, Vec<NodeId>>,
    incomplete: BTreeSet<NodeId>,
}

impl Snapshot {
    /// A snapshot holding only its root.
    pub fn empty(root: NodeId) -> Self {
        Self {
            taken_at: UtcDateTime::now(),
            nodes: HashMap::from([(root.clone(), Node::root(root.clone()))]),
            root,
            children: HashMap::new(),
            incomplete: BTreeSet::new(),
        }
    }

    /// Builds a tree from flat nodes that may arrive in any order.
    ///
    /// The first pass indexes every node by id; the second repairs what the
    /// records got wrong:
    /// - later duplicates of an id are dropped;
    /// - nodes whose parent is missing (or is a file) and nodes on a parent
    ///   cycle (the smallest id of each cycle) are handled per `policy`;
    /// - among siblings sharing a name, the smallest id wins; the others are
    ///   dropped with their subtrees, and marked incomplete.
    ///
    /// A node carrying the root's id is ignored; the root is synthesized.
    pub fn assemble(root: NodeId, nodes: impl IntoIterator<Item = Node>, policy: OrphanPolicy) -> Result<Assembled> {
        let mut malformed = Vec::new();
        let mut map: HashMap<NodeId, Node> = HashMap::new();
        for mut node in nodes {
            if node.id == root {
                continue;
            }
            if map.contains_key(&node.id) {
                tracing::warn!(id = %node.id, name = node.name, "Ignoring record with duplicate identifier");
                malformed.push(MalformedRecord::new(Some(node.id), node.name, Problem::DuplicateId));
                continue;
            }
            if node.is_folder() {
                node.fingerprint = None;
            }
            map.insert(node.id.clone(), node);
        }
        let mut ids: Vec<NodeId> = map.keys().cloned().collect();
        ids.sort();

        for id in &ids {
            let attached = map[id].parent.as_ref().is_some_and(|p| p == &root || map.get(p).is_some_and(Node::is_folder));
            if attached {
                continue;
            }
            if policy == OrphanPolicy::Error {
                exn::bail!(ErrorKind::Orphaned(id.to_string()));
            }
            if let Some(node) = map.get_mut(id) {
                tracing::warn!(id = %id, name = node.name, parent = ?node.parent, "Attaching orphaned record to root");
                malformed.push(MalformedRecord::new(Some(id.clone()), node.name.clone(), Problem::Orphaned));
                node.parent = Some(root.clone());
            }
        }

        let mut settled: HashSet<NodeId> = HashSet::new();
        for id in &ids {
            let mut path: Vec<NodeId> = Vec::new();
            let mut on_path: HashSet<NodeId> = HashSet::new();
            let mut current = id.clone();
            while current != root && !settled.contains(&current) {
                if on_path.contains(&current) {
                    let start = path.iter().position(|p| p == &current).unwrap_or_default();
                    let Some(breaker) = path[start..].iter().min().cloned() else {
                        break;
                    };
                    if policy == OrphanPolicy::Error {
                        exn::bail!(ErrorKind::Cycle(breaker.to_string()));
                    }
                    if let Some(node) = map.get_mut(&breaker) {
                        tracing::warn!(id = %breaker, name = node.name, "Breaking parent cycle by attaching record to root");
                        malformed.push(MalformedRecord::new(Some(breaker.clone()), node.name.clone(), Problem::Cycle));
                        node.parent = Some(root.clone());
                    }
                    break;
                }
                on_path.insert(current.clone());
                path.push(current.clone());
                match map.get(&current).and_then(|n| n.parent.clone()) {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
            settled.extend(path);
        }

        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in map.values() {
            if let Some(parent) = &node.parent {
                children.entry(parent.clone()).or_default().push(node.id.clone());
            }
        }
        let mut losers = Vec::new();
        for kids in children.values_mut() {
            kids.sort_by(|a, b| map[a].name.cmp(&map[b].name).then_with(|| a.cmp(b)));
            let mut kept: Vec<NodeId> = Vec::with_capacity(kids.len());
            for kid in kids.drain(..) {
                match kept.last() {
                    Some(previous) if map[previous].name == map[&kid].name => losers.push(kid),
                    _ => kept.push(kid),
                }
            }
            *kids = kept;
        }
        let mut incomplete = BTreeSet::new();
        losers.sort();
        for loser in losers {
            if let Some(node) = map.get(&loser) {
                tracing::warn!(id = %loser, name = node.name, "Dropping record whose name is taken by a sibling");
                malformed.push(MalformedRecord::new(Some(loser.clone()), node.name.clone(), Problem::DuplicateName));
            }
            let mut stack = vec![loser.clone()];
            while let Some(id) = stack.pop() {
                map.remove(&id);
                stack.extend(children.remove(&id).unwrap_or_default());
            }
            incomplete.insert(loser);
        }

        map.insert(root.clone(), Node::root(root.clone()));
        let snapshot = Self {
            taken_at: UtcDateTime::now(),
            root,
            nodes: map,
            children,
            incomplete,
        };
        Ok(Assembled { snapshot, malformed })
    }

    /// Mark subtrees whose contents could not be fully read.
    pub fn with_incomplete(mut self, ids: impl IntoIterator<Item = NodeId>) -> Self {
        self.incomplete.extend(ids);
        self
    }

    pub fn taken_at(&self) -> UtcDateTime {
        self.taken_at
    }

    pub fn root(&self) -> &NodeId {
        &self.root
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes, not counting the root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every node except the root, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.id != self.root)
    }

    /// Direct children of `id`, ordered by name then id.
    pub fn children(&self, id: &NodeId) -> impl Iterator<Item = &Node> {
        self.children.get(id).into_iter().flatten().filter_map(|child| self.nodes.get(child))
    }

    /// Ancestors of `id`, nearest first, ending with the root.
    pub fn ancestors<'a>(&'a self, id: &NodeId) -> impl Iterator<Item = &'a NodeId> + 'a {
        let mut current = self.nodes.get(id).and_then(|n| n.parent.as_ref());
        std::iter::from_fn(move || {
            let id = current?;
            current = self.nodes.get(id).and_then(|n| n.parent.as_ref());
            Some(id)
        })
    }

    /// `id` followed by all of its descendants, parents before children.
    pub fn subtree(&self, id: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if !self.contains(id) {
            return out;
        }
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            stack.extend(self.children.get(&current).into_iter().flatten().rev().cloned());
            out.push(current);
        }
        out
    }

    /// Slash-separated names from the root down to `id` (empty for the root).
    pub fn path_of(&self, id: &NodeId) -> Option<String> {
        let node = self.nodes.get(id)?;
        if node.parent.is_none() {
            return Some(String::new());
        }
        let mut names = vec![node.name.as_str()];
        for ancestor in self.ancestors(id) {
            match self.nodes.get(ancestor) {
                Some(n) if n.parent.is_some() => names.push(n.name.as_str()),
                _ => {},
            }
        }
        names.reverse();
        Some(names.join("/"))
    }

    pub fn incomplete(&self) -> &BTreeSet<NodeId> {
        &self.incomplete
    }
}
