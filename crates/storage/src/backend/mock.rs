//! In-memory remote API for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::backend::Addressing;
use crate::error::{ErrorKind, Result};
use crate::models::{Fingerprint, NodeId, NodeKind, Page, PageCursor, Record, Session};
use crate::remote::RemoteApi;
use crate::validate_name;

const ROOT: &str = "root";

/// Remote operations that faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    List,
    Create,
    Delete,
    Rename,
    Move,
    Write,
    Read,
}

struct Fault {
    op: MockOp,
    matching: Option<String>,
    remaining: Option<usize>,
    kind: fn() -> ErrorKind,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    kind: NodeKind,
    parent: NodeId,
    content: Vec<u8>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<NodeId, Entry>,
    /// Raw records appended verbatim to every flat listing.
    extra: Vec<Record>,
    next_id: u64,
}
impl State {
    fn allocate(&mut self) -> NodeId {
        self.next_id += 1;
        NodeId::new(format!("m{}", self.next_id))
    }

    fn record(&self, id: &NodeId) -> Option<Record> {
        if id.as_str() == ROOT {
            return None;
        }
        let entry = self.nodes.get(id)?;
        Some(Record {
            id: Some(id.clone()),
            name: entry.name.clone(),
            kind: entry.kind,
            parents: vec![entry.parent.clone()],
            fingerprint: match entry.kind {
                NodeKind::File => Some(Fingerprint::of_content(&entry.content)),
                NodeKind::Folder => None,
            },
        })
    }

    fn child_named(&self, parent: &NodeId, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|(_, e)| &e.parent == parent && e.name == name).map(|(id, _)| id.clone())
    }

    fn is_folder(&self, id: &NodeId) -> bool {
        id.as_str() == ROOT || self.nodes.get(id).is_some_and(|e| e.kind == NodeKind::Folder)
    }

    fn path_of(&self, id: &NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = id.clone();
        while current.as_str() != ROOT {
            let entry = self.nodes.get(&current)?;
            names.push(entry.name.clone());
            current = entry.parent.clone();
        }
        names.reverse();
        Some(names.join("/"))
    }

    fn id_at(&self, path: &str) -> Option<NodeId> {
        let mut current = NodeId::new(ROOT);
        for name in path.split('/').filter(|n| !n.is_empty()) {
            current = self.child_named(&current, name)?;
        }
        Some(current)
    }

    /// Returns `true` if `id` is `ancestor` or lies beneath it.
    fn is_beneath(&self, id: &NodeId, ancestor: &NodeId) -> bool {
        let mut current = id.clone();
        loop {
            if &current == ancestor {
                return true;
            }
            match self.nodes.get(&current) {
                Some(entry) => current = entry.parent.clone(),
                None => return false,
            }
        }
    }

    fn insert_path(&mut self, path: &str, kind: NodeKind, content: Vec<u8>) -> NodeId {
        let names: Vec<&str> = path.split('/').filter(|n| !n.is_empty()).collect();
        let mut parent = NodeId::new(ROOT);
        for (i, name) in names.iter().enumerate() {
            let last = i + 1 == names.len();
            if let Some(existing) = self.child_named(&parent, name) {
                if last && kind == NodeKind::File {
                    if let Some(entry) = self.nodes.get_mut(&existing) {
                        entry.content = content.clone();
                    }
                }
                parent = existing;
                continue;
            }
            let id = self.allocate();
            let entry = Entry {
                name: (*name).to_string(),
                kind: if last { kind } else { NodeKind::Folder },
                parent: parent.clone(),
                content: if last { content.clone() } else { Vec::new() },
            };
            self.nodes.insert(id.clone(), entry);
            parent = id;
        }
        parent
    }
}

/// In-memory remote drive for testing.
///
/// Nodes get opaque identifiers (`m1`, `m2`, ...) under the root folder
/// `root`; file fingerprints are BLAKE3 content hashes. Listings are flat and
/// paged. Faults can be injected per operation to exercise retry, renewal and
/// failure paths.
///
/// # Examples
///
/// ```
/// use drivesync_storage::backend::{MockOp, MockRemote};
/// use drivesync_storage::error::ErrorKind;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let remote = MockRemote::new()
///     .with_folder("Documents")
///     .with_file("Documents/report.odt", b"...");
/// remote.inject(MockOp::Write, Some("report.odt"), Some(1), || ErrorKind::Network("reset".into()));
/// assert_eq!(remote.content_at("Documents/report.odt").await, Some(b"...".to_vec()));
/// # }
/// ```
pub struct MockRemote {
    name: String,
    root: NodeId,
    page_size: usize,
    latency: Duration,
    state: RwLock<State>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<MockOp, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            root: NodeId::new(ROOT),
            page_size: 100,
            latency: Duration::ZERO,
            state: RwLock::new(State::default()),
            faults: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delay every call by `latency`, so that concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add a folder (and any missing ancestors) at `path`.
    pub fn with_folder(mut self, path: &str) -> Self {
        self.state.get_mut().insert_path(path, NodeKind::Folder, Vec::new());
        self
    }

    /// Add a file (and any missing ancestor folders) at `path`.
    pub fn with_file(mut self, path: &str, content: &[u8]) -> Self {
        self.state.get_mut().insert_path(path, NodeKind::File, content.to_vec());
        self
    }

    /// Append raw records to every flat listing, e.g. malformed ones.
    pub fn with_records(mut self, records: impl IntoIterator<Item = Record>) -> Self {
        self.state.get_mut().extra.extend(records);
        self
    }

    /// Fail the next `times` calls (every call for `None`) of `op` with the
    /// error produced by `kind`.
    ///
    /// `matching` restricts the fault to calls touching a node with that
    /// identifier or name (for [`MockOp::List`], the listed parent).
    pub fn inject(&self, op: MockOp, matching: Option<&str>, times: Option<usize>, kind: fn() -> ErrorKind) {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).push(Fault {
            op,
            matching: matching.map(str::to_string),
            remaining: times,
            kind,
        });
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of calls made for `op`, failed ones included.
    pub fn calls(&self, op: MockOp) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).get(&op).copied().unwrap_or(0)
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every node as a slash-separated path, mapped to its content (`None`
    /// for folders).
    pub async fn tree(&self) -> BTreeMap<String, Option<Vec<u8>>> {
        let state = self.state.read().await;
        state
            .nodes
            .iter()
            .filter_map(|(id, entry)| {
                let content = match entry.kind {
                    NodeKind::File => Some(entry.content.clone()),
                    NodeKind::Folder => None,
                };
                state.path_of(id).map(|path| (path, content))
            })
            .collect()
    }

    pub async fn id_of(&self, path: &str) -> Option<NodeId> {
        self.state.read().await.id_at(path)
    }

    pub async fn content_at(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.read().await;
        let id = state.id_at(path)?;
        state.nodes.get(&id).filter(|e| e.kind == NodeKind::File).map(|e| e.content.clone())
    }

    /// Replace the content of the file at `path`, as another client would.
    pub async fn set_content(&self, path: &str, content: &[u8]) -> bool {
        let mut state = self.state.write().await;
        let Some(id) = state.id_at(path) else {
            return false;
        };
        match state.nodes.get_mut(&id) {
            Some(entry) if entry.kind == NodeKind::File => {
                entry.content = content.to_vec();
                true
            },
            _ => false,
        }
    }

    /// Add a node at `path` as another client would, returning its identifier.
    pub async fn add(&self, path: &str, kind: NodeKind, content: &[u8]) -> NodeId {
        self.state.write().await.insert_path(path, kind, content.to_vec())
    }

    /// Remove the node at `path` and everything beneath it.
    pub async fn remove(&self, path: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(target) = state.id_at(path) else {
            return false;
        };
        let doomed: Vec<NodeId> = state.nodes.keys().filter(|id| state.is_beneath(id, &target)).cloned().collect();
        for id in doomed {
            state.nodes.remove(&id);
        }
        true
    }

    async fn enter(&self, op: MockOp, keys: &[&str]) -> Result<()> {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner).entry(op).or_default() += 1;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let hit = faults.iter_mut().position(|fault| {
            fault.op == op
                && fault.remaining != Some(0)
                && fault.matching.as_deref().is_none_or(|m| keys.contains(&m))
        });
        if let Some(index) = hit {
            let fault = &mut faults[index];
            if let Some(remaining) = fault.remaining.as_mut() {
                *remaining -= 1;
            }
            exn::bail!((fault.kind)());
        }
        Ok(())
    }

    fn missing(id: &NodeId) -> exn::Exn<ErrorKind> {
        exn::Exn::from(ErrorKind::NotFound(id.to_string()))
    }
}
impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &NodeId {
        &self.root
    }

    fn addressing(&self) -> Addressing {
        Addressing::Opaque
    }

    async fn list_children(
        &self,
        _session: &Session,
        parent: Option<&NodeId>,
        cursor: Option<&PageCursor>,
    ) -> Result<Page> {
        self.enter(MockOp::List, &[parent.map(NodeId::as_str).unwrap_or_default()]).await?;
        let offset = match cursor {
            Some(PageCursor(c)) => c
                .parse::<usize>()
                .map_err(|_| exn::Exn::from(ErrorKind::BackendError(format!("invalid page cursor `{c}`"))))?,
            None => 0,
        };
        let state = self.state.read().await;
        let mut ids: Vec<&NodeId> = state.nodes.keys().collect();
        ids.sort();
        let mut records: Vec<Record> = ids
            .into_iter()
            .filter_map(|id| state.record(id))
            .filter(|record| parent.is_none_or(|p| record.parents.first() == Some(p)))
            .collect();
        if parent.is_none() {
            records.extend(state.extra.iter().cloned());
        }
        let total = records.len();
        let end = offset.saturating_add(self.page_size).min(total);
        let page = records.drain(offset.min(end)..end).collect();
        Ok(Page {
            records: page,
            next_cursor: (end < total).then(|| PageCursor(end.to_string())),
        })
    }

    async fn create_node(&self, _session: &Session, parent: &NodeId, name: &str, kind: NodeKind) -> Result<Record> {
        self.enter(MockOp::Create, &[parent.as_str(), name]).await?;
        let name = validate_name(name)?;
        let mut state = self.state.write().await;
        if !state.is_folder(parent) {
            return Err(Self::missing(parent));
        }
        if state.child_named(parent, name).is_some() {
            exn::bail!(ErrorKind::AlreadyExists(name.to_string()));
        }
        let id = state.allocate();
        state.nodes.insert(id.clone(), Entry {
            name: name.to_string(),
            kind,
            parent: parent.clone(),
            content: Vec::new(),
        });
        state.record(&id).ok_or_else(|| Self::missing(&id))
    }

    async fn delete_node(&self, _session: &Session, id: &NodeId) -> Result<()> {
        let name = self.state.read().await.nodes.get(id).map(|e| e.name.clone()).unwrap_or_default();
        self.enter(MockOp::Delete, &[id.as_str(), &name]).await?;
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(id) {
            return Err(Self::missing(id));
        }
        if state.nodes.values().any(|e| &e.parent == id) {
            exn::bail!(ErrorKind::NotEmpty(id.to_string()));
        }
        state.nodes.remove(id);
        Ok(())
    }

    async fn rename_node(&self, _session: &Session, id: &NodeId, name: &str) -> Result<Record> {
        let old = self.state.read().await.nodes.get(id).map(|e| e.name.clone()).unwrap_or_default();
        self.enter(MockOp::Rename, &[id.as_str(), &old]).await?;
        let name = validate_name(name)?;
        let mut state = self.state.write().await;
        let parent = state.nodes.get(id).map(|e| e.parent.clone()).ok_or_else(|| Self::missing(id))?;
        if state.child_named(&parent, name).is_some_and(|other| &other != id) {
            exn::bail!(ErrorKind::AlreadyExists(name.to_string()));
        }
        if let Some(entry) = state.nodes.get_mut(id) {
            entry.name = name.to_string();
        }
        state.record(id).ok_or_else(|| Self::missing(id))
    }

    async fn move_node(&self, _session: &Session, id: &NodeId, parent: &NodeId) -> Result<Record> {
        let name = self.state.read().await.nodes.get(id).map(|e| e.name.clone()).unwrap_or_default();
        self.enter(MockOp::Move, &[id.as_str(), &name]).await?;
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(id) {
            return Err(Self::missing(id));
        }
        if !state.is_folder(parent) {
            return Err(Self::missing(parent));
        }
        if state.is_beneath(parent, id) {
            exn::bail!(ErrorKind::InvalidId(format!("cannot move {id} beneath itself")));
        }
        if state.child_named(parent, &name).is_some_and(|other| &other != id) {
            exn::bail!(ErrorKind::AlreadyExists(name));
        }
        if let Some(entry) = state.nodes.get_mut(id) {
            entry.parent = parent.clone();
        }
        state.record(id).ok_or_else(|| Self::missing(id))
    }

    async fn write_content(&self, _session: &Session, id: &NodeId, data: &[u8]) -> Result<Record> {
        let name = self.state.read().await.nodes.get(id).map(|e| e.name.clone()).unwrap_or_default();
        self.enter(MockOp::Write, &[id.as_str(), &name]).await?;
        let mut state = self.state.write().await;
        match state.nodes.get_mut(id) {
            Some(entry) if entry.kind == NodeKind::File => entry.content = data.to_vec(),
            Some(_) => exn::bail!(ErrorKind::InvalidId(format!("{id} is a folder"))),
            None => return Err(Self::missing(id)),
        }
        state.record(id).ok_or_else(|| Self::missing(id))
    }

    async fn read_content(&self, _session: &Session, id: &NodeId) -> Result<Vec<u8>> {
        let name = self.state.read().await.nodes.get(id).map(|e| e.name.clone()).unwrap_or_default();
        self.enter(MockOp::Read, &[id.as_str(), &name]).await?;
        let state = self.state.read().await;
        match state.nodes.get(id) {
            Some(entry) if entry.kind == NodeKind::File => Ok(entry.content.clone()),
            Some(_) => exn::bail!(ErrorKind::InvalidId(format!("{id} is a folder"))),
            None => Err(Self::missing(id)),
        }
    }
}
