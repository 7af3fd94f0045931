//! The last reconciled state, and its persistence.
//!
//! A baseline is a flat list of entries keyed by remote id. Once a node is
//! reconciled its name and parent are equal on both sides, so the same list
//! yields both per-side views: the remote view keeps the remote ids, the
//! local view rebuilds relative paths from the chain of names.

use crate::error::{ErrorKind, Result};
use crate::tree::{OrphanPolicy, Snapshot};
use drivesync_storage::{Fingerprint, Node, NodeId, NodeKind};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tracing::instrument;

/// Version of the on-disk baseline format.
pub const FORMAT_VERSION: u32 = 1;

/// One reconciled node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineEntry {
    /// Remote identifier.
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    /// Remote identifier of the parent folder.
    pub parent: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_fingerprint: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_fingerprint: Option<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    version: u32,
    remote_root: NodeId,
    /// Unix timestamp (seconds) of the cycle that produced this baseline.
    synced_at: i64,
    entries: Vec<BaselineEntry>,
}

/// Both per-side views of a [`Baseline`], plus the id mapping between them.
#[derive(Debug, Clone)]
pub struct BaselineViews {
    pub remote: Snapshot,
    pub local: Snapshot,
    /// Remote id to local path id.
    pub to_local: HashMap<NodeId, NodeId>,
    /// Local path id to remote id.
    pub to_remote: HashMap<NodeId, NodeId>,
}

impl Baseline {
    /// State before the first sync: nothing is known to be shared.
    pub fn empty(remote_root: NodeId) -> Self {
        Self {
            version: FORMAT_VERSION,
            remote_root,
            synced_at: 0,
            entries: Vec::new(),
        }
    }

    pub fn new(remote_root: NodeId, entries: Vec<BaselineEntry>) -> Self {
        Self {
            version: FORMAT_VERSION,
            remote_root,
            synced_at: UtcDateTime::now().unix_timestamp(),
            entries,
        }
    }

    pub fn remote_root(&self) -> &NodeId {
        &self.remote_root
    }

    pub fn entries(&self) -> &[BaselineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remote view: the entries as a tree of remote ids.
    pub fn remote_view(&self) -> Snapshot {
        let nodes = self.entries.iter().map(|entry| Node {
            id: entry.id.clone(),
            name: entry.name.clone(),
            kind: entry.kind,
            parent: Some(entry.parent.clone()),
            fingerprint: entry.remote_fingerprint.clone(),
        });
        match Snapshot::assemble(self.remote_root.clone(), nodes, OrphanPolicy::AttachToRoot) {
            Ok(assembled) => assembled.snapshot,
            // Unreachable with AttachToRoot.
            Err(_) => Snapshot::empty(self.remote_root.clone()),
        }
    }

    /// Both views at once; local ids are the paths of the remote view.
    pub fn views(&self) -> BaselineViews {
        let remote = self.remote_view();
        let mut to_local: HashMap<NodeId, NodeId> = HashMap::with_capacity(self.entries.len());
        to_local.insert(self.remote_root.clone(), NodeId::local_root());
        for entry in &self.entries {
            if let Some(path) = remote.path_of(&entry.id).filter(|p| !p.is_empty()) {
                to_local.insert(entry.id.clone(), NodeId::new(path));
            }
        }
        let local_fingerprints: HashMap<&NodeId, &Option<Fingerprint>> =
            self.entries.iter().map(|e| (&e.id, &e.local_fingerprint)).collect();
        let nodes: Vec<Node> = remote
            .nodes()
            .filter_map(|node| {
                let id = to_local.get(&node.id)?.clone();
                let parent = to_local.get(node.parent.as_ref()?)?.clone();
                Some(Node {
                    id,
                    name: node.name.clone(),
                    kind: node.kind,
                    parent: Some(parent),
                    fingerprint: local_fingerprints.get(&node.id).and_then(|fp| (*fp).clone()),
                })
            })
            .collect();
        let local = match Snapshot::assemble(NodeId::local_root(), nodes, OrphanPolicy::AttachToRoot) {
            Ok(assembled) => assembled.snapshot,
            Err(_) => Snapshot::empty(NodeId::local_root()),
        };
        let to_remote = to_local.iter().map(|(remote, local)| (local.clone(), remote.clone())).collect();
        BaselineViews {
            remote,
            local,
            to_local,
            to_remote,
        }
    }
}

/// Reads and atomically replaces the baseline file.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    path: PathBuf,
}

impl BaselineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the baseline for the drive rooted at `remote_root`.
    ///
    /// A missing file, or a baseline recorded against a different remote root,
    /// yields an empty baseline. An unreadable or unparseable file is an
    /// error: syncing without the baseline would misread every difference.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn load(&self, remote_root: &NodeId) -> Result<Baseline> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No baseline found; starting from an empty one");
                return Ok(Baseline::empty(remote_root.clone()));
            },
            Err(e) => return Err(e).or_raise(|| ErrorKind::Baseline(self.path.clone())),
        };
        let baseline: Baseline =
            serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Baseline(self.path.clone()))?;
        if baseline.version != FORMAT_VERSION {
            tracing::error!(version = baseline.version, expected = FORMAT_VERSION, "Unsupported baseline version");
            exn::bail!(ErrorKind::Baseline(self.path.clone()));
        }
        if &baseline.remote_root != remote_root {
            tracing::warn!(
                recorded = %baseline.remote_root,
                current = %remote_root,
                "Baseline belongs to a different remote root; starting from an empty one"
            );
            return Ok(Baseline::empty(remote_root.clone()));
        }
        tracing::debug!(entries = baseline.len(), "Baseline loaded");
        Ok(baseline)
    }

    /// Replaces the baseline file atomically (temporary file in the same
    /// directory, then rename).
    #[instrument(skip_all, fields(path = %self.path.display(), entries = baseline.len()))]
    pub async fn save(&self, baseline: &Baseline) -> Result<()> {
        let data = serde_json::to_vec_pretty(baseline).or_raise(|| ErrorKind::Baseline(self.path.clone()))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &data))
            .await
            .or_raise(|| ErrorKind::Baseline(self.path.clone()))?
            .or_raise(|| ErrorKind::Baseline(self.path.clone()))
    }
}

fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
