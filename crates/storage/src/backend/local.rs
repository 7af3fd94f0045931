//! Local filesystem sync target.
//!
//! Nodes are addressed by their path relative to the configured root
//! directory, accessed via `tokio::fs` for async I/O. The same backend can
//! also stand in for the remote side (a "mirror" directory such as a mounted
//! share) through its [`RemoteApi`] implementation.

use crate::backend::{Addressing, Receipt, SyncTarget};
use crate::error::{Error, ErrorKind, Result};
use crate::models::{Fingerprint, FingerprintMode, Node, NodeId, NodeKind, Page, PageCursor, Record, Session};
use crate::path::{validate as validate_path, validate_name};
use crate::remote::RemoteApi;
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use futures::{Stream, StreamExt};
use std::collections::HashSet;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs::{self, DirEntry};
use tokio::sync::Mutex;

/// Suffix of the temporary files used for atomic content replacement.
const PARTIAL_SUFFIX: &str = ".drivesync-partial";
const DEFAULT_PAGE_SIZE: usize = 100;

pub type WalkStream<'a> = Pin<Box<dyn Stream<Item = WalkEvent> + Send + 'a>>;

/// Items yielded by [`LocalBackend::walk`].
///
/// Problems are yielded as data rather than errors: a walk never stops early
/// because one subtree could not be read.
#[derive(Debug)]
pub enum WalkEvent {
    Found(Node),
    /// The entry (or the contents of the folder) `id` could not be read.
    Unreadable { id: NodeId, error: Error },
    /// `id` is a directory that was already visited through another path,
    /// most likely a symlink loop. It is not descended into.
    CycleDetected { id: NodeId },
}

enum WalkEntry {
    File(Node),
    Descend(Node, PathBuf),
    Cycle(NodeId),
    Unreadable(NodeId, Error),
    Skip,
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum DirIdentity {
    #[cfg(unix)]
    Inode(u64, u64),
    #[cfg(not(unix))]
    Canonical(PathBuf),
}

#[cfg(unix)]
fn identity(_path: &Path, metadata: &Metadata) -> DirIdentity {
    use std::os::unix::fs::MetadataExt;
    DirIdentity::Inode(metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn identity(path: &Path, _metadata: &Metadata) -> DirIdentity {
    DirIdentity::Canonical(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
}

/// Local filesystem sync target.
///
/// # Examples
///
/// ```no_run
/// use drivesync_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/home/me/DriveSync")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory of the synced tree
    root: PathBuf,
    root_id: NodeId,
    fingerprint: FingerprintMode,
    page_size: usize,
    /// Walk taken for the first page of a mirror listing; later pages resume
    /// after the last id returned.
    listing: Arc<Mutex<Option<Listing>>>,
}

#[derive(Debug)]
struct Listing {
    parent: Option<NodeId>,
    nodes: Vec<Node>,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists but is not a
    /// directory. A missing root directory is created.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Use non-async here; it'll only happen once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &NodeId::local_root()))?;
        }
        Ok(Self {
            name: name.into(),
            root,
            root_id: NodeId::local_root(),
            fingerprint: FingerprintMode::default(),
            page_size: DEFAULT_PAGE_SIZE,
            listing: Arc::default(),
        })
    }

    pub fn with_fingerprint(mut self, mode: FingerprintMode) -> Self {
        self.fingerprint = mode;
        self
    }

    /// Number of records per page when listed as a [`RemoteApi`].
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the absolute path for a node identifier.
    fn absolute_path(&self, id: &NodeId) -> Result<PathBuf> {
        if id.is_local_root() {
            return Ok(self.root.clone());
        }
        Ok(self.root.join(validate_path(id.as_str())?))
    }

    fn map_io_error(e: std::io::Error, id: &NodeId) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(id.to_string()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(id.to_string()),
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists(id.to_string()),
            std::io::ErrorKind::DirectoryNotEmpty => ErrorKind::NotEmpty(id.to_string()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn fingerprint(&self, path: &Path, metadata: &Metadata) -> Result<Fingerprint> {
        match self.fingerprint {
            FingerprintMode::Stat => {
                let modified = OffsetDateTime::from(metadata.modified().map_err(ErrorKind::Io)?);
                Ok(Fingerprint::Stat {
                    size: metadata.len(),
                    modified: i64::try_from(modified.unix_timestamp_nanos()).unwrap_or(i64::MAX),
                })
            },
            FingerprintMode::Content => {
                let path = path.to_path_buf();
                let hash = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
                    let mut hasher = blake3::Hasher::new();
                    hasher.update_reader(std::fs::File::open(&path)?)?;
                    Ok(hasher.finalize().to_hex().to_string())
                })
                .await
                .or_raise(|| ErrorKind::BackendError("content hashing task failed".to_string()))?
                .map_err(ErrorKind::Io)?;
                Ok(Fingerprint::Content { hash })
            },
        }
    }

    /// Describe the node currently stored under `id`.
    /// Every node below `parent` (or the whole tree), ordered by id.
    async fn sorted_children(&self, parent: Option<&NodeId>) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut walk = self.walk();
        while let Some(event) = walk.next().await {
            match event {
                WalkEvent::Found(node) => {
                    if parent.is_none_or(|p| node.parent.as_ref() == Some(p)) {
                        nodes.push(node);
                    }
                },
                // A mirror that cannot be read completely is unavailable.
                WalkEvent::Unreadable { error, .. } => return Err(error),
                WalkEvent::CycleDetected { id } => {
                    tracing::warn!(remote = self.name, id = %id, "Skipping symlink cycle in mirror directory");
                },
            }
        }
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    pub async fn node(&self, id: &NodeId) -> Result<Node> {
        let path = self.absolute_path(id)?;
        let metadata = fs::metadata(&path).await.map_err(|e| Self::map_io_error(e, id))?;
        let Some(parent) = id.parent_path() else {
            return Ok(Node::root(id.clone()));
        };
        let name = id.as_str().rsplit('/').next().unwrap_or_default().to_string();
        Ok(match metadata.is_dir() {
            true => Node::folder(id.clone(), name, parent),
            false => Node::file(id.clone(), name, parent, self.fingerprint(&path, &metadata).await?),
        })
    }

    async fn receipt(&self, id: NodeId) -> Result<Receipt> {
        let node = self.node(&id).await?;
        Ok(Receipt { id, fingerprint: node.fingerprint })
    }

    /// Walk the whole tree below the root, following symlinks.
    ///
    /// The root itself is not yielded. Folders are yielded before their
    /// contents. Directories are identified by device and inode, so a symlink
    /// pointing back up the tree is reported once as
    /// [`CycleDetected`](WalkEvent::CycleDetected) instead of being walked
    /// forever.
    pub fn walk(&self) -> WalkStream<'_> {
        Box::pin(stream! {
            let mut visited = HashSet::new();
            match fs::metadata(&self.root).await {
                Ok(metadata) => { visited.insert(identity(&self.root, &metadata)); },
                Err(err) => {
                    let root = NodeId::local_root();
                    yield WalkEvent::Unreadable { error: Self::map_io_error(err, &root).into(), id: root };
                    return;
                },
            }
            let mut stack = vec![(NodeId::local_root(), self.root.clone())];

            'dirs: while let Some((dir_id, dir_path)) = stack.pop() {
                let mut entries = match fs::read_dir(&dir_path).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        yield WalkEvent::Unreadable { error: Self::map_io_error(err, &dir_id).into(), id: dir_id };
                        continue 'dirs;
                    },
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(err) => {
                            yield WalkEvent::Unreadable { error: Self::map_io_error(err, &dir_id).into(), id: dir_id };
                            continue 'dirs;
                        },
                    };
                    match self.process_entry(&dir_id, entry, &mut visited).await {
                        WalkEntry::File(node) => yield WalkEvent::Found(node),
                        WalkEntry::Descend(node, path) => {
                            stack.push((node.id.clone(), path));
                            yield WalkEvent::Found(node);
                        },
                        WalkEntry::Cycle(id) => yield WalkEvent::CycleDetected { id },
                        WalkEntry::Unreadable(id, error) => yield WalkEvent::Unreadable { id, error },
                        WalkEntry::Skip => {},
                    }
                }
            }
        })
    }

    /// Keeps the walk loop free of error plumbing: every outcome of looking at
    /// one directory entry becomes a [`WalkEntry`].
    async fn process_entry(&self, parent: &NodeId, entry: DirEntry, visited: &mut HashSet<DirIdentity>) -> WalkEntry {
        let path = entry.path();
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            let id = parent.child(&file_name.to_string_lossy());
            return WalkEntry::Unreadable(id, ErrorKind::InvalidPath(path).into());
        };
        if name.ends_with(PARTIAL_SUFFIX) {
            return WalkEntry::Skip;
        }
        let id = parent.child(name);
        // Follows symlinks.
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            // Broken symlink.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return WalkEntry::Skip,
            Err(err) => return WalkEntry::Unreadable(id.clone(), Self::map_io_error(err, &id).into()),
        };
        if metadata.is_dir() {
            if !visited.insert(identity(&path, &metadata)) {
                return WalkEntry::Cycle(id);
            }
            return WalkEntry::Descend(Node::folder(id, name, parent.clone()), path);
        }
        if metadata.is_file() {
            return match self.fingerprint(&path, &metadata).await {
                Ok(fingerprint) => WalkEntry::File(Node::file(id, name, parent.clone(), fingerprint)),
                Err(error) => WalkEntry::Unreadable(id, error),
            };
        }
        // Sockets, FIFOs, devices.
        WalkEntry::Skip
    }

    /// Shared by rename and relocate: move `id` to the path-addressed `target`.
    async fn move_node_to(&self, id: &NodeId, target: NodeId) -> Result<Receipt> {
        if id.is_local_root() {
            exn::bail!(ErrorKind::InvalidId(id.to_string()));
        }
        if &target == id {
            return self.receipt(target).await;
        }
        let from = self.absolute_path(id)?;
        let to = self.absolute_path(&target)?;
        // `rename(2)` silently replaces files; a sync must never do that.
        if fs::try_exists(&to).await.map_err(|e| Self::map_io_error(e, &target))? {
            exn::bail!(ErrorKind::AlreadyExists(target.to_string()));
        }
        fs::rename(&from, &to).await.map_err(|e| Self::map_io_error(e, id))?;
        self.receipt(target).await
    }
}

#[async_trait]
impl SyncTarget for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn addressing(&self) -> Addressing {
        Addressing::Path
    }

    async fn create(&self, parent: &NodeId, name: &str, kind: NodeKind) -> Result<Receipt> {
        let id = parent.child(validate_name(name)?);
        let path = self.absolute_path(&id)?;
        match kind {
            NodeKind::Folder => fs::create_dir(&path).await.map_err(|e| Self::map_io_error(e, &id))?,
            NodeKind::File => {
                fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .await
                    .map_err(|e| Self::map_io_error(e, &id))?;
            },
        }
        self.receipt(id).await
    }

    async fn delete(&self, id: &NodeId) -> Result<()> {
        if id.is_local_root() {
            exn::bail!(ErrorKind::InvalidId(id.to_string()));
        }
        let path = self.absolute_path(id)?;
        // Do not follow symlinks: deleting a linked folder removes the link only.
        let metadata = fs::symlink_metadata(&path).await.map_err(|e| Self::map_io_error(e, id))?;
        match metadata.is_dir() {
            true => Ok(fs::remove_dir(&path).await.map_err(|e| Self::map_io_error(e, id))?),
            false => Ok(fs::remove_file(&path).await.map_err(|e| Self::map_io_error(e, id))?),
        }
    }

    async fn rename(&self, id: &NodeId, name: &str) -> Result<Receipt> {
        let parent = id.parent_path().ok_or_else(|| exn::Exn::from(ErrorKind::InvalidId(id.to_string())))?;
        let target = parent.child(validate_name(name)?);
        self.move_node_to(id, target).await
    }

    async fn relocate(&self, id: &NodeId, parent: &NodeId) -> Result<Receipt> {
        let name = id.as_str().rsplit('/').next().unwrap_or_default();
        let target = parent.child(validate_name(name)?);
        self.move_node_to(id, target).await
    }

    async fn read(&self, id: &NodeId) -> Result<Vec<u8>> {
        let path = self.absolute_path(id)?;
        Ok(fs::read(&path).await.map_err(|e| Self::map_io_error(e, id))?)
    }

    async fn write(&self, id: &NodeId, data: &[u8]) -> Result<Receipt> {
        let path = self.absolute_path(id)?;
        let file_name = path.file_name().ok_or_else(|| exn::Exn::from(ErrorKind::InvalidId(id.to_string())))?;
        // Write next to the target, then rename over it so readers never see
        // a half-written file.
        let mut partial_name = file_name.to_os_string();
        partial_name.push(PARTIAL_SUFFIX);
        let partial = path.with_file_name(partial_name);
        if let Err(err) = fs::write(&partial, data).await {
            return Err(Self::map_io_error(err, id).into());
        }
        if let Err(err) = fs::rename(&partial, &path).await {
            _ = fs::remove_file(&partial).await;
            return Err(Self::map_io_error(err, id).into());
        }
        self.receipt(id.clone()).await
    }
}

/// Mirror mode: the directory acts as the remote store.
#[async_trait]
impl RemoteApi for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &NodeId {
        &self.root_id
    }

    fn addressing(&self) -> Addressing {
        Addressing::Path
    }

    async fn list_children(
        &self,
        _session: &Session,
        parent: Option<&NodeId>,
        cursor: Option<&PageCursor>,
    ) -> Result<Page> {
        let after = cursor.map(|PageCursor(last)| NodeId::new(last.as_str()));
        let mut listing = self.listing.lock().await;
        let nodes = match listing.take() {
            Some(cached) if after.is_some() && cached.parent.as_ref() == parent => cached.nodes,
            _ => self.sorted_children(parent).await?,
        };
        let start = after.map_or(0, |after| nodes.partition_point(|node| node.id <= after));
        let end = start.saturating_add(self.page_size).min(nodes.len());
        let records = nodes[start..end].iter().cloned().map(Record::from_node).collect();
        let next_cursor = (end < nodes.len()).then(|| PageCursor(nodes[end - 1].id.as_str().to_string()));
        if next_cursor.is_some() {
            *listing = Some(Listing {
                parent: parent.cloned(),
                nodes,
            });
        }
        Ok(Page { records, next_cursor })
    }

    async fn create_node(&self, _session: &Session, parent: &NodeId, name: &str, kind: NodeKind) -> Result<Record> {
        let receipt = self.create(parent, name, kind).await?;
        Ok(Record::from_node(self.node(&receipt.id).await?))
    }

    async fn delete_node(&self, _session: &Session, id: &NodeId) -> Result<()> {
        self.delete(id).await
    }

    async fn rename_node(&self, _session: &Session, id: &NodeId, name: &str) -> Result<Record> {
        let receipt = self.rename(id, name).await?;
        Ok(Record::from_node(self.node(&receipt.id).await?))
    }

    async fn move_node(&self, _session: &Session, id: &NodeId, parent: &NodeId) -> Result<Record> {
        let receipt = self.relocate(id, parent).await?;
        Ok(Record::from_node(self.node(&receipt.id).await?))
    }

    async fn write_content(&self, _session: &Session, id: &NodeId, data: &[u8]) -> Result<Record> {
        let receipt = self.write(id, data).await?;
        Ok(Record::from_node(self.node(&receipt.id).await?))
    }

    async fn read_content(&self, _session: &Session, id: &NodeId) -> Result<Vec<u8>> {
        self.read(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn backend(dir: &tempfile::TempDir) -> LocalBackend {
        LocalBackend::new("local", dir.path()).unwrap()
    }

    async fn walked_ids(backend: &LocalBackend) -> (BTreeSet<String>, Vec<String>, Vec<String>) {
        let mut found = BTreeSet::new();
        let mut unreadable = Vec::new();
        let mut cycles = Vec::new();
        let mut walk = backend.walk();
        while let Some(event) = walk.next().await {
            match event {
                WalkEvent::Found(node) => _ = found.insert(node.id.to_string()),
                WalkEvent::Unreadable { id, .. } => unreadable.push(id.to_string()),
                WalkEvent::CycleDetected { id } => cycles.push(id.to_string()),
            }
        }
        (found, unreadable, cycles)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("name", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("name", "relative/path").is_err());
        assert!(LocalBackend::new("name", "./relative").is_err());
    }

    #[test]
    fn test_new_creates_missing_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("DriveSync");
        LocalBackend::new("name", &root).unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        assert_eq!(backend.absolute_path(&NodeId::new("a/b.txt")).unwrap(), temp_dir.path().join("a/b.txt"));
        assert_eq!(backend.absolute_path(&NodeId::local_root()).unwrap(), temp_dir.path());
        assert!(backend.absolute_path(&NodeId::new("../etc/passwd")).is_err());
    }

    #[tokio::test]
    async fn test_create_write_and_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        let folder = backend.create(&NodeId::local_root(), "docs", NodeKind::Folder).await.unwrap();
        assert_eq!(folder.id, NodeId::new("docs"));
        assert_eq!(folder.fingerprint, None);
        let file = backend.create(&folder.id, "a.txt", NodeKind::File).await.unwrap();
        assert_eq!(file.id, NodeId::new("docs/a.txt"));
        let written = backend.write(&file.id, b"hello").await.unwrap();
        assert!(matches!(written.fingerprint, Some(Fingerprint::Stat { size: 5, .. })));
        assert_eq!(backend.read(&file.id).await.unwrap(), b"hello");
        // No partial file left behind
        assert_eq!(std::fs::read_dir(temp_dir.path().join("docs")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_create_does_not_overwrite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        backend.create(&NodeId::local_root(), "a.txt", NodeKind::File).await.unwrap();
        let err = backend.create(&NodeId::local_root(), "a.txt", NodeKind::File).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        let err = backend.create(&NodeId::new("missing"), "a.txt", NodeKind::File).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_names() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        assert!(backend.create(&NodeId::local_root(), "../escape", NodeKind::File).await.is_err());
        assert!(backend.create(&NodeId::local_root(), "a/b", NodeKind::Folder).await.is_err());
    }

    #[tokio::test]
    async fn test_content_fingerprint() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir).with_fingerprint(FingerprintMode::Content);
        let file = backend.create(&NodeId::local_root(), "a.txt", NodeKind::File).await.unwrap();
        let written = backend.write(&file.id, b"abc").await.unwrap();
        assert_eq!(written.fingerprint, Some(Fingerprint::of_content(b"abc")));
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        let folder = backend.create(&NodeId::local_root(), "docs", NodeKind::Folder).await.unwrap();
        let file = backend.create(&folder.id, "a.txt", NodeKind::File).await.unwrap();
        // Folder still has a child
        let err = backend.delete(&folder.id).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotEmpty(_)));
        backend.delete(&file.id).await.unwrap();
        backend.delete(&folder.id).await.unwrap();
        assert!(!temp_dir.path().join("docs").exists());
        let err = backend.delete(&file.id).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        assert!(backend.delete(&NodeId::local_root()).await.is_err());
    }

    #[tokio::test]
    async fn test_rename_and_relocate() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        let root = NodeId::local_root();
        let folder = backend.create(&root, "docs", NodeKind::Folder).await.unwrap();
        let file = backend.create(&root, "a.txt", NodeKind::File).await.unwrap();
        let renamed = backend.rename(&file.id, "b.txt").await.unwrap();
        assert_eq!(renamed.id, NodeId::new("b.txt"));
        let moved = backend.relocate(&renamed.id, &folder.id).await.unwrap();
        assert_eq!(moved.id, NodeId::new("docs/b.txt"));
        assert!(temp_dir.path().join("docs/b.txt").is_file());
        // Renaming a folder moves its contents along
        let renamed = backend.rename(&folder.id, "papers").await.unwrap();
        assert_eq!(renamed.id, NodeId::new("papers"));
        assert!(temp_dir.path().join("papers/b.txt").is_file());
    }

    #[tokio::test]
    async fn test_rename_never_overwrites() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = backend(&temp_dir);
        let root = NodeId::local_root();
        let a = backend.create(&root, "a.txt", NodeKind::File).await.unwrap();
        backend.create(&root, "b.txt", NodeKind::File).await.unwrap();
        let err = backend.rename(&a.id, "b.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_walk() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        std::fs::write(temp_dir.path().join("a/b/file.txt"), b"data").unwrap();
        std::fs::write(temp_dir.path().join("top.txt"), b"data").unwrap();
        std::fs::write(temp_dir.path().join(format!("top.txt{PARTIAL_SUFFIX}")), b"half").unwrap();
        let (found, unreadable, cycles) = walked_ids(&backend(&temp_dir)).await;
        let expected: BTreeSet<String> = ["a", "a/b", "a/b/file.txt", "top.txt"].map(String::from).into();
        assert_eq!(found, expected);
        assert!(unreadable.is_empty());
        assert!(cycles.is_empty());
    }

    #[tokio::test]
    async fn test_walk_empty_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (found, unreadable, _) = walked_ids(&backend(&temp_dir)).await;
        assert!(found.is_empty());
        assert!(unreadable.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_detects_symlink_cycles() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("a")).unwrap();
        std::fs::write(temp_dir.path().join("a/file.txt"), b"data").unwrap();
        std::os::unix::fs::symlink(temp_dir.path(), temp_dir.path().join("a/loop")).unwrap();
        let (found, unreadable, cycles) = walked_ids(&backend(&temp_dir)).await;
        let expected: BTreeSet<String> = ["a", "a/file.txt"].map(String::from).into();
        assert_eq!(found, expected);
        assert!(unreadable.is_empty());
        assert_eq!(cycles, vec!["a/loop".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_skips_broken_symlinks() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("nowhere"), temp_dir.path().join("dangling")).unwrap();
        let (found, unreadable, _) = walked_ids(&backend(&temp_dir)).await;
        assert!(found.is_empty());
        assert!(unreadable.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_walk_continues_past_unreadable_entry() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        let temp_dir = tempfile::tempdir().unwrap();
        let bad = temp_dir.path().join(OsStr::from_bytes(b"bad\xff"));
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("hidden.txt"), b"data").unwrap();
        std::fs::create_dir_all(temp_dir.path().join("docs")).unwrap();
        std::fs::write(temp_dir.path().join("docs/open.txt"), b"data").unwrap();
        let (found, unreadable, _) = walked_ids(&backend(&temp_dir)).await;
        let expected: BTreeSet<String> = ["docs", "docs/open.txt"].map(String::from).into();
        assert_eq!(found, expected);
        assert_eq!(unreadable, vec!["bad\u{FFFD}".to_string()]);
    }

    #[tokio::test]
    async fn test_list_children_pages() {
        let temp_dir = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt", "d.txt", "e.txt"] {
            std::fs::write(temp_dir.path().join(name), b"data").unwrap();
        }
        let backend = backend(&temp_dir).with_page_size(2);
        let session = Session::new("token");
        let mut cursor = None;
        let mut pages = Vec::new();
        loop {
            let page = backend.list_children(&session, None, cursor.as_ref()).await.unwrap();
            pages.push(page.records.iter().map(|r| r.name.clone()).collect::<Vec<_>>());
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(pages, vec![vec!["a.txt", "b.txt"], vec!["c.txt", "d.txt"], vec!["e.txt"]]);
    }

    #[tokio::test]
    async fn test_list_children_of_parent() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("a")).unwrap();
        std::fs::write(temp_dir.path().join("a/inner.txt"), b"data").unwrap();
        std::fs::write(temp_dir.path().join("outer.txt"), b"data").unwrap();
        let backend = backend(&temp_dir);
        let page = backend.list_children(&Session::new("t"), Some(&NodeId::new("a")), None).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, Some(NodeId::new("a/inner.txt")));
        assert_eq!(page.records[0].parents, vec![NodeId::new("a")]);
        assert!(page.next_cursor.is_none());
    }

    async fn list_all(backend: &LocalBackend, between_pages: impl Fn(usize)) -> Vec<String> {
        let session = Session::new("token");
        let mut cursor = None;
        let mut names = Vec::new();
        for page_number in 1.. {
            let page = backend.list_children(&session, None, cursor.as_ref()).await.unwrap();
            names.extend(page.records.iter().map(|r| r.name.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
            between_pages(page_number);
        }
        names
    }

    #[rstest::rstest]
    #[case::removed("a.txt", false)]
    #[case::added("bb.txt", true)]
    #[tokio::test]
    async fn test_list_children_is_stable_across_changes_between_pages(#[case] name: &str, #[case] add: bool) {
        let temp_dir = tempfile::tempdir().unwrap();
        for file in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            std::fs::write(temp_dir.path().join(file), b"data").unwrap();
        }
        let backend = backend(&temp_dir).with_page_size(2);
        let changed = temp_dir.path().join(name);
        let names = list_all(&backend, |page| {
            if page == 1 {
                match add {
                    true => std::fs::write(&changed, b"data").unwrap(),
                    false => std::fs::remove_file(&changed).unwrap(),
                }
            }
        })
        .await;
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt", "d.txt"]);
    }

    #[tokio::test]
    async fn test_list_children_resumes_after_cursor_id() {
        let temp_dir = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            std::fs::write(temp_dir.path().join(name), b"data").unwrap();
        }
        let backend = backend(&temp_dir).with_page_size(2);
        // No listing in progress: the tree is walked again and resumes after `b.txt`,
        // even though `b.txt` itself is gone.
        std::fs::remove_file(temp_dir.path().join("b.txt")).unwrap();
        let cursor = PageCursor("b.txt".to_string());
        let page = backend.list_children(&Session::new("t"), None, Some(&cursor)).await.unwrap();
        let names: Vec<_> = page.records.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["c.txt", "d.txt"]);
        assert!(page.next_cursor.is_none());
        // A finished listing starts over from a fresh walk.
        std::fs::write(temp_dir.path().join("e.txt"), b"data").unwrap();
        assert_eq!(list_all(&backend, |_| {}).await, vec!["a.txt", "c.txt", "d.txt", "e.txt"]);
    }
}
