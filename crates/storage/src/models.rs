//! Node models shared by every side of a sync.
//!
//! A [`Node`] is one file or folder. Remote nodes carry opaque identifiers
//! handed out by the API; local nodes use their path relative to the sync
//! root, with [`NodeId::local_root`] (`.`) standing for the root itself.

use serde::{Deserialize, Serialize};
use std::fmt;

const LOCAL_ROOT: &str = ".";

/// Opaque unique identifier of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);
impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier of the root of a path-addressed tree.
    pub fn local_root() -> Self {
        Self(LOCAL_ROOT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local_root(&self) -> bool {
        self.0 == LOCAL_ROOT
    }

    /// Path-addressed identifier of the child called `name`.
    ///
    /// ```
    /// use drivesync_storage::NodeId;
    /// assert_eq!(NodeId::local_root().child("a").as_str(), "a");
    /// assert_eq!(NodeId::new("a/b").child("c").as_str(), "a/b/c");
    /// ```
    pub fn child(&self, name: &str) -> Self {
        match self.is_local_root() {
            true => Self(name.to_string()),
            false => Self(format!("{}/{}", self.0, name)),
        }
    }

    /// Path-addressed identifier of the containing folder, `None` for the root.
    ///
    /// ```
    /// use drivesync_storage::NodeId;
    /// assert_eq!(NodeId::new("a/b").parent_path(), Some(NodeId::new("a")));
    /// assert_eq!(NodeId::new("a").parent_path(), Some(NodeId::local_root()));
    /// assert_eq!(NodeId::local_root().parent_path(), None);
    /// ```
    pub fn parent_path(&self) -> Option<Self> {
        if self.is_local_root() {
            return None;
        }
        Some(match self.0.rsplit_once('/') {
            Some((parent, _)) => Self(parent.to_string()),
            None => Self::local_root(),
        })
    }
}
impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// Cheap change detector for file content.
///
/// Fingerprints are only ever compared with fingerprints produced by the same
/// side; a local [`Stat`](Self::Stat) is never compared to a remote checksum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Fingerprint {
    /// Content hash (BLAKE3 locally, whatever checksum the remote reports).
    Content { hash: String },
    /// File size plus modification time in unix nanoseconds.
    Stat { size: u64, modified: i64 },
}
impl Fingerprint {
    pub fn of_content(data: &[u8]) -> Self {
        Self::Content { hash: blake3::hash(data).to_hex().to_string() }
    }
}

/// How the local side computes [`Fingerprint`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    /// Size + mtime; no file reads.
    #[default]
    Stat,
    /// BLAKE3 of the file content, for filesystems with unreliable mtimes.
    Content,
}

/// One file or folder in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    /// `None` only for the root.
    pub parent: Option<NodeId>,
    /// Always `None` for folders.
    pub fingerprint: Option<Fingerprint>,
}
impl Node {
    pub fn root(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            kind: NodeKind::Folder,
            parent: None,
            fingerprint: None,
        }
    }

    pub fn folder(id: impl Into<NodeId>, name: impl Into<String>, parent: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::Folder,
            parent: Some(parent.into()),
            fingerprint: None,
        }
    }

    pub fn file(
        id: impl Into<NodeId>,
        name: impl Into<String>,
        parent: impl Into<NodeId>,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::File,
            parent: Some(parent.into()),
            fingerprint: Some(fingerprint),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// A flat record as returned by a remote listing.
///
/// Records are untrusted: the identifier may be missing, and a record may list
/// zero or several parents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: Option<NodeId>,
    pub name: String,
    pub kind: NodeKind,
    pub parents: Vec<NodeId>,
    pub fingerprint: Option<Fingerprint>,
}
impl Record {
    pub fn from_node(node: Node) -> Self {
        Self {
            id: Some(node.id),
            name: node.name,
            kind: node.kind,
            parents: node.parent.into_iter().collect(),
            fingerprint: node.fingerprint,
        }
    }
}

/// Continuation token for paged listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(pub String);

/// One page of a remote listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    /// `None` on the last page.
    pub next_cursor: Option<PageCursor>,
}

/// Bearer/session handle issued by a credential provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
}
impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("token", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_serialization() {
        let stat = Fingerprint::Stat { size: 3, modified: 1_700_000_000_000_000_000 };
        let json = serde_json::to_string(&stat).unwrap();
        assert_eq!(json, r#"{"type":"stat","size":3,"modified":1700000000000000000}"#);
        assert_eq!(serde_json::from_str::<Fingerprint>(&json).unwrap(), stat);
    }

    #[test]
    fn test_content_fingerprint_is_stable() {
        assert_eq!(Fingerprint::of_content(b"abc"), Fingerprint::of_content(b"abc"));
        assert_ne!(Fingerprint::of_content(b"abc"), Fingerprint::of_content(b"abd"));
    }

    #[test]
    fn test_session_debug_is_redacted() {
        let session = Session::new("secret-token");
        assert!(!format!("{session:?}").contains("secret-token"));
    }
}
