//! Sync target trait and implementations.
//!
//! A [`SyncTarget`] is the capability set the reconciler needs to replay a
//! change on one side of a sync: create, delete, rename, move, and read or
//! write file content. The local filesystem implements it directly
//! ([`LocalBackend`]); the remote side is adapted from a
//! [`RemoteApi`](crate::RemoteApi) by [`RemoteTarget`].

mod local;
#[cfg(feature = "mock")]
mod mock;
mod remote;
mod ro;

pub use self::local::{LocalBackend, WalkEvent, WalkStream};
#[cfg(feature = "mock")]
pub use self::mock::{MockOp, MockRemote};
pub use self::remote::RemoteTarget;
pub use self::ro::ReadOnlyBackend;
use crate::error::Result;
use crate::models::{Fingerprint, NodeId, NodeKind};
use async_trait::async_trait;

/// How a target's identifiers react to renames and moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Identifiers are assigned once and survive renames and moves.
    Opaque,
    /// Identifiers are relative paths; renaming or moving a folder changes the
    /// identifier of the folder and of everything beneath it.
    Path,
}

/// What a target reports back after a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Identifier of the node after the operation.
    pub id: NodeId,
    /// Fingerprint of the node after the operation (files only).
    pub fingerprint: Option<Fingerprint>,
}

/// Unified interface for the targets of a sync.
///
/// All operations address nodes by the identifiers the target itself uses
/// (see [`Addressing`]). Implementations must not create missing parents:
/// the reconciler orders operations so that parents always exist first.
///
/// # Examples
///
/// ```no_run
/// use drivesync_storage::{NodeId, NodeKind, SyncTarget, error::Result};
///
/// async fn upload(target: &dyn SyncTarget, parent: &NodeId, data: &[u8]) -> Result<NodeId> {
///     let created = target.create(parent, "notes.txt", NodeKind::File).await?;
///     let written = target.write(&created.id, data).await?;
///     Ok(written.id)
/// }
/// ```
#[async_trait]
pub trait SyncTarget: Send + Sync {
    /// Name of the target (logging only).
    fn name(&self) -> &str;

    fn addressing(&self) -> Addressing;

    /// Create an empty file or folder called `name` inside `parent`.
    ///
    /// Returns [`AlreadyExists`](crate::error::ErrorKind::AlreadyExists) if
    /// `parent` already has a child with that name.
    async fn create(&self, parent: &NodeId, name: &str, kind: NodeKind) -> Result<Receipt>;

    /// Delete a file or an empty folder.
    ///
    /// Returns [`NotEmpty`](crate::error::ErrorKind::NotEmpty) for a folder
    /// that still has children; descendants are deleted by earlier operations.
    async fn delete(&self, id: &NodeId) -> Result<()>;

    /// Rename a node in place.
    async fn rename(&self, id: &NodeId, name: &str) -> Result<Receipt>;

    /// Move a node into another folder, keeping its name.
    async fn relocate(&self, id: &NodeId, parent: &NodeId) -> Result<Receipt>;

    /// Read the full content of a file.
    async fn read(&self, id: &NodeId) -> Result<Vec<u8>>;

    /// Replace the full content of a file.
    async fn write(&self, id: &NodeId, data: &[u8]) -> Result<Receipt>;
}
