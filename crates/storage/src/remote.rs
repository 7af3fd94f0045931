//! Contracts for the remote side: the API client and its credential provider.
//!
//! Neither transport nor authentication flows live in this workspace; a
//! client crate implements [`RemoteApi`] on top of whatever HTTP stack it
//! likes and hands the sync engine a [`RemoteHandle`].

use crate::backend::Addressing;
use crate::error::Result;
use crate::models::{NodeId, NodeKind, Page, PageCursor, Record, Session};
use async_trait::async_trait;
use std::sync::Arc;

pub type RemoteHandle = Arc<dyn RemoteApi + Send + Sync>;
pub type CredentialHandle = Arc<dyn CredentialProvider + Send + Sync>;

/// Remote hierarchical store (e.g. a cloud drive).
///
/// Every call takes the [`Session`] issued by the [`CredentialProvider`]. A
/// rejected session must be reported as
/// [`Unauthorized`](crate::error::ErrorKind::Unauthorized) so the caller can
/// renew it; transport-level retries and rate limiting are the implementer's
/// concern.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Name of the remote (logging only).
    fn name(&self) -> &str;

    /// Identifier of the remote root folder.
    fn root(&self) -> &NodeId;

    /// How identifiers behave when nodes are renamed or moved.
    fn addressing(&self) -> Addressing {
        Addressing::Opaque
    }

    /// List one page of records.
    ///
    /// With `parent = None` the listing is flat and covers the whole drive;
    /// otherwise only direct children of `parent` are returned. The page size
    /// is chosen by the implementation. `cursor` is the `next_cursor` of the
    /// previous page, `None` for the first page.
    async fn list_children(
        &self,
        session: &Session,
        parent: Option<&NodeId>,
        cursor: Option<&PageCursor>,
    ) -> Result<Page>;

    async fn create_node(&self, session: &Session, parent: &NodeId, name: &str, kind: NodeKind) -> Result<Record>;

    async fn delete_node(&self, session: &Session, id: &NodeId) -> Result<()>;

    async fn rename_node(&self, session: &Session, id: &NodeId, name: &str) -> Result<Record>;

    async fn move_node(&self, session: &Session, id: &NodeId, parent: &NodeId) -> Result<Record>;

    /// Replace the content of a file, returning its refreshed record.
    async fn write_content(&self, session: &Session, id: &NodeId, data: &[u8]) -> Result<Record>;

    async fn read_content(&self, session: &Session, id: &NodeId) -> Result<Vec<u8>>;
}

/// Supplies session handles for a [`RemoteApi`].
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current session; called once at the start of every cycle.
    async fn session(&self) -> Result<Session>;

    /// Obtain a fresh session after the remote rejected the current one.
    async fn renew(&self) -> Result<Session>;
}

/// Credential provider that always hands out the same session.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    session: Session,
}
impl StaticCredentials {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}
impl Default for StaticCredentials {
    fn default() -> Self {
        Self::new(Session::new("anonymous"))
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn session(&self) -> Result<Session> {
        Ok(self.session.clone())
    }

    async fn renew(&self) -> Result<Session> {
        Ok(self.session.clone())
    }
}
