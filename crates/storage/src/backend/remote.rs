//! Adapts a [`RemoteApi`] client into a [`SyncTarget`].

use async_trait::async_trait;
use exn::ResultExt;
use std::future::Future;
use tokio::sync::RwLock;

use crate::backend::{Addressing, Receipt, SyncTarget};
use crate::error::{ErrorKind, Result};
use crate::models::{NodeId, NodeKind, Page, PageCursor, Record, Session};
use crate::remote::{CredentialHandle, RemoteHandle};

/// Remote side of a sync.
///
/// Holds the session for the current cycle. When the remote rejects it, the
/// session is renewed through the [`CredentialProvider`](crate::CredentialProvider)
/// once and the call is repeated; a second rejection (or a failed renewal)
/// surfaces as [`Unauthorized`](ErrorKind::Unauthorized).
pub struct RemoteTarget {
    api: RemoteHandle,
    credentials: CredentialHandle,
    session: RwLock<Session>,
}
impl RemoteTarget {
    pub fn new(api: RemoteHandle, credentials: CredentialHandle, session: Session) -> Self {
        Self {
            api,
            credentials,
            session: RwLock::new(session),
        }
    }

    pub fn api(&self) -> &RemoteHandle {
        &self.api
    }

    pub fn root(&self) -> &NodeId {
        self.api.root()
    }

    /// One page of the flat listing, with session renewal.
    pub async fn list_page(&self, parent: Option<&NodeId>, cursor: Option<&PageCursor>) -> Result<Page> {
        self.authorized(|session| async move { self.api.list_children(&session, parent, cursor).await }).await
    }

    async fn authorized<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.session.read().await.clone();
        match op(session).await {
            Err(err) if matches!(&*err, ErrorKind::Unauthorized) => {
                tracing::info!(remote = self.api.name(), "Session rejected; renewing");
                let renewed = self.credentials.renew().await.or_raise(|| ErrorKind::Unauthorized)?;
                *self.session.write().await = renewed.clone();
                op(renewed).await
            },
            result => result,
        }
    }

    fn receipt(record: Record) -> Result<Receipt> {
        let id = record.id.ok_or_else(|| {
            exn::Exn::from(ErrorKind::BackendError(format!("remote returned `{}` without an identifier", record.name)))
        })?;
        Ok(Receipt {
            id,
            fingerprint: record.fingerprint,
        })
    }
}

#[async_trait]
impl SyncTarget for RemoteTarget {
    fn name(&self) -> &str {
        self.api.name()
    }

    fn addressing(&self) -> Addressing {
        self.api.addressing()
    }

    async fn create(&self, parent: &NodeId, name: &str, kind: NodeKind) -> Result<Receipt> {
        let record = self.authorized(|s| async move { self.api.create_node(&s, parent, name, kind).await }).await?;
        Self::receipt(record)
    }

    async fn delete(&self, id: &NodeId) -> Result<()> {
        self.authorized(|s| async move { self.api.delete_node(&s, id).await }).await
    }

    async fn rename(&self, id: &NodeId, name: &str) -> Result<Receipt> {
        let record = self.authorized(|s| async move { self.api.rename_node(&s, id, name).await }).await?;
        Self::receipt(record)
    }

    async fn relocate(&self, id: &NodeId, parent: &NodeId) -> Result<Receipt> {
        let record = self.authorized(|s| async move { self.api.move_node(&s, id, parent).await }).await?;
        Self::receipt(record)
    }

    async fn read(&self, id: &NodeId) -> Result<Vec<u8>> {
        self.authorized(|s| async move { self.api.read_content(&s, id).await }).await
    }

    async fn write(&self, id: &NodeId, data: &[u8]) -> Result<Receipt> {
        let record = self.authorized(|s| async move { self.api.write_content(&s, id, data).await }).await?;
        Self::receipt(record)
    }
}
