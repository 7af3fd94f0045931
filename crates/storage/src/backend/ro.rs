//! Read-only (dry run) sync target.
//!
//! This module provides a sync target that wraps other implementations and
//! prevents mutating operations from executing, but indicating success on
//! return.

use async_trait::async_trait;

use crate::backend::{Addressing, Receipt, SyncTarget};
use crate::error::Result;
use crate::models::{Fingerprint, NodeId, NodeKind};
use crate::{TargetHandle, validate_name};

/// Read-only sync target.
///
/// Wraps another target and silently drops all mutations, logging an
/// [`info event`](tracing::Event). The receipts it hands back are synthetic:
/// identifiers are derived the way the wrapped target would derive them where
/// that is predictable (path addressing), and invented otherwise.
#[derive(Clone)]
pub struct ReadOnlyBackend {
    inner: TargetHandle,
}
impl ReadOnlyBackend {
    pub fn new(inner: TargetHandle) -> Self {
        Self { inner }
    }

    fn placeholder(&self, parent: &NodeId, name: &str) -> NodeId {
        match self.inner.addressing() {
            Addressing::Path => parent.child(name),
            Addressing::Opaque => NodeId::new(format!("dry-run:{parent}/{name}")),
        }
    }
}

#[async_trait]
impl SyncTarget for ReadOnlyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn addressing(&self) -> Addressing {
        self.inner.addressing()
    }

    async fn create(&self, parent: &NodeId, name: &str, kind: NodeKind) -> Result<Receipt> {
        let name = validate_name(name)?;
        tracing::info!(backend = self.name(), parent = %parent, name, ?kind, "Skipping create during read-only mode");
        Ok(Receipt {
            id: self.placeholder(parent, name),
            fingerprint: None,
        })
    }

    async fn delete(&self, id: &NodeId) -> Result<()> {
        tracing::info!(backend = self.name(), id = %id, "Skipping delete during read-only mode");
        Ok(())
    }

    async fn rename(&self, id: &NodeId, name: &str) -> Result<Receipt> {
        let name = validate_name(name)?;
        tracing::info!(backend = self.name(), id = %id, name, "Skipping rename during read-only mode");
        let id = match (self.inner.addressing(), id.parent_path()) {
            (Addressing::Path, Some(parent)) => parent.child(name),
            _ => id.clone(),
        };
        Ok(Receipt { id, fingerprint: None })
    }

    async fn relocate(&self, id: &NodeId, parent: &NodeId) -> Result<Receipt> {
        tracing::info!(backend = self.name(), id = %id, parent = %parent, "Skipping move during read-only mode");
        let id = match self.inner.addressing() {
            Addressing::Path => parent.child(id.as_str().rsplit('/').next().unwrap_or_default()),
            Addressing::Opaque => id.clone(),
        };
        Ok(Receipt { id, fingerprint: None })
    }

    async fn read(&self, id: &NodeId) -> Result<Vec<u8>> {
        self.inner.read(id).await
    }

    async fn write(&self, id: &NodeId, data: &[u8]) -> Result<Receipt> {
        tracing::info!(backend = self.name(), id = %id, bytes = data.len(), "Skipping write during read-only mode");
        Ok(Receipt {
            id: id.clone(),
            fingerprint: Some(Fingerprint::of_content(data)),
        })
    }
}
