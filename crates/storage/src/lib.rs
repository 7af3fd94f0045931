pub mod backend;
pub mod error;
mod models;
mod path;
pub mod remote;
mod retry;

pub use crate::backend::{Addressing, Receipt, SyncTarget};
pub use crate::models::{Fingerprint, FingerprintMode, Node, NodeId, NodeKind, Page, PageCursor, Record, Session};
pub use crate::path::{validate as validate_path, validate_name};
pub use crate::remote::{CredentialHandle, CredentialProvider, RemoteApi, RemoteHandle, StaticCredentials};
pub use crate::retry::RetryPolicy;
use std::sync::Arc;

pub type TargetHandle = Arc<dyn SyncTarget + Send + Sync>;
