//! Remote tree builder.

use crate::error::{ErrorKind, Result};
use crate::tree::{MalformedRecord, OrphanPolicy, Problem, Snapshot};
use drivesync_storage::backend::RemoteTarget;
use drivesync_storage::error::ErrorKind as StorageErrorKind;
use drivesync_storage::{Node, PageCursor, Record, RetryPolicy};
use exn::ResultExt;
use std::collections::HashSet;
use tracing::instrument;

/// Result of listing the whole remote drive.
#[derive(Debug)]
pub struct RemoteScan {
    pub snapshot: Snapshot,
    /// Records that were dropped or repaired while building the tree.
    pub malformed: Vec<MalformedRecord>,
    pub pages: usize,
}

/// Pages through the flat remote listing and assembles it into a [`Snapshot`].
///
/// Pages are fetched one after another until the API stops returning a
/// cursor; each fetch is retried per `retry`. Every page is collected before
/// assembly, so records may arrive before their parents.
///
/// # Errors
///
/// - [`AuthExpired`](ErrorKind::AuthExpired) if the session was rejected and
///   could not be renewed.
/// - [`RemoteUnavailable`](ErrorKind::RemoteUnavailable) if a page could not be
///   fetched, or the API handed out the same cursor twice.
/// - [`Orphaned`](ErrorKind::Orphaned) / [`Cycle`](ErrorKind::Cycle) under
///   [`OrphanPolicy::Error`].
#[instrument(skip_all, fields(remote = remote.api().name()))]
pub async fn build_remote(remote: &RemoteTarget, retry: &RetryPolicy, policy: OrphanPolicy) -> Result<RemoteScan> {
    let mut records: Vec<Record> = Vec::new();
    let mut cursor: Option<PageCursor> = None;
    let mut seen_cursors: HashSet<String> = HashSet::new();
    let mut pages = 0;
    loop {
        let page = match retry.run("list remote page", || remote.list_page(None, cursor.as_ref())).await {
            Ok(page) => page,
            Err(err) if matches!(&*err, StorageErrorKind::Unauthorized) => {
                return Err(err).or_raise(|| ErrorKind::AuthExpired);
            },
            Err(err) => return Err(err).or_raise(|| ErrorKind::RemoteUnavailable),
        };
        pages += 1;
        records.extend(page.records);
        match page.next_cursor {
            Some(next) => {
                if !seen_cursors.insert(next.0.clone()) {
                    tracing::error!(cursor = next.0, "Remote listing returned a cursor it already handed out");
                    exn::bail!(ErrorKind::RemoteUnavailable);
                }
                cursor = Some(next);
            },
            None => break,
        }
    }
    tracing::debug!(pages, records = records.len(), "Remote listing complete");

    let mut malformed = Vec::new();
    let nodes: Vec<Node> = records.into_iter().filter_map(|record| to_node(record, &mut malformed)).collect();
    let assembled = Snapshot::assemble(remote.root().clone(), nodes, policy)?;
    malformed.extend(assembled.malformed);
    Ok(RemoteScan {
        snapshot: assembled.snapshot,
        malformed,
        pages,
    })
}

fn to_node(record: Record, malformed: &mut Vec<MalformedRecord>) -> Option<Node> {
    let Some(id) = record.id else {
        tracing::warn!(name = record.name, "Skipping remote record without an identifier");
        malformed.push(MalformedRecord::new(None, record.name, Problem::MissingId));
        return None;
    };
    if record.parents.len() > 1 {
        tracing::debug!(id = %id, parents = record.parents.len(), "Record has several parents; using the first");
    }
    Some(Node {
        id,
        name: record.name,
        kind: record.kind,
        parent: record.parents.into_iter().next(),
        fingerprint: record.fingerprint,
    })
}
