//! Runs a strategy over the union of both trees.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::fs::{FileContainer, SyncData};
use crate::sync::strategy::{decide, DeleteFlags, SyncAction, SyncStrategy};

/// The remote half of a reconciliation.
#[async_trait]
pub trait SyncSubject: Send + Sync {
    async fn get_remote_file_meta(&self, name: &str) -> Result<SyncData>;
    async fn get_remote_file_list(&self) -> Result<Vec<String>>;
    async fn request_remote_file(&self, name: &str) -> Result<()>;
    async fn push_file_to_remote(&self, name: &str) -> Result<()>;
    async fn create_remote_directory(&self, name: &str) -> Result<()>;
    async fn delete_remote_file(&self, name: &str) -> Result<()>;
}

/// What one strategy run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub examined: usize,
    pub downloaded: usize,
    pub uploaded: usize,
    pub created_local_dirs: usize,
    pub created_remote_dirs: usize,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    /// Names left untouched because neither side wins.
    pub conflicts: Vec<String>,
}

impl SyncReport {
    /// Files whose bytes crossed the wire.
    pub fn transferred(&self) -> usize {
        self.downloaded + self.uploaded
    }

    fn record(&mut self, name: String, action: SyncAction) {
        match action {
            SyncAction::None => {}
            SyncAction::CreateLocalDirectory => self.created_local_dirs += 1,
            SyncAction::Download => self.downloaded += 1,
            SyncAction::DeleteLocal => self.deleted_local += 1,
            SyncAction::CreateRemoteDirectory => self.created_remote_dirs += 1,
            SyncAction::Upload => self.uploaded += 1,
            SyncAction::DeleteRemote => self.deleted_remote += 1,
            SyncAction::Conflict => self.conflicts.push(name),
        }
    }
}

/// Retry `step` up to `retries` more times after a failure.
async fn with_retry<T, F, Fut>(retries: u32, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match step().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retries => {
                debug!(attempt, error = %e, "retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reconcile `container` with `subject` according to `strategy`.
///
/// Every name is handled concurrently and independently. The result is
/// returned once all of them settled; if any failed, the first failure is
/// returned instead of the report.
pub async fn run(
    strategy: SyncStrategy,
    container: &FileContainer,
    subject: &dyn SyncSubject,
    flags: DeleteFlags,
) -> Result<SyncReport> {
    if strategy == SyncStrategy::NoOp {
        return Ok(SyncReport::default());
    }

    let (local, remote) = futures::try_join!(container.get_file_tree(), subject.get_remote_file_list())?;
    // Directory-only patterns are checked again in `sync_one`, once the type
    // of each name is known.
    let filter = container.filter();
    let names: BTreeSet<String> = local
        .into_iter()
        .chain(remote)
        .filter(|name| !filter.is_ignored(name, false))
        .collect();
    info!(%strategy, files = names.len(), "reconciling");

    let retries = if strategy == SyncStrategy::Newest { 0 } else { 1 };
    let outcomes = join_all(names.into_iter().map(|name| async move {
        let outcome = sync_one(strategy, container, subject, flags, retries, &name).await;
        (name, outcome)
    }))
    .await;

    let mut report = SyncReport::default();
    let mut first_error: Option<SyncError> = None;
    for (name, outcome) in outcomes {
        report.examined += 1;
        match outcome {
            Ok(action) => report.record(name, action),
            Err(e) => {
                warn!(name, error = %e, "failed to reconcile");
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if !report.conflicts.is_empty() {
        warn!(conflicts = ?report.conflicts, "left conflicting files untouched");
    }
    info!(?report, "reconciled");
    Ok(report)
}

async fn sync_one(
    strategy: SyncStrategy,
    container: &FileContainer,
    subject: &dyn SyncSubject,
    flags: DeleteFlags,
    retries: u32,
    name: &str,
) -> Result<SyncAction> {
    let (local, remote) = with_retry(retries, move || async move {
        futures::try_join!(container.get_file_meta(name), subject.get_remote_file_meta(name))
    })
    .await?;
    if container
        .filter()
        .is_ignored(name, local.is_directory || remote.is_directory)
    {
        debug!(name, "skipping excluded directory");
        return Ok(SyncAction::None);
    }

    let action = decide(strategy, &local, &remote, flags);
    if action != SyncAction::None {
        debug!(name, ?action, "applying");
    }
    with_retry(retries, move || apply(action, container, subject, name)).await?;
    Ok(action)
}

async fn apply(action: SyncAction, container: &FileContainer, subject: &dyn SyncSubject, name: &str) -> Result<()> {
    match action {
        SyncAction::None | SyncAction::Conflict => Ok(()),
        SyncAction::CreateLocalDirectory => container.create_directory(name).await,
        SyncAction::Download => subject.request_remote_file(name).await,
        SyncAction::DeleteLocal => container.delete_file(name).await,
        SyncAction::CreateRemoteDirectory => subject.create_remote_directory(name).await,
        SyncAction::Upload => subject.push_file_to_remote(name).await,
        SyncAction::DeleteRemote => subject.delete_remote_file(name).await,
    }
}
