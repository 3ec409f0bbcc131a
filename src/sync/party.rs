//! One connected peer as seen by the engine.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::fs::SyncData;
use crate::net::message::{Command, PathBody};
use crate::net::messenger::Messenger;
use crate::net::request::PendingRequests;
use crate::sync::driver::SyncSubject;
use crate::transfer::TransferHelper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartyId(pub u64);

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "party-{}", self.0)
    }
}

pub struct Party {
    pub id: PartyId,
    pub messenger: Messenger,
    pub transfers: TransferHelper,
    pending: PendingRequests,
    request_timeout: Duration,
}

impl Party {
    pub(crate) fn new(
        id: PartyId,
        messenger: Messenger,
        transfers: TransferHelper,
        pending: PendingRequests,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id,
            messenger,
            transfers,
            pending,
            request_timeout,
        }
    }

    pub async fn request(&self, command: Command) -> Result<Value> {
        self.pending
            .request(&self.messenger, command, self.request_timeout)
            .await
    }
}

#[async_trait]
impl SyncSubject for Party {
    async fn get_remote_file_meta(&self, name: &str) -> Result<SyncData> {
        let value = self
            .request(Command::GetMetaForFile(PathBody::new(name)))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| SyncError::Protocol(format!("bad metadata for {}: {}", name, e)))
    }

    async fn get_remote_file_list(&self) -> Result<Vec<String>> {
        let value = self.request(Command::GetFileList).await?;
        serde_json::from_value(value)
            .map_err(|e| SyncError::Protocol(format!("bad file list: {}", e)))
    }

    async fn request_remote_file(&self, name: &str) -> Result<()> {
        self.transfers.request_file(name).await.map(|_| ())
    }

    async fn push_file_to_remote(&self, name: &str) -> Result<()> {
        self.transfers.push_file(name).await.map(|_| ())
    }

    async fn create_remote_directory(&self, name: &str) -> Result<()> {
        self.request(Command::CreateDirectory(PathBody::new(name)))
            .await
            .map(|_| ())
    }

    async fn delete_remote_file(&self, name: &str) -> Result<()> {
        self.request(Command::DeletePath(PathBody::new(name)))
            .await
            .map(|_| ())
    }
}
