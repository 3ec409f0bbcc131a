//! Negotiation of file transfers with one party.
//!
//! The side that starts a transfer picks one of the four actions, asks the
//! peer to run its counterpart through a `transfer` request, and moves the
//! bytes inside the shared [`TransferQueue`]. The peer's half runs in
//! [`TransferHelper::serve`].

use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::fs::FileContainer;
use crate::net::connector::{DynamicConnector, DynamicServer, SocketTimeouts};
use crate::net::message::{Command, ConnectionAddress, Message, TransferRequest};
use crate::net::messenger::Messenger;
use crate::net::request::PendingRequests;
use crate::transfer::actions::{self, Direction, TransferAction};
use crate::transfer::queue::TransferQueue;
use crate::transfer::throttle::BandwidthLimiter;

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub request_timeout: Duration,
    pub timeouts: SocketTimeouts,
    /// Host advertised for listening transfers. Defaults to the local
    /// address of the control connection.
    pub transfer_host: Option<String>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            timeouts: SocketTimeouts::default(),
            transfer_host: None,
        }
    }
}

#[derive(Clone)]
pub struct TransferHelper {
    container: Arc<FileContainer>,
    messenger: Messenger,
    pending: PendingRequests,
    queue: Arc<TransferQueue>,
    limiter: BandwidthLimiter,
    prefer_connecting: bool,
    settings: TransferSettings,
}

impl TransferHelper {
    pub fn new(
        container: Arc<FileContainer>,
        messenger: Messenger,
        pending: PendingRequests,
        queue: Arc<TransferQueue>,
        limiter: BandwidthLimiter,
        prefer_connecting: bool,
        settings: TransferSettings,
    ) -> Self {
        Self {
            container,
            messenger,
            pending,
            queue,
            limiter,
            prefer_connecting,
            settings,
        }
    }

    /// Fetch `name` from the party. Returns the number of bytes received.
    pub async fn request_file(&self, name: &str) -> Result<u64> {
        self.enqueue(Direction::Download, name).await
    }

    /// Send `name` to the party. Returns the number of bytes sent.
    pub async fn push_file(&self, name: &str) -> Result<u64> {
        self.enqueue(Direction::Upload, name).await
    }

    async fn enqueue(&self, direction: Direction, name: &str) -> Result<u64> {
        let helper = self.clone();
        let name = name.to_string();
        self.queue
            .run(async move { helper.initiate(direction, &name).await })
            .await
    }

    async fn initiate(&self, direction: Direction, name: &str) -> Result<u64> {
        if direction == Direction::Upload {
            self.ensure_readable(name).await?;
        }

        let action = TransferAction::choose(direction, self.prefer_connecting);
        debug!(name, ?action, "starting transfer");
        let transferred = if action.is_connect() {
            let request = TransferRequest {
                action: action.counterpart(),
                name: name.to_string(),
                address: None,
            };
            let reply = self
                .pending
                .request(
                    &self.messenger,
                    Command::Transfer(request),
                    self.settings.request_timeout,
                )
                .await?;
            let address: ConnectionAddress = serde_json::from_value(reply)
                .map_err(|e| SyncError::Protocol(format!("bad rendezvous address: {}", e)))?;
            self.connect(direction, name, &address).await?
        } else {
            let announce = |address: ConnectionAddress| async move {
                let request = TransferRequest {
                    action: action.counterpart(),
                    name: name.to_string(),
                    address: Some(address),
                };
                self.pending
                    .request(
                        &self.messenger,
                        Command::Transfer(request),
                        self.settings.request_timeout,
                    )
                    .await
                    .map(|_| ())
            };
            self.listen(direction, name, announce).await?
        };
        info!(name, ?direction, bytes = transferred, "transfer finished");
        Ok(transferred)
    }

    /// Run our half of a transfer the party asked for.
    ///
    /// Returns the name of the file that was received, if any, so the caller
    /// can tell other parties about it.
    pub async fn serve(&self, id: Option<String>, request: TransferRequest) -> Result<Option<String>> {
        let TransferRequest {
            action,
            name,
            address,
        } = request;
        let direction = action.direction();

        if direction == Direction::Upload {
            if let Err(e) = self.ensure_readable(&name).await {
                self.reply(id.as_deref(), Command::error(e.to_string()));
                return Err(e);
            }
        }

        if action.is_connect() {
            let Some(address) = address else {
                let e = SyncError::Protocol(format!("transfer of {} without an address", name));
                self.reply(id.as_deref(), Command::error(e.to_string()));
                return Err(e);
            };
            self.reply(id.as_deref(), Command::Response(json!(true)));
            self.connect(direction, &name, &address).await?;
        } else {
            let id = id.as_deref();
            let announce = |address: ConnectionAddress| async move {
                let address = serde_json::to_value(address)?;
                match id {
                    Some(id) => self
                        .messenger
                        .try_send(Message::with_id(Command::Response(address), id)),
                    None => Err(SyncError::Protocol(
                        "listening transfer requested without an id".into(),
                    )),
                }
            };
            self.listen(direction, &name, announce).await?;
        }

        Ok((direction == Direction::Download).then_some(name))
    }

    async fn connect(&self, direction: Direction, name: &str, address: &ConnectionAddress) -> Result<u64> {
        let connector = DynamicConnector::new(self.settings.timeouts);
        match direction {
            Direction::Upload => {
                actions::connect_and_upload(&self.container, name, &connector, address, &self.limiter)
                    .await
            }
            Direction::Download => {
                actions::connect_and_download(&self.container, name, &connector, address).await
            }
        }
    }

    async fn listen<F, Fut>(&self, direction: Direction, name: &str, announce: F) -> Result<u64>
    where
        F: FnOnce(ConnectionAddress) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let server = self.dynamic_server();
        match direction {
            Direction::Upload => {
                actions::listen_and_upload(&self.container, name, &server, &self.limiter, announce)
                    .await
            }
            Direction::Download => {
                actions::listen_and_download(&self.container, name, &server, announce).await
            }
        }
    }

    fn dynamic_server(&self) -> DynamicServer {
        let local_ip = self
            .messenger
            .local_addr()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let host = self
            .settings
            .transfer_host
            .clone()
            .unwrap_or_else(|| local_ip.to_string());
        DynamicServer::new(local_ip, host, self.settings.timeouts)
    }

    async fn ensure_readable(&self, name: &str) -> Result<()> {
        let meta = self.container.get_file_meta(name).await?;
        if !meta.exists || meta.is_directory {
            return Err(SyncError::transfer(name, "no such file"));
        }
        Ok(())
    }

    fn reply(&self, id: Option<&str>, command: Command) {
        if let Some(id) = id {
            self.messenger.write_message(Message::with_id(command, id));
        }
    }
}

