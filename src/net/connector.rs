//! Ways of obtaining an authorised socket.
//!
//! Constant helpers talk to one fixed endpoint and serve the control channel.
//! Dynamic helpers open a single-use endpoint per call and serve file
//! transfers, so no listener or socket is ever shared between two transfers.

use async_trait::async_trait;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::net::auth::{accept_handshake, initiate_handshake, AuthorisedStream};
use crate::net::message::ConnectionAddress;

/// Deadlines for the steps of opening a socket.
#[derive(Debug, Clone, Copy)]
pub struct SocketTimeouts {
    pub connect: Duration,
    /// How long a dynamic server waits for its single peer.
    pub accept: Duration,
    pub handshake: Duration,
}

impl Default for SocketTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            accept: Duration::from_secs(30),
            handshake: Duration::from_secs(10),
        }
    }
}

/// Source of replacement sockets for a connection that lost its own.
#[async_trait]
pub trait ConnectionHelper: Send + Sync {
    async fn get_new_socket(&self) -> Result<AuthorisedStream>;
}

async fn dial(addr: &str, timeouts: &SocketTimeouts) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeouts.connect, TcpStream::connect(addr))
        .await
        .map_err(|_| SyncError::Timeout(format!("connecting to {}", addr)))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Dials one fixed endpoint.
#[derive(Debug, Clone)]
pub struct ConstantConnector {
    addr: String,
    token: Option<String>,
    timeouts: SocketTimeouts,
}

impl ConstantConnector {
    pub fn new(addr: impl Into<String>, token: Option<String>, timeouts: SocketTimeouts) -> Self {
        Self {
            addr: addr.into(),
            token,
            timeouts,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl ConnectionHelper for ConstantConnector {
    async fn get_new_socket(&self) -> Result<AuthorisedStream> {
        let stream = dial(&self.addr, &self.timeouts).await?;
        debug!(addr = %self.addr, "connected");
        match &self.token {
            Some(token) => initiate_handshake(stream, token, self.timeouts.handshake).await,
            None => Ok(AuthorisedStream::new(stream)),
        }
    }
}

/// Listens on one fixed port and hands each inbound socket to exactly one
/// waiting caller.
#[derive(Debug)]
pub struct ConstantServer {
    listener: Mutex<TcpListener>,
    local_addr: SocketAddr,
    token: Option<String>,
    timeouts: SocketTimeouts,
}

impl ConstantServer {
    pub async fn bind(
        addr: impl tokio::net::ToSocketAddrs,
        token: Option<String>,
        timeouts: SocketTimeouts,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening for parties");
        Ok(Self {
            listener: Mutex::new(listener),
            local_addr,
            token,
            timeouts,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the next inbound socket without authorising it.
    pub async fn accept(&self) -> Result<TcpStream> {
        let listener = self
            .listener
            .try_lock()
            .map_err(|_| SyncError::Protocol("a socket request is already pending".into()))?;
        let (stream, peer) = listener.accept().await?;
        drop(listener);

        stream.set_nodelay(true)?;
        debug!(%peer, "accepted connection");
        Ok(stream)
    }

    /// Handshake for a socket taken with [`accept`](Self::accept). The future
    /// owns what it needs and can run on its own task.
    pub fn authorise(
        &self,
        stream: TcpStream,
    ) -> impl Future<Output = Result<AuthorisedStream>> + Send + 'static {
        let token = self.token.clone();
        let deadline = self.timeouts.handshake;
        async move {
            match token {
                Some(token) => accept_handshake(stream, &token, deadline).await,
                None => Ok(AuthorisedStream::new(stream)),
            }
        }
    }

    /// Accept sockets until the receiver is dropped. Every handshake runs on
    /// its own task, so a peer that never speaks only holds up itself.
    pub fn incoming(self) -> mpsc::Receiver<AuthorisedStream> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = tx.closed() => break,
                    accepted = self.accept() => accepted,
                };
                let stream = match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let handshake = self.authorise(stream);
                let tx = tx.clone();
                tokio::spawn(async move {
                    match handshake.await {
                        Ok(stream) => {
                            let _ = tx.send(stream).await;
                        }
                        Err(e) => warn!(error = %e, "rejected inbound connection"),
                    }
                });
            }
            debug!(local_addr = %self.local_addr, "stopped accepting");
        });
        rx
    }
}

#[async_trait]
impl ConnectionHelper for ConstantServer {
    async fn get_new_socket(&self) -> Result<AuthorisedStream> {
        let stream = self.accept().await?;
        self.authorise(stream).await
    }
}

/// Dials the one-shot endpoint a peer advertised for a transfer.
#[derive(Debug, Clone, Default)]
pub struct DynamicConnector {
    timeouts: SocketTimeouts,
}

impl DynamicConnector {
    pub fn new(timeouts: SocketTimeouts) -> Self {
        Self { timeouts }
    }

    pub async fn get_new_socket(&self, address: &ConnectionAddress) -> Result<AuthorisedStream> {
        if address.remote_host.is_empty() || address.remote_port == 0 {
            return Err(SyncError::Protocol(format!(
                "incomplete rendezvous address {:?}",
                address
            )));
        }
        let addr = format!("{}:{}", address.remote_host, address.remote_port);
        let stream = dial(&addr, &self.timeouts).await?;
        match &address.token {
            Some(token) => initiate_handshake(stream, token, self.timeouts.handshake).await,
            None => Ok(AuthorisedStream::new(stream)),
        }
    }
}

/// Opens a fresh ephemeral listener for every socket it produces.
#[derive(Debug, Clone)]
pub struct DynamicServer {
    bind_ip: IpAddr,
    advertised_host: String,
    timeouts: SocketTimeouts,
}

impl DynamicServer {
    /// `bind_ip` is where the listener is opened; `advertised_host` is the
    /// host name handed to the peer.
    pub fn new(bind_ip: IpAddr, advertised_host: impl Into<String>, timeouts: SocketTimeouts) -> Self {
        Self {
            bind_ip,
            advertised_host: advertised_host.into(),
            timeouts,
        }
    }

    /// Listen on a new port, tell the peer where through `listen_callback`,
    /// then accept and authorise exactly one connection.
    ///
    /// The listener is closed before this returns, whatever the outcome.
    pub async fn get_new_socket<F, Fut>(&self, listen_callback: F) -> Result<AuthorisedStream>
    where
        F: FnOnce(ConnectionAddress) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let listener = TcpListener::bind((self.bind_ip, 0)).await?;
        let token = Uuid::new_v4().to_string();
        let address = ConnectionAddress {
            remote_host: self.advertised_host.clone(),
            remote_port: listener.local_addr()?.port(),
            token: Some(token.clone()),
        };
        debug!(port = address.remote_port, "opened transfer listener");

        listen_callback(address).await?;

        let accepted = tokio::time::timeout(self.timeouts.accept, listener.accept()).await;
        drop(listener);

        let (stream, peer) = accepted
            .map_err(|_| SyncError::Timeout("waiting for a transfer connection".into()))??;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted transfer connection");
        accept_handshake(stream, &token, self.timeouts.handshake).await
    }
}
