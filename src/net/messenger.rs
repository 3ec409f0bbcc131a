//! Framed control channel to one party.
//!
//! A messenger is a cheap handle to a single task that owns the socket. The
//! task pumps outbound messages, decodes inbound frames into [`Message`]s
//! and, when the socket fails, follows the connection's
//! [`RecoveryStrategy`].

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::fs::container::lock;
use crate::net::auth::AuthorisedStream;
use crate::net::codec::FrameCodec;
use crate::net::connection::{reconnect, ConnectionState, RecoveryStrategy};
use crate::net::message::{Command, Envelope, Message};

/// Lifecycle and traffic of one messenger.
#[derive(Debug)]
pub enum MessengerEvent {
    Message(Message),
    /// The socket was lost and recovery started.
    Recovering,
    Reconnected,
    /// Terminal; no further events follow.
    Died,
}

pub type MessengerEvents = mpsc::UnboundedReceiver<MessengerEvent>;

#[derive(Clone, Debug)]
pub struct Messenger {
    outbound: mpsc::UnboundedSender<Message>,
    attach: mpsc::UnboundedSender<AuthorisedStream>,
    state: watch::Receiver<ConnectionState>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    cancel: CancellationToken,
}

impl Messenger {
    /// Start the messenger task on an authorised socket.
    pub fn spawn(stream: AuthorisedStream, strategy: RecoveryStrategy) -> (Messenger, MessengerEvents) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let local_addr = Arc::new(Mutex::new(stream.local_addr()));
        let cancel = CancellationToken::new();

        let task = MessengerTask {
            strategy,
            outbound: outbound_rx,
            attach: attach_rx,
            events: events_tx,
            state: state_tx,
            local_addr: local_addr.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run(stream));

        let messenger = Messenger {
            outbound: outbound_tx,
            attach: attach_tx,
            state: state_rx,
            local_addr,
            cancel,
        };
        (messenger, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Local address of the current socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Queue a message, failing if the connection is not alive.
    pub fn try_send(&self, message: Message) -> Result<()> {
        if !self.is_alive() {
            return Err(SyncError::Disconnected);
        }
        self.outbound
            .send(message)
            .map_err(|_| SyncError::Disconnected)
    }

    /// Queue a message. On a connection that is not alive the message is
    /// dropped with a warning.
    pub fn write_message(&self, message: Message) {
        let kind = message.command.kind();
        if let Err(e) = self.try_send(message) {
            warn!(kind, error = %e, "dropping message");
        }
    }

    /// Hand a new socket to a messenger waiting for reconnection. The socket
    /// is given back if this messenger is not waiting for one.
    pub fn attach(&self, stream: AuthorisedStream) -> std::result::Result<(), AuthorisedStream> {
        if self.state() != ConnectionState::Disconnected {
            return Err(stream);
        }
        self.attach.send(stream).map_err(|e| e.0)
    }

    /// Close the connection for good.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

enum PumpEnd {
    Cancelled,
    Lost(String),
}

struct MessengerTask {
    strategy: RecoveryStrategy,
    outbound: mpsc::UnboundedReceiver<Message>,
    attach: mpsc::UnboundedReceiver<AuthorisedStream>,
    events: mpsc::UnboundedSender<MessengerEvent>,
    state: watch::Sender<ConnectionState>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    cancel: CancellationToken,
}

impl MessengerTask {
    async fn run(mut self, mut stream: AuthorisedStream) {
        loop {
            *lock(&self.local_addr) = stream.local_addr();
            self.state.send_replace(ConnectionState::Connected);

            let mut framed = stream.framed();
            let reason = match self.pump(&mut framed).await {
                PumpEnd::Cancelled => break,
                PumpEnd::Lost(reason) => reason,
            };
            drop(framed);
            info!(%reason, strategy = ?self.strategy, "connection lost");

            match self.recover().await {
                Some(next) => {
                    stream = next;
                    let _ = self.events.send(MessengerEvent::Reconnected);
                }
                None => break,
            }
        }

        self.state.send_replace(ConnectionState::Dead);
        let _ = self.events.send(MessengerEvent::Died);
        debug!("messenger stopped");
    }

    async fn pump(&mut self, framed: &mut Framed<TcpStream, FrameCodec>) -> PumpEnd {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                frame = framed.next() => match frame {
                    None => return PumpEnd::Lost("closed by peer".into()),
                    Some(Err(e)) => return PumpEnd::Lost(e.to_string()),
                    Some(Ok(frame)) => {
                        if let Some(reply) = self.dispatch(frame) {
                            if let Err(e) = send(framed, &reply).await {
                                return PumpEnd::Lost(e.to_string());
                            }
                        }
                    }
                },
                message = self.outbound.recv() => match message {
                    None => return PumpEnd::Cancelled,
                    Some(message) => {
                        if let Err(e) = send(framed, &message).await {
                            return PumpEnd::Lost(e.to_string());
                        }
                    }
                },
            }
        }
    }

    /// Decode one frame. Returns an `error` reply for frames that cannot be
    /// understood.
    fn dispatch(&self, frame: Bytes) -> Option<Message> {
        let envelope = match serde_json::from_slice::<Envelope>(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "malformed message");
                let id = serde_json::from_slice::<Value>(&frame)
                    .ok()
                    .and_then(|value| value.get("id")?.as_str().map(String::from));
                return Some(error_reply(format!("malformed message: {}", e), id));
            }
        };

        let id = envelope.id.clone();
        match Message::from_envelope(envelope) {
            Ok(message) => {
                debug!(kind = message.command.kind(), id = ?message.id, "received");
                let _ = self.events.send(MessengerEvent::Message(message));
                None
            }
            Err(e) => {
                warn!(error = %e, "rejected message");
                Some(error_reply(e.to_string(), id))
            }
        }
    }

    async fn recover(&mut self) -> Option<AuthorisedStream> {
        let MessengerTask {
            strategy,
            attach,
            events,
            state,
            cancel,
            ..
        } = self;

        match strategy {
            RecoveryStrategy::Abort => None,
            RecoveryStrategy::ReconnectToRemote { helper, policy } => {
                state.send_replace(ConnectionState::Connecting);
                let _ = events.send(MessengerEvent::Recovering);
                match reconnect(&**helper, policy, cancel).await {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        warn!(error = %e, "giving up on connection");
                        None
                    }
                }
            }
            RecoveryStrategy::ListenForReconnection { give_up_after } => {
                state.send_replace(ConnectionState::Disconnected);
                let _ = events.send(MessengerEvent::Recovering);
                let limit = *give_up_after;
                let wait = async move {
                    match limit {
                        Some(limit) => tokio::time::timeout(limit, attach.recv())
                            .await
                            .ok()
                            .flatten(),
                        None => attach.recv().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    stream = wait => {
                        if stream.is_none() {
                            warn!("no reconnection arrived in time");
                        }
                        stream
                    }
                }
            }
        }
    }
}

fn error_reply(message: String, id: Option<String>) -> Message {
    Message {
        command: Command::error(message),
        id,
    }
}

async fn send(framed: &mut Framed<TcpStream, FrameCodec>, message: &Message) -> Result<()> {
    let payload = message.to_bytes()?;
    debug!(kind = message.command.kind(), id = ?message.id, "sending");
    framed.send(payload).await?;
    Ok(())
}
