//! Request/response correlation over a messenger.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::fs::container::lock;
use crate::net::message::{Command, Message};
use crate::net::messenger::Messenger;

type Waiters = HashMap<String, oneshot::Sender<Result<Value>>>;

/// Outstanding requests of one engine, keyed by message id.
#[derive(Clone, Default)]
pub struct PendingRequests {
    waiters: Arc<Mutex<Waiters>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `command` under a fresh id and wait for the matching `response`
    /// or `error`.
    pub async fn request(
        &self,
        messenger: &Messenger,
        command: Command,
        timeout: Duration,
    ) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let kind = command.kind();
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(id.clone(), tx);

        if let Err(e) = messenger.try_send(Message::with_id(command, id.clone())) {
            lock(&self.waiters).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => {
                lock(&self.waiters).remove(&id);
                Err(SyncError::Timeout(format!("waiting for reply to {}", kind)))
            }
        }
    }

    /// Deliver the outcome of request `id`. Each id resolves at most once.
    pub fn resolve(&self, id: &str, result: Result<Value>) -> Result<()> {
        let waiter = lock(&self.waiters).remove(id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
                Ok(())
            }
            None => Err(SyncError::Protocol(format!(
                "reply to unknown request {}",
                id
            ))),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.waiters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::auth::AuthorisedStream;
    use crate::net::connection::RecoveryStrategy;
    use crate::net::message::PathBody;
    use crate::net::messenger::{MessengerEvent, MessengerEvents};
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};

    struct Pair {
        local: Messenger,
        local_events: MessengerEvents,
        remote: Messenger,
        remote_events: MessengerEvents,
    }

    async fn messengers() -> Pair {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (local, local_events) = Messenger::spawn(
            AuthorisedStream::new(client.unwrap()),
            RecoveryStrategy::Abort,
        );
        let (remote, remote_events) = Messenger::spawn(
            AuthorisedStream::new(server.unwrap().0),
            RecoveryStrategy::Abort,
        );
        Pair {
            local,
            local_events,
            remote,
            remote_events,
        }
    }

    #[tokio::test]
    async fn test_reply_resolves_request() {
        let Pair {
            local,
            mut local_events,
            remote,
            mut remote_events,
        } = messengers().await;
        let pending = PendingRequests::new();

        tokio::spawn(async move {
            while let Some(event) = remote_events.recv().await {
                if let MessengerEvent::Message(Message { id: Some(id), command }) = event {
                    let reply = match command {
                        Command::GetFileList => Command::Response(json!(["a.txt"])),
                        _ => Command::error("unsupported"),
                    };
                    remote.write_message(Message::with_id(reply, id));
                }
            }
        });

        let router = pending.clone();
        tokio::spawn(async move {
            while let Some(event) = local_events.recv().await {
                if let MessengerEvent::Message(Message { id: Some(id), command }) = event {
                    let result = match command {
                        Command::Response(value) => Ok(value),
                        Command::Error(body) => Err(SyncError::Remote(body.message)),
                        _ => continue,
                    };
                    router.resolve(&id, result).unwrap();
                }
            }
        });

        let timeout = Duration::from_secs(2);
        let listed = pending
            .request(&local, Command::GetFileList, timeout)
            .await
            .unwrap();
        assert_eq!(listed, json!(["a.txt"]));

        let refused = pending
            .request(&local, Command::DeletePath(PathBody::new("x")), timeout)
            .await;
        assert!(matches!(refused, Err(SyncError::Remote(_))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_protocol_error() {
        let pending = PendingRequests::new();
        assert!(matches!(
            pending.resolve("nope", Ok(Value::Null)),
            Err(SyncError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_forgets_request() {
        let pair = messengers().await;
        let local = pair.local;
        let pending = PendingRequests::new();
        let result = pending
            .request(&local, Command::GetFileList, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SyncError::Timeout(_))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_dead_messenger_fails_fast() {
        let local = messengers().await.local;
        local.disconnect();
        let mut state = local.subscribe_state();
        state
            .wait_for(|s| *s == crate::net::connection::ConnectionState::Dead)
            .await
            .unwrap();

        let pending = PendingRequests::new();
        assert!(matches!(
            pending
                .request(&local, Command::GetFileList, Duration::from_secs(5))
                .await,
            Err(SyncError::Disconnected)
        ));
        assert!(pending.is_empty());
    }
}
