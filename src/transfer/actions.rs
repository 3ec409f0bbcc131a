//! The four primitive ways of moving one file over a one-shot socket.
//!
//! Each action names which side dials and which side sends. The peer
//! always runs the [`TransferAction::counterpart`] of ours.
//!
//! On the socket the sender writes the file length as a big-endian `u64`
//! followed by exactly that many bytes, then half-closes. The receiver
//! answers a single byte once the content is in place: [`COMMITTED`] or
//! [`REJECTED`]. A sender that sees anything else has failed.

use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::fs::FileContainer;
use crate::net::auth::AuthorisedStream;
use crate::net::connector::{DynamicConnector, DynamicServer};
use crate::net::message::ConnectionAddress;
use crate::transfer::throttle::BandwidthLimiter;

const CHUNK_SIZE: usize = 64 * 1024;

/// Receiver's answer: the file was written and renamed into place.
pub const COMMITTED: u8 = 1;
/// Receiver's answer: the file could not be written.
pub const REJECTED: u8 = 0;

/// Which way file bytes flow, seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferAction {
    ConnectAndUpload,
    ConnectAndDownload,
    ListenAndUpload,
    ListenAndDownload,
}

impl TransferAction {
    pub fn choose(direction: Direction, prefer_connecting: bool) -> Self {
        match (direction, prefer_connecting) {
            (Direction::Upload, true) => TransferAction::ConnectAndUpload,
            (Direction::Upload, false) => TransferAction::ListenAndUpload,
            (Direction::Download, true) => TransferAction::ConnectAndDownload,
            (Direction::Download, false) => TransferAction::ListenAndDownload,
        }
    }

    /// The action the other end of the socket has to run.
    pub fn counterpart(self) -> Self {
        match self {
            TransferAction::ConnectAndUpload => TransferAction::ListenAndDownload,
            TransferAction::ConnectAndDownload => TransferAction::ListenAndUpload,
            TransferAction::ListenAndUpload => TransferAction::ConnectAndDownload,
            TransferAction::ListenAndDownload => TransferAction::ConnectAndUpload,
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            TransferAction::ConnectAndUpload | TransferAction::ListenAndUpload => Direction::Upload,
            TransferAction::ConnectAndDownload | TransferAction::ListenAndDownload => {
                Direction::Download
            }
        }
    }

    pub fn is_connect(self) -> bool {
        matches!(
            self,
            TransferAction::ConnectAndUpload | TransferAction::ConnectAndDownload
        )
    }
}

/// Stream `name` into the socket and wait until the receiver has committed it.
pub async fn upload(
    container: &FileContainer,
    name: &str,
    socket: AuthorisedStream,
    limiter: &BandwidthLimiter,
) -> Result<u64> {
    let Some(file) = container.get_read_stream_for_file(name).await else {
        return Err(SyncError::transfer(name, "file cannot be read"));
    };
    let path = container.root().join(name);
    let length = file
        .metadata()
        .await
        .map_err(|e| SyncError::filesystem(e, "reading", &path))?
        .len();
    let (mut reader, mut writer) = socket.into_split();
    writer
        .write_u64(length)
        .await
        .map_err(|e| SyncError::transfer(name, e))?;

    let mut file = file.take(length);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| SyncError::filesystem(e, "reading", &path))?;
        if n == 0 {
            break;
        }
        limiter.acquire(n).await;
        writer
            .write_all(&buffer[..n])
            .await
            .map_err(|e| SyncError::transfer(name, e))?;
        sent += n as u64;
    }
    if sent != length {
        return Err(SyncError::transfer(
            name,
            format!("file shrank to {} of {} bytes while sending", sent, length),
        ));
    }
    writer
        .shutdown()
        .await
        .map_err(|e| SyncError::transfer(name, e))?;

    match reader.read_u8().await {
        Ok(COMMITTED) => {
            debug!(name, bytes = sent, "uploaded");
            Ok(sent)
        }
        Ok(_) => Err(SyncError::transfer(name, "receiver failed to write the file")),
        Err(e) => Err(SyncError::transfer(
            name,
            format!("receiver closed without confirming: {}", e),
        )),
    }
}

/// Read one announced file from the socket into `name`, then tell the
/// sender whether it was committed.
pub async fn download(container: &FileContainer, name: &str, socket: AuthorisedStream) -> Result<u64> {
    let (mut reader, mut writer) = socket.into_split();
    let length = reader
        .read_u64()
        .await
        .map_err(|e| SyncError::transfer(name, format!("no length header: {}", e)))?;

    let result = container
        .consume_sized_stream(name, &mut reader, length)
        .await;
    let answer = if result.is_ok() { COMMITTED } else { REJECTED };
    let acknowledged: std::io::Result<()> = async {
        writer.write_u8(answer).await?;
        writer.shutdown().await
    }
    .await;

    let received = result?;
    acknowledged.map_err(|e| SyncError::transfer(name, e))?;
    debug!(name, bytes = received, "downloaded");
    Ok(received)
}

pub async fn connect_and_upload(
    container: &FileContainer,
    name: &str,
    connector: &DynamicConnector,
    address: &ConnectionAddress,
    limiter: &BandwidthLimiter,
) -> Result<u64> {
    let socket = connector.get_new_socket(address).await?;
    upload(container, name, socket, limiter).await
}

pub async fn connect_and_download(
    container: &FileContainer,
    name: &str,
    connector: &DynamicConnector,
    address: &ConnectionAddress,
) -> Result<u64> {
    let socket = connector.get_new_socket(address).await?;
    download(container, name, socket).await
}

pub async fn listen_and_upload<F, Fut>(
    container: &FileContainer,
    name: &str,
    server: &DynamicServer,
    limiter: &BandwidthLimiter,
    listen_callback: F,
) -> Result<u64>
where
    F: FnOnce(ConnectionAddress) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let socket = server.get_new_socket(listen_callback).await?;
    upload(container, name, socket, limiter).await
}

pub async fn listen_and_download<F, Fut>(
    container: &FileContainer,
    name: &str,
    server: &DynamicServer,
    listen_callback: F,
) -> Result<u64>
where
    F: FnOnce(ConnectionAddress) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let socket = server.get_new_socket(listen_callback).await?;
    download(container, name, socket).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{ContainerOptions, PathFilter};
    use crate::net::connector::SocketTimeouts;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    fn container(dir: &std::path::Path) -> FileContainer {
        FileContainer::new(
            dir,
            ContainerOptions {
                filter: PathFilter::without_defaults(),
                block_delay: Duration::from_millis(20),
                ..ContainerOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_counterparts_pair_up() {
        for action in [
            TransferAction::ConnectAndUpload,
            TransferAction::ConnectAndDownload,
            TransferAction::ListenAndUpload,
            TransferAction::ListenAndDownload,
        ] {
            let other = action.counterpart();
            assert_eq!(other.counterpart(), action);
            assert_ne!(other.direction(), action.direction());
            assert_ne!(other.is_connect(), action.is_connect());
        }
    }

    #[test]
    fn test_choose() {
        assert_eq!(
            TransferAction::choose(Direction::Download, true),
            TransferAction::ConnectAndDownload
        );
        assert_eq!(
            TransferAction::choose(Direction::Upload, false),
            TransferAction::ListenAndUpload
        );
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_value(TransferAction::ListenAndDownload).unwrap(),
            serde_json::json!("listenAndDownload")
        );
    }

    #[tokio::test]
    async fn test_listen_and_upload_to_connect_and_download() {
        let source_dir = tempdir().unwrap();
        let target_dir = tempdir().unwrap();
        let payload = vec![7u8; 200_000];
        std::fs::write(source_dir.path().join("big.bin"), &payload).unwrap();
        let source = container(source_dir.path());
        let target = container(target_dir.path());

        let server = DynamicServer::new(Ipv4Addr::LOCALHOST.into(), "127.0.0.1", SocketTimeouts::default());
        let connector = DynamicConnector::default();
        let limiter = BandwidthLimiter::unlimited();
        let (address_tx, address_rx) = oneshot::channel();

        let sending = listen_and_upload(
            &source,
            "big.bin",
            &server,
            &limiter,
            |address| async move {
                address_tx.send(address).map_err(|_| SyncError::Disconnected)
            },
        );
        let receiving = async {
            let address = address_rx.await.unwrap();
            connect_and_download(&target, "big.bin", &connector, &address).await
        };

        let (sent, received) = tokio::join!(sending, receiving);
        assert_eq!(sent.unwrap(), payload.len() as u64);
        assert_eq!(received.unwrap(), payload.len() as u64);
        assert_eq!(std::fs::read(target_dir.path().join("big.bin")).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_upload_of_missing_file_fails() {
        let source_dir = tempdir().unwrap();
        let source = container(source_dir.path());
        let server = DynamicServer::new(Ipv4Addr::LOCALHOST.into(), "127.0.0.1", SocketTimeouts::default());
        let connector = DynamicConnector::default();
        let limiter = BandwidthLimiter::unlimited();
        let (address_tx, address_rx) = oneshot::channel();

        let sending = listen_and_upload(
            &source,
            "missing.bin",
            &server,
            &limiter,
            |address| async move {
                address_tx.send(address).map_err(|_| SyncError::Disconnected)
            },
        );
        let dialling = async {
            let address = address_rx.await.unwrap();
            connector.get_new_socket(&address).await
        };

        let (sent, _) = tokio::join!(sending, dialling);
        assert!(matches!(sent, Err(SyncError::Transfer { .. })));
    }

    #[tokio::test]
    async fn test_sender_closing_early_fails_and_keeps_the_old_file() {
        let target_dir = tempdir().unwrap();
        std::fs::write(target_dir.path().join("f.txt"), "original content").unwrap();
        let target = container(target_dir.path());
        let server = DynamicServer::new(Ipv4Addr::LOCALHOST.into(), "127.0.0.1", SocketTimeouts::default());
        let connector = DynamicConnector::default();
        let (address_tx, address_rx) = oneshot::channel();

        let receiving = listen_and_download(&target, "f.txt", &server, |address| async move {
            address_tx.send(address).map_err(|_| SyncError::Disconnected)
        });
        let dropping = async {
            let address = address_rx.await.unwrap();
            let socket = connector.get_new_socket(&address).await.unwrap();
            drop(socket);
        };

        let (received, _) = tokio::join!(receiving, dropping);
        assert!(matches!(received, Err(SyncError::Transfer { .. })));
        assert_eq!(
            std::fs::read_to_string(target_dir.path().join("f.txt")).unwrap(),
            "original content"
        );
    }

    #[tokio::test]
    async fn test_truncated_body_fails_and_keeps_the_old_file() {
        let target_dir = tempdir().unwrap();
        std::fs::write(target_dir.path().join("f.txt"), "original content").unwrap();
        let target = container(target_dir.path());
        let server = DynamicServer::new(Ipv4Addr::LOCALHOST.into(), "127.0.0.1", SocketTimeouts::default());
        let connector = DynamicConnector::default();
        let (address_tx, address_rx) = oneshot::channel();

        let receiving = listen_and_download(&target, "f.txt", &server, |address| async move {
            address_tx.send(address).map_err(|_| SyncError::Disconnected)
        });
        let cutting_short = async {
            let address = address_rx.await.unwrap();
            let socket = connector.get_new_socket(&address).await.unwrap();
            let (mut reader, mut writer) = socket.into_split();
            writer.write_u64(1000).await.unwrap();
            writer.write_all(b"only a little").await.unwrap();
            writer.shutdown().await.unwrap();
            reader.read_u8().await
        };

        let (received, answer) = tokio::join!(receiving, cutting_short);
        assert!(matches!(received, Err(SyncError::Transfer { .. })));
        assert_eq!(answer.unwrap(), REJECTED);
        assert_eq!(
            std::fs::read_to_string(target_dir.path().join("f.txt")).unwrap(),
            "original content"
        );
    }

    #[tokio::test]
    async fn test_upload_returns_after_the_receiver_committed() {
        let source_dir = tempdir().unwrap();
        let target_dir = tempdir().unwrap();
        std::fs::write(source_dir.path().join("mine.txt"), "from the sender").unwrap();
        let source = container(source_dir.path());
        let target = container(target_dir.path());
        let server = DynamicServer::new(Ipv4Addr::LOCALHOST.into(), "127.0.0.1", SocketTimeouts::default());
        let connector = DynamicConnector::default();
        let limiter = BandwidthLimiter::unlimited();
        let (address_tx, address_rx) = oneshot::channel();

        let receiving = listen_and_download(&target, "mine.txt", &server, |address| async move {
            address_tx.send(address).map_err(|_| SyncError::Disconnected)
        });
        let sending = async {
            let address = address_rx.await.unwrap();
            let sent = connect_and_upload(&source, "mine.txt", &connector, &address, &limiter).await;
            let landed = std::fs::read_to_string(target_dir.path().join("mine.txt")).ok();
            (sent, landed)
        };

        let (received, (sent, landed)) = tokio::join!(receiving, sending);
        assert_eq!(received.unwrap(), 15);
        assert_eq!(sent.unwrap(), 15);
        assert_eq!(landed.as_deref(), Some("from the sender"));
    }

    #[tokio::test]
    async fn test_upload_fails_when_the_receiver_cannot_write() {
        let source_dir = tempdir().unwrap();
        let target_dir = tempdir().unwrap();
        std::fs::write(source_dir.path().join("clash"), "a file").unwrap();
        std::fs::create_dir_all(target_dir.path().join("clash/inside")).unwrap();
        let source = container(source_dir.path());
        let target = container(target_dir.path());
        let server = DynamicServer::new(Ipv4Addr::LOCALHOST.into(), "127.0.0.1", SocketTimeouts::default());
        let connector = DynamicConnector::default();
        let limiter = BandwidthLimiter::unlimited();
        let (address_tx, address_rx) = oneshot::channel();

        let receiving = listen_and_download(&target, "clash", &server, |address| async move {
            address_tx.send(address).map_err(|_| SyncError::Disconnected)
        });
        let sending = async {
            let address = address_rx.await.unwrap();
            connect_and_upload(&source, "clash", &connector, &address, &limiter).await
        };

        let (received, sent) = tokio::join!(receiving, sending);
        assert!(matches!(received, Err(SyncError::Filesystem { .. })));
        assert!(matches!(sent, Err(SyncError::Transfer { .. })));
        assert!(target_dir.path().join("clash/inside").is_dir());
    }
}
