//! One-round token handshake on a freshly opened socket.
//!
//! The initiating side sends `{"type":"handshake","token":..}` and the
//! accepting side answers `{"type":"handshake","success":..}`. Both run under
//! a deadline. Bytes that arrived behind the handshake frame stay buffered in
//! the returned [`AuthorisedStream`].

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::net::codec::{to_payload, FrameCodec};
use crate::net::message::{HandshakeRequest, HandshakeResponse};

pub const INVALID_TOKEN: &str = "invalid token";

/// A socket that passed (or did not need) the handshake.
#[derive(Debug)]
pub struct AuthorisedStream {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl AuthorisedStream {
    /// Wrap a socket used without a token.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::new(),
        }
    }

    fn from_framed(framed: Framed<TcpStream, FrameCodec>) -> Self {
        let parts = framed.into_parts();
        Self {
            stream: parts.io,
            read_buf: parts.read_buf,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Frame the socket for the control protocol.
    pub fn framed(self) -> Framed<TcpStream, FrameCodec> {
        let mut parts = FramedParts::new::<bytes::Bytes>(self.stream, FrameCodec::new());
        parts.read_buf = self.read_buf;
        Framed::from_parts(parts)
    }

    /// Raw byte halves for a transfer. The read half yields whatever was
    /// buffered behind the handshake before reading from the socket.
    pub fn into_split(self) -> (impl AsyncRead + Unpin + Send, OwnedWriteHalf) {
        let (read, write) = self.stream.into_split();
        (Cursor::new(self.read_buf).chain(read), write)
    }
}

fn timed_out(timeout: Duration) -> SyncError {
    SyncError::Authentication(format!("handshake timed out after {:?}", timeout))
}

async fn next_frame(framed: &mut Framed<TcpStream, FrameCodec>) -> Result<bytes::Bytes> {
    match framed.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(SyncError::Authentication(format!("bad handshake frame: {}", e))),
        None => Err(SyncError::Authentication(
            "connection closed during handshake".into(),
        )),
    }
}

/// Wait for the peer's token and compare it with `expected`.
pub async fn accept_handshake(
    stream: TcpStream,
    expected: &str,
    timeout: Duration,
) -> Result<AuthorisedStream> {
    let peer = stream.peer_addr().ok();
    let mut framed = Framed::new(stream, FrameCodec::new());

    let accepted = tokio::time::timeout(timeout, async {
        let frame = next_frame(&mut framed).await?;
        let request: HandshakeRequest = serde_json::from_slice(&frame)
            .map_err(|e| SyncError::Authentication(format!("bad handshake: {}", e)))?;

        let success = request.token == expected;
        let response = HandshakeResponse {
            success,
            reason: (!success).then(|| INVALID_TOKEN.to_string()),
        };
        framed.send(to_payload(&response)?).await?;
        Ok::<bool, SyncError>(success)
    })
    .await
    .map_err(|_| timed_out(timeout))??;

    if !accepted {
        warn!(?peer, "rejected connection with invalid token");
        return Err(SyncError::Authentication(INVALID_TOKEN.into()));
    }
    debug!(?peer, "handshake accepted");
    Ok(AuthorisedStream::from_framed(framed))
}

/// Present `token` to the accepting side and wait for its verdict.
pub async fn initiate_handshake(
    stream: TcpStream,
    token: &str,
    timeout: Duration,
) -> Result<AuthorisedStream> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    let response = tokio::time::timeout(timeout, async {
        let request = HandshakeRequest {
            token: token.to_string(),
        };
        framed.send(to_payload(&request)?).await?;
        let frame = next_frame(&mut framed).await?;
        serde_json::from_slice::<HandshakeResponse>(&frame)
            .map_err(|e| SyncError::Authentication(format!("bad handshake response: {}", e)))
    })
    .await
    .map_err(|_| timed_out(timeout))??;

    if !response.success {
        return Err(SyncError::Authentication(
            response.reason.unwrap_or_else(|| "rejected by peer".into()),
        ));
    }
    Ok(AuthorisedStream::from_framed(framed))
}
