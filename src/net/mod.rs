//! Control channel: framing, messages, handshakes, sockets and connections.

pub mod auth;
pub mod codec;
pub mod connection;
pub mod connector;
pub mod message;
pub mod messenger;
pub mod request;

pub use auth::AuthorisedStream;
pub use codec::FrameCodec;
pub use connection::{Backoff, ConnectionState, ReconnectPolicy, RecoveryStrategy};
pub use connector::{
    ConnectionHelper, ConstantConnector, ConstantServer, DynamicConnector, DynamicServer,
    SocketTimeouts,
};
pub use message::{Command, ConnectionAddress, Envelope, Message, PathBody, TransferRequest};
pub use messenger::{Messenger, MessengerEvent, MessengerEvents};
pub use request::PendingRequests;
