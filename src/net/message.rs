//! Control protocol messages.
//!
//! On the wire every message is an [`Envelope`] `{type, body?, id?}`. Inside
//! the crate messages are the closed [`Command`] union, so every handler is
//! checked for exhaustiveness by the compiler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::transfer::actions::TransferAction;

/// Wire shape of a control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Body of every command that names a single path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathBody {
    pub name: String,
}

impl PathBody {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Where a peer should dial to reach a one-shot transfer socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAddress {
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Negotiation of one file transfer. `action` is what the receiving peer
/// should do; `address` is present when that action is a connect variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub action: TransferAction,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<ConnectionAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

/// Every message kind understood by the control protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum Command {
    CreateDirectory(PathBody),
    DeletePath(PathBody),
    DownloadChanged(PathBody),
    DownloadNew(PathBody),
    GetMetaForFile(PathBody),
    GetFileList,
    Transfer(TransferRequest),
    Response(Value),
    Error(ErrorBody),
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateDirectory(_) => "createDirectory",
            Command::DeletePath(_) => "deletePath",
            Command::DownloadChanged(_) => "downloadChanged",
            Command::DownloadNew(_) => "downloadNew",
            Command::GetMetaForFile(_) => "getMetaForFile",
            Command::GetFileList => "getFileList",
            Command::Transfer(_) => "transfer",
            Command::Response(_) => "response",
            Command::Error(_) => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Command::Error(ErrorBody {
            message: message.into(),
        })
    }
}

/// A command plus its optional correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub command: Command,
    pub id: Option<String>,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self { command, id: None }
    }

    pub fn with_id(command: Command, id: impl Into<String>) -> Self {
        Self {
            command,
            id: Some(id.into()),
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope> {
        let mut envelope: Envelope = serde_json::from_value(serde_json::to_value(&self.command)?)?;
        envelope.id = self.id.clone();
        Ok(envelope)
    }

    /// Decode an envelope. Unknown kinds and malformed bodies are protocol
    /// errors.
    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let id = envelope.id;
        let mut tagged = serde_json::Map::new();
        tagged.insert("type".into(), Value::String(envelope.kind.clone()));
        match envelope.body {
            Some(body) => {
                tagged.insert("body".into(), body);
            }
            None if envelope.kind == "response" => {
                tagged.insert("body".into(), Value::Null);
            }
            None => {}
        }
        let command = serde_json::from_value(Value::Object(tagged)).map_err(|e| {
            SyncError::Protocol(format!("bad {:?} message: {}", envelope.kind, e))
        })?;
        Ok(Self { command, id })
    }

    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        Ok(crate::net::codec::to_payload(&self.to_envelope()?)?)
    }
}

/// First message from the initiating side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "handshake")]
pub struct HandshakeRequest {
    pub token: String,
}

/// Reply from the accepting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "handshake")]
pub struct HandshakeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
