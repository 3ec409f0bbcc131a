// Centralized error handling for the synchronization core
// Every fallible operation in the library returns `SyncError`

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error taxonomy for the synchronization core.
///
/// Only `Authentication` and `ReconnectExhausted` are fatal to a party;
/// everything else is local to one file, one request or one transfer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Token mismatch or a handshake that did not finish in time.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed frame, malformed JSON or an unknown message type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A socket failed or closed early while moving file bytes.
    #[error("transfer of {name} failed: {reason}")]
    Transfer { name: String, reason: String },

    /// Stat, read or write failure inside the watched tree.
    #[error("filesystem error while {operation} {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// The retry budget ran out while reconnecting.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// An operation did not complete before its deadline.
    #[error("timed out while {0}")]
    Timeout(String),

    /// The party is no longer connected.
    #[error("party is not connected")]
    Disconnected,

    /// The remote peer answered a request with an `error` message.
    #[error("remote peer reported: {0}")]
    Remote(String),

    /// A name that cannot be mapped inside the watched root.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Wrap an io error with the path and operation it came from.
    pub fn filesystem(source: io::Error, operation: &'static str, path: impl Into<PathBuf>) -> Self {
        SyncError::Filesystem {
            path: path.into(),
            operation,
            source,
        }
    }

    pub fn transfer(name: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::Transfer {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error ends the life of the connection it happened on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Authentication(_) | SyncError::ReconnectExhausted { .. }
        )
    }
}
