//! Connection lifecycle and what to do when a socket goes away.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::net::auth::AuthorisedStream;
use crate::net::connector::ConnectionHelper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; waiting for one to be attached.
    Disconnected,
    /// Actively redialling.
    Connecting,
    Connected,
    /// Terminal.
    Dead,
}

impl ConnectionState {
    pub fn is_alive(self) -> bool {
        self == ConnectionState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    /// Double the interval after every failure, up to `max`.
    Exponential { max: Duration },
}

/// Retry budget for redialling.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub interval: Duration,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            interval: Duration::from_secs(1),
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before the zero-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max } => {
                let factor = 2u32.saturating_pow(attempt.min(31));
                self.interval.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Reaction to a lost socket.
#[derive(Clone)]
pub enum RecoveryStrategy {
    /// Die immediately.
    Abort,
    /// Redial through `helper` until it succeeds or the policy gives up.
    ReconnectToRemote {
        helper: Arc<dyn ConnectionHelper>,
        policy: ReconnectPolicy,
    },
    /// Wait for a new socket to be attached from outside.
    ListenForReconnection { give_up_after: Option<Duration> },
}

impl fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStrategy::Abort => write!(f, "Abort"),
            RecoveryStrategy::ReconnectToRemote { policy, .. } => f
                .debug_struct("ReconnectToRemote")
                .field("policy", policy)
                .finish_non_exhaustive(),
            RecoveryStrategy::ListenForReconnection { give_up_after } => f
                .debug_struct("ListenForReconnection")
                .field("give_up_after", give_up_after)
                .finish(),
        }
    }
}

/// Redial until a socket is obtained, the budget runs out, or `cancel` fires.
pub(crate) async fn reconnect(
    helper: &dyn ConnectionHelper,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
) -> Result<AuthorisedStream> {
    let mut attempt = 0u32;
    loop {
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(SyncError::ReconnectExhausted { attempts: attempt });
        }
        let delay = policy.delay_for(attempt);
        attempt += 1;

        tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Disconnected),
            _ = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Disconnected),
            result = helper.get_new_socket() => result,
        };
        match result {
            Ok(stream) => {
                info!(attempt, "reconnected");
                return Ok(stream);
            }
            Err(e) if e.is_connection_fatal() => return Err(e),
            Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
        }
    }
}
