//! Wires a container, an engine and the control sockets into one running
//! node.

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, Mode};
use crate::fs::FileContainer;
use crate::net::connection::reconnect;
use crate::net::{
    AuthorisedStream, ConnectionHelper, ConnectionState, ConstantConnector, ConstantServer,
    Messenger, RecoveryStrategy,
};
use crate::sync::Engine;

/// How long a listening node keeps a dropped party around for it to dial
/// back in.
const RECONNECT_GRACE: Duration = Duration::from_secs(60);

/// Run a node until Ctrl-C, or until a connecting node loses its party for
/// good.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let directory = config
        .directory
        .clone()
        .context("no directory to sync was given")?;
    let options = config
        .container_options(&directory)
        .context("Failed to build path filter")?;
    let container = FileContainer::new(&directory, options)
        .with_context(|| format!("Failed to open directory: {}", directory.display()))?;

    let engine = Engine::new(Arc::new(container), config.engine_config());
    if config.watch {
        engine.start().await.context("Failed to start watching")?;
    }
    info!(
        directory = %engine.container().root().display(),
        mode = ?config.mode,
        strategy = %config.strategy,
        "node started"
    );

    let result = match config.mode {
        Mode::Listen => serve(&engine, &config).await,
        Mode::Connect => connect(&engine, &config).await,
    };
    engine.shutdown();
    result
}

async fn serve(engine: &Engine, config: &Config) -> anyhow::Result<()> {
    let address = config.address();
    let server = ConstantServer::bind(&address, config.token.clone(), config.socket_timeouts())
        .await
        .with_context(|| format!("Failed to listen on {}", address))?;

    let mut incoming = server.incoming();

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        let stream = tokio::select! {
            _ = &mut interrupted => {
                info!("interrupted");
                return Ok(());
            }
            stream = incoming.recv() => stream,
        };
        match stream {
            Some(stream) => admit(engine, stream),
            None => bail!("stopped accepting connections on {}", address),
        }
    }
}

/// Give an inbound socket to a party waiting for one, or start a new party.
fn admit(engine: &Engine, mut stream: AuthorisedStream) {
    for id in engine.parties() {
        let Some(messenger) = engine.messenger(id) else {
            continue;
        };
        if messenger.state() != ConnectionState::Disconnected {
            continue;
        }
        match messenger.attach(stream) {
            Ok(()) => {
                info!(party = %id, "party dialled back in");
                return;
            }
            Err(returned) => stream = returned,
        }
    }

    let (messenger, events) = Messenger::spawn(
        stream,
        RecoveryStrategy::ListenForReconnection {
            give_up_after: Some(RECONNECT_GRACE),
        },
    );
    engine.add_other_party_messenger(messenger, events, false);
}

async fn connect(engine: &Engine, config: &Config) -> anyhow::Result<()> {
    let connector = Arc::new(ConstantConnector::new(
        config.address(),
        config.token.clone(),
        config.socket_timeouts(),
    ));
    let policy = config.reconnect_policy();

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    let cancel = CancellationToken::new();
    let first = tokio::select! {
        _ = &mut interrupted => {
            info!("interrupted");
            return Ok(());
        }
        stream = first_socket(connector.as_ref(), &policy, &cancel) => stream,
    };
    let stream = first.with_context(|| format!("Failed to connect to {}", connector.addr()))?;

    let (messenger, events) = Messenger::spawn(
        stream,
        RecoveryStrategy::ReconnectToRemote {
            helper: connector.clone(),
            policy,
        },
    );
    let mut state = messenger.subscribe_state();
    let id = engine.add_other_party_messenger(messenger, events, true);
    info!(party = %id, addr = connector.addr(), "connected");

    loop {
        tokio::select! {
            _ = &mut interrupted => {
                info!("interrupted");
                return Ok(());
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Dead {
                    bail!("lost the connection to {}", connector.addr());
                }
            }
        }
    }
}

async fn first_socket(
    connector: &ConstantConnector,
    policy: &crate::net::ReconnectPolicy,
    cancel: &CancellationToken,
) -> crate::Result<AuthorisedStream> {
    match connector.get_new_socket().await {
        Ok(stream) => Ok(stream),
        Err(e) if e.is_connection_fatal() => Err(e),
        Err(e) => {
            warn!(addr = connector.addr(), error = %e, "first connection failed, retrying");
            reconnect(connector, policy, cancel).await
        }
    }
}
