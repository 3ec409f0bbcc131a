// Shared fixtures: containers on temp dirs and engines linked over loopback

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use treesync::fs::{ContainerOptions, FileContainer, PathFilter};
use treesync::net::{
    ConnectionHelper, ConstantConnector, ConstantServer, Messenger, RecoveryStrategy,
    SocketTimeouts,
};
use treesync::sync::{DeleteFlags, Engine, EngineConfig, PartyId};
use treesync::transfer::TransferSettings;

pub const TOKEN: &str = "integration-secret";

pub fn quick_timeouts() -> SocketTimeouts {
    SocketTimeouts {
        connect: Duration::from_secs(2),
        accept: Duration::from_secs(5),
        handshake: Duration::from_secs(2),
    }
}

pub fn container(dir: &Path, block_delay: Duration) -> Arc<FileContainer> {
    let options = ContainerOptions {
        filter: PathFilter::with_defaults(),
        block_delay,
        ..ContainerOptions::default()
    };
    Arc::new(FileContainer::new(dir, options).unwrap())
}

pub fn engine_config(delete: DeleteFlags) -> EngineConfig {
    EngineConfig {
        delete,
        transfer_concurrency: 2,
        transfer: TransferSettings {
            request_timeout: Duration::from_secs(5),
            timeouts: quick_timeouts(),
            transfer_host: None,
        },
        ..EngineConfig::default()
    }
}

pub fn engine(dir: &Path, delete: DeleteFlags) -> Engine {
    engine_with(dir, engine_config(delete))
}

pub fn engine_with(dir: &Path, config: EngineConfig) -> Engine {
    Engine::new(container(dir, Duration::from_millis(50)), config)
}

/// Connect `client` to `hub` and register each side as the other's party.
/// Returns the party id of the hub as seen by the client.
pub async fn link(hub: &Engine, client: &Engine) -> PartyId {
    let server = ConstantServer::bind("127.0.0.1:0", Some(TOKEN.into()), quick_timeouts())
        .await
        .unwrap();
    let connector = ConstantConnector::new(
        server.local_addr().to_string(),
        Some(TOKEN.into()),
        quick_timeouts(),
    );
    let (accepted, dialled) = tokio::join!(server.get_new_socket(), connector.get_new_socket());

    let (hub_side, hub_events) = Messenger::spawn(accepted.unwrap(), RecoveryStrategy::Abort);
    let (client_side, client_events) = Messenger::spawn(dialled.unwrap(), RecoveryStrategy::Abort);
    hub.add_other_party_messenger(hub_side, hub_events, false);
    client.add_other_party_messenger(client_side, client_events, true)
}

pub fn read(dir: &Path, name: &str) -> String {
    std::fs::read_to_string(dir.join(name)).unwrap()
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
