// Engines talking to each other over real loopback sockets

use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

use treesync::net::{
    Backoff, ConnectionHelper, ConnectionState, ConstantConnector, ConstantServer, Messenger,
    ReconnectPolicy, RecoveryStrategy,
};
use treesync::sync::{DeleteFlags, EngineConfig, SyncStrategy};

use super::common::{
    engine, engine_config, engine_with, eventually, link, quick_timeouts, read, TOKEN,
};

const KEEP: DeleteFlags = DeleteFlags {
    delete_local: false,
    delete_remote: false,
};

#[tokio::test]
async fn test_pull_downloads_differences_and_is_idempotent() {
    let hub_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    for dir in [hub_dir.path(), client_dir.path()] {
        fs::write(dir.join("a.txt"), "alpha").unwrap();
        fs::write(dir.join("b.txt"), "beta").unwrap();
    }
    fs::write(hub_dir.path().join("c.txt"), "hub copy").unwrap();
    fs::write(client_dir.path().join("c.txt"), "client copy").unwrap();
    fs::create_dir(hub_dir.path().join("docs")).unwrap();
    fs::write(hub_dir.path().join("docs/readme.md"), "# hi").unwrap();

    let hub = engine(hub_dir.path(), KEEP);
    let client = engine(client_dir.path(), KEEP);
    let party = link(&hub, &client).await;

    let first = client.run_strategy(party, SyncStrategy::Pull).await.unwrap();
    assert_eq!(first.downloaded, 2);
    assert_eq!(first.created_local_dirs, 1);
    assert_eq!(read(client_dir.path(), "c.txt"), "hub copy");
    assert_eq!(read(client_dir.path(), "docs/readme.md"), "# hi");

    let second = client.run_strategy(party, SyncStrategy::Pull).await.unwrap();
    assert_eq!(second.transferred(), 0);
    assert_eq!(second.created_local_dirs, 0);

    for name in ["a.txt", "b.txt", "c.txt", "docs/readme.md"] {
        assert_eq!(read(hub_dir.path(), name), read(client_dir.path(), name));
    }

    hub.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn test_push_without_delete_flag_keeps_remote_extras() {
    let hub_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    fs::write(hub_dir.path().join("extra.txt"), "only on the hub").unwrap();
    fs::write(client_dir.path().join("mine.txt"), "from the client").unwrap();

    let hub = engine(hub_dir.path(), KEEP);
    let client = engine(client_dir.path(), KEEP);
    let party = link(&hub, &client).await;

    let report = client.run_strategy(party, SyncStrategy::Push).await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.deleted_remote, 0);
    assert!(hub_dir.path().join("extra.txt").exists());
    assert_eq!(read(hub_dir.path(), "mine.txt"), "from the client");

    hub.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn test_push_with_delete_flag_removes_remote_extras() {
    let hub_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    fs::write(hub_dir.path().join("extra.txt"), "only on the hub").unwrap();
    fs::write(client_dir.path().join("mine.txt"), "from the client").unwrap();

    let hub = engine(hub_dir.path(), KEEP);
    let client = engine(
        client_dir.path(),
        DeleteFlags {
            delete_local: false,
            delete_remote: true,
        },
    );
    let party = link(&hub, &client).await;

    let report = client.run_strategy(party, SyncStrategy::Push).await.unwrap();
    assert_eq!(report.deleted_remote, 1);
    assert!(!hub_dir.path().join("extra.txt").exists());
    assert!(hub_dir.path().join("mine.txt").exists());

    hub.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn test_newest_with_equal_timestamps_is_a_conflict() {
    let hub_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    for (dir, content) in [(hub_dir.path(), "hub"), (client_dir.path(), "client")] {
        let path = dir.join("both.txt");
        fs::write(&path, content).unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(stamp)
            .unwrap();
    }

    let hub = engine(hub_dir.path(), KEEP);
    let client = engine(client_dir.path(), KEEP);
    let party = link(&hub, &client).await;

    let report = client.run_strategy(party, SyncStrategy::Newest).await.unwrap();
    assert_eq!(report.conflicts, vec!["both.txt".to_string()]);
    assert_eq!(report.transferred(), 0);
    assert_eq!(read(hub_dir.path(), "both.txt"), "hub");
    assert_eq!(read(client_dir.path(), "both.txt"), "client");

    hub.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn test_local_changes_reach_the_other_party() {
    let hub_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();

    let hub = engine(hub_dir.path(), KEEP);
    let client = engine(client_dir.path(), KEEP);
    hub.start().await.unwrap();
    client.start().await.unwrap();
    link(&hub, &client).await;

    fs::create_dir(client_dir.path().join("notes")).unwrap();
    fs::write(client_dir.path().join("notes/today.txt"), "written by hand").unwrap();

    let hub_path = hub_dir.path().join("notes/today.txt");
    assert!(
        eventually(Duration::from_secs(10), || {
            fs::read_to_string(&hub_path).map_or(false, |c| c == "written by hand")
        })
        .await
    );

    fs::remove_file(client_dir.path().join("notes/today.txt")).unwrap();
    assert!(eventually(Duration::from_secs(10), || !hub_path.exists()).await);

    hub.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn test_hub_relays_to_other_parties() {
    let hub_dir = tempdir().unwrap();
    let left_dir = tempdir().unwrap();
    let right_dir = tempdir().unwrap();

    let hub = engine(hub_dir.path(), KEEP);
    let left = engine(left_dir.path(), KEEP);
    let right = engine(right_dir.path(), KEEP);
    for node in [&hub, &left, &right] {
        node.start().await.unwrap();
    }
    link(&hub, &left).await;
    link(&hub, &right).await;
    assert_eq!(hub.parties().len(), 2);

    fs::write(left_dir.path().join("shared.txt"), "hello from the left").unwrap();

    let right_path = right_dir.path().join("shared.txt");
    assert!(
        eventually(Duration::from_secs(10), || {
            fs::read_to_string(&right_path).map_or(false, |c| c == "hello from the left")
        })
        .await
    );
    assert_eq!(read(hub_dir.path(), "shared.txt"), "hello from the left");

    for node in [&hub, &left, &right] {
        node.shutdown();
    }
}

#[tokio::test]
async fn test_dead_party_is_forgotten() {
    let hub_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();

    let hub = engine(hub_dir.path(), KEEP);
    let client = engine(client_dir.path(), KEEP);
    let party = link(&hub, &client).await;
    assert_eq!(client.parties(), vec![party]);
    assert!(eventually(Duration::from_secs(2), || hub.parties().len() == 1).await);

    client.shutdown();
    assert!(client.parties().is_empty());
    assert!(eventually(Duration::from_secs(5), || hub.parties().is_empty()).await);

    hub.shutdown();
}

#[tokio::test]
async fn test_push_result_is_on_disk_when_the_push_returns() {
    let hub_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();
    let payload = "x".repeat(512 * 1024);
    fs::write(client_dir.path().join("large.txt"), &payload).unwrap();
    fs::write(hub_dir.path().join("large.txt"), "stale").unwrap();

    let hub = engine(hub_dir.path(), KEEP);
    let client = engine(client_dir.path(), KEEP);
    let party = link(&hub, &client).await;

    let report = client.run_strategy(party, SyncStrategy::Push).await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(read(hub_dir.path(), "large.txt"), payload);

    hub.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn test_reconnection_runs_the_reconnection_strategy() {
    let hub_dir = tempdir().unwrap();
    let client_dir = tempdir().unwrap();

    let hub = engine(hub_dir.path(), KEEP);
    let client = engine_with(
        client_dir.path(),
        EngineConfig {
            on_reconnection: SyncStrategy::Pull,
            ..engine_config(KEEP)
        },
    );

    let server = ConstantServer::bind("127.0.0.1:0", Some(TOKEN.into()), quick_timeouts())
        .await
        .unwrap();
    let connector = Arc::new(ConstantConnector::new(
        server.local_addr().to_string(),
        Some(TOKEN.into()),
        quick_timeouts(),
    ));
    let mut incoming = server.incoming();

    let (accepted, dialled) = tokio::join!(incoming.recv(), connector.get_new_socket());
    let (hub_side, hub_events) = Messenger::spawn(accepted.unwrap(), RecoveryStrategy::Abort);
    hub.add_other_party_messenger(hub_side.clone(), hub_events, false);

    let (client_side, client_events) = Messenger::spawn(
        dialled.unwrap(),
        RecoveryStrategy::ReconnectToRemote {
            helper: connector.clone(),
            policy: ReconnectPolicy {
                max_attempts: Some(20),
                interval: Duration::from_millis(50),
                backoff: Backoff::Fixed,
            },
        },
    );
    let mut client_state = client_side.subscribe_state();
    let party = client.add_other_party_messenger(client_side, client_events, true);

    fs::write(hub_dir.path().join("while-away.txt"), "written on the hub").unwrap();
    hub_side.disconnect();

    let redialled = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    let (hub_side, hub_events) = Messenger::spawn(redialled, RecoveryStrategy::Abort);
    hub.add_other_party_messenger(hub_side, hub_events, false);

    let client_path = client_dir.path().join("while-away.txt");
    assert!(
        eventually(Duration::from_secs(10), || {
            fs::read_to_string(&client_path).map_or(false, |c| c == "written on the hub")
        })
        .await
    );
    assert_eq!(*client_state.borrow_and_update(), ConnectionState::Connected);
    assert_eq!(client.parties(), vec![party]);

    hub.shutdown();
    client.shutdown();
}
