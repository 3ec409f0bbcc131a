// Watcher feedback suppression on a real directory

use std::time::Duration;
use tempfile::tempdir;
use tokio::time::timeout;

use treesync::fs::ContainerEvent;

use super::common::container;

#[tokio::test]
async fn test_own_writes_are_not_reported() {
    let dir = tempdir().unwrap();
    let files = container(dir.path(), Duration::from_millis(300));
    let mut events = files.begin_watching().await.unwrap();

    let mut payload: &[u8] = b"received from a party";
    files
        .consume_file_stream("inbox/report.txt", &mut payload)
        .await
        .unwrap();

    let quiet = timeout(Duration::from_millis(250), events.recv()).await;
    assert!(quiet.is_err(), "self-initiated write was reported: {:?}", quiet);

    // Once the block has lapsed, a manual edit is reported again.
    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::write(dir.path().join("inbox/report.txt"), "edited by hand").unwrap();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("manual edit was not reported")
        .unwrap();
    assert!(
        matches!(
            &event,
            ContainerEvent::Changed(name) | ContainerEvent::FileCreated(name) if name == "inbox/report.txt"
        ),
        "unexpected event {:?}",
        event
    );

    files.stop_watching();
}

#[tokio::test]
async fn test_own_deletes_hide_the_subtree() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("old/nested")).unwrap();
    std::fs::write(dir.path().join("old/nested/a.txt"), "a").unwrap();
    let files = container(dir.path(), Duration::from_millis(300));
    let mut events = files.begin_watching().await.unwrap();

    files.delete_file("old").await.unwrap();
    assert!(!dir.path().join("old").exists());

    let quiet = timeout(Duration::from_millis(250), events.recv()).await;
    assert!(quiet.is_err(), "self-initiated delete was reported: {:?}", quiet);

    files.stop_watching();
}

#[tokio::test]
async fn test_manual_changes_are_classified() {
    let dir = tempdir().unwrap();
    let files = container(dir.path(), Duration::from_millis(50));
    let mut events = files.begin_watching().await.unwrap();

    std::fs::create_dir(dir.path().join("fresh")).unwrap();
    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ContainerEvent::CreatedDirectory("fresh".into()));

    std::fs::remove_dir(dir.path().join("fresh")).unwrap();
    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ContainerEvent::Deleted("fresh".into()));

    files.stop_watching();
}
