// One-shot transfer sockets and authorisation over loopback

use std::net::{IpAddr, Ipv4Addr};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use treesync::net::{ConnectionAddress, DynamicConnector, DynamicServer};
use treesync::SyncError;

use super::common::quick_timeouts;

fn loopback_server() -> DynamicServer {
    DynamicServer::new(IpAddr::V4(Ipv4Addr::LOCALHOST), "127.0.0.1", quick_timeouts())
}

#[tokio::test]
async fn test_dynamic_server_serves_exactly_one_connection() {
    let server = loopback_server();
    let (tx, rx) = oneshot::channel::<ConnectionAddress>();
    let accepting = tokio::spawn(async move {
        server
            .get_new_socket(move |address| async move {
                let _ = tx.send(address);
                Ok(())
            })
            .await
    });

    let address = rx.await.unwrap();
    assert!(address.token.is_some());
    let dialled = DynamicConnector::new(quick_timeouts())
        .get_new_socket(&address)
        .await;
    assert!(dialled.is_ok());
    assert!(accepting.await.unwrap().is_ok());

    let again = TcpStream::connect((address.remote_host.as_str(), address.remote_port)).await;
    assert!(again.is_err(), "listener outlived its single connection");
}

#[tokio::test]
async fn test_dynamic_server_closes_after_failed_authorisation() {
    let server = loopback_server();
    let (tx, rx) = oneshot::channel::<ConnectionAddress>();
    let accepting = tokio::spawn(async move {
        server
            .get_new_socket(move |address| async move {
                let _ = tx.send(address);
                Ok(())
            })
            .await
    });

    let address = rx.await.unwrap();
    let forged = ConnectionAddress {
        token: Some("forged".into()),
        ..address.clone()
    };
    let dialled = DynamicConnector::new(quick_timeouts())
        .get_new_socket(&forged)
        .await;
    assert!(matches!(dialled, Err(SyncError::Authentication(_))));
    assert!(matches!(
        accepting.await.unwrap(),
        Err(SyncError::Authentication(_))
    ));

    let again = TcpStream::connect((address.remote_host.as_str(), address.remote_port)).await;
    assert!(again.is_err(), "listener survived a failed authorisation");
}
