//! Unix socket transport end to end: framed request/reply over a real
//! socket, per-connection reply ordering, subscription streaming and
//! the advertisement stream observed by a wire subscriber.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use foris_core::files::FileStore;
use foris_core::message::{Message, MessageKind};
use foris_daemon::advertize::Advertizer;
use foris_daemon::state::MOCK_CONTROLLER_ID;
use foris_daemon::transports::unix_socket;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;

struct RunningServer {
    path: PathBuf,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    daemon: common::MockDaemon,
}

async fn start_server() -> RunningServer {
    let daemon = common::mock_daemon();
    let path = daemon.sandbox.path().join("daemon.sock");
    let (shutdown, shutdown_rx) = watch::channel(false);
    let registry = Arc::clone(&daemon.registry);
    let serve_path = path.clone();
    let handle =
        tokio::spawn(async move { unix_socket::serve(&serve_path, registry, shutdown_rx).await });
    // Wait for the bind to land.
    for _ in 0..100 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    RunningServer {
        path,
        shutdown,
        handle,
        daemon,
    }
}

#[tokio::test]
async fn request_reply_over_the_wire() {
    let server = start_server().await;
    let reply = unix_socket::client_request(
        &server.path,
        &Message::request("web", "set_language", Some(json!({"language": "de"}))),
    )
    .await
    .expect("wire request failed");
    assert_eq!(reply.kind, MessageKind::Reply);
    assert_eq!(reply.data, Some(json!({"result": true})));

    let follow_up = unix_socket::client_request(
        &server.path,
        &Message::request("web", "get_data", None),
    )
    .await
    .unwrap();
    assert_eq!(follow_up.data, Some(json!({"language": "de"})));

    server.shutdown.send(true).unwrap();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn replies_come_back_in_request_order_on_one_connection() {
    let server = start_server().await;
    let stream = tokio::net::UnixStream::connect(&server.path).await.unwrap();
    let mut framed = tokio_util::codec::Framed::new(
        stream,
        tokio_util::codec::LengthDelimitedCodec::new(),
    );
    use futures::SinkExt;
    let actions = ["get_data", "list_languages", "get_data"];
    for action in actions {
        framed
            .send(bytes::Bytes::from(
                Message::request("web", action, None).to_vec().unwrap(),
            ))
            .await
            .unwrap();
    }
    for action in actions {
        let frame = tokio::time::timeout(Duration::from_secs(5), framed.next())
            .await
            .expect("reply timed out")
            .unwrap()
            .unwrap();
        let reply = Message::from_slice(&frame).unwrap();
        assert_eq!(reply.action, action);
    }
    server.shutdown.send(true).unwrap();
    let _ = server.handle.await;
}

#[tokio::test]
async fn subscription_connection_streams_matching_notifications() {
    let server = start_server().await;
    let mut subscription = unix_socket::client_subscribe(
        &server.path,
        &json!({"subscription": [{"module": "web", "action": "set_language"}]}),
    )
    .await
    .unwrap();
    // Give the server a beat to register the hub subscription.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A non-matching mutation first; it must not reach this subscriber.
    unix_socket::client_request(
        &server.path,
        &Message::request(
            "dns",
            "update_settings",
            Some(json!({
                "forwarding_enabled": false,
                "dnssec_enabled": false,
                "dns_from_dhcp_enabled": false,
            })),
        ),
    )
    .await
    .unwrap();
    unix_socket::client_request(
        &server.path,
        &Message::request("web", "set_language", Some(json!({"language": "cs"}))),
    )
    .await
    .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("notification timed out")
        .unwrap()
        .unwrap();
    let notification = Message::from_slice(&frame).unwrap();
    assert_eq!(notification.kind, MessageKind::Notification);
    assert_eq!(notification.module, "web");
    assert_eq!(notification.data, Some(json!({"language": "cs"})));

    server.shutdown.send(true).unwrap();
    let _ = server.handle.await;
}

#[tokio::test]
async fn advertisements_reach_wire_subscribers_within_three_periods() {
    let server = start_server().await;
    let mut subscription = unix_socket::client_subscribe(
        &server.path,
        &json!({"subscription": [{"module": "remote", "action": "advertize"}]}),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (adv_shutdown, adv_rx) = watch::channel(false);
    let advertizer = Advertizer::new(
        Arc::clone(&server.daemon.registry),
        FileStore::new(),
        MOCK_CONTROLLER_ID.to_string(),
    )
    .spawn(adv_rx);

    let frame = tokio::time::timeout(
        3 * foris_daemon::advertize::ADVERTIZE_PERIOD,
        subscription.next(),
    )
    .await
    .expect("no advertisement within three periods")
    .unwrap()
    .unwrap();
    let advertisement = Message::from_slice(&frame).unwrap();
    let data = advertisement.data.unwrap();
    assert!(matches!(
        data["state"].as_str(),
        Some("started" | "running")
    ));
    assert_eq!(data["id"], MOCK_CONTROLLER_ID);
    assert!(data["hostname"].is_string());
    assert!(!data["modules"].as_array().unwrap().is_empty());

    adv_shutdown.send(true).unwrap();
    let _ = advertizer.await;
    server.shutdown.send(true).unwrap();
    let _ = server.handle.await;
}
