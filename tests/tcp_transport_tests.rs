//! The hub served over TCP: client transport, broadcasts and line isolation

use std::net::SocketAddr;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use soda_hub::client::{ClaimOptions, CoordinationClient, Transition};
use soda_hub::config::HubConfig;
use soda_hub::hub::{start_hub, EventKind, HubError, HubEvent, HubServer};

async fn serve() -> SocketAddr {
    let (hub, _task) = start_hub(&HubConfig::default()).unwrap();
    let server = HubServer::bind("127.0.0.1:0", hub).await.unwrap();
    let address = server.local_addr().unwrap();
    tokio::spawn(server.run());
    address
}

#[tokio::test]
async fn test_claims_are_arbitrated_across_sockets() {
    let address = serve().await.to_string();
    let dev_a = CoordinationClient::connect_tcp(&address).await.unwrap();
    let dev_b = CoordinationClient::connect_tcp(&address).await.unwrap();

    dev_a
        .claim_work("10.1", "dev-A", ClaimOptions::in_epic("10"))
        .await
        .unwrap();
    let err = dev_b
        .claim_work("10.1", "dev-B", ClaimOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        HubError::ClaimConflict {
            item_id: "10.1".to_string(),
            held_by: "dev-A".to_string(),
        }
    );

    dev_a.release_work("10.1", "dev-A").await.unwrap();
    let item = dev_b
        .claim_work("10.1", "dev-B", ClaimOptions::default())
        .await
        .unwrap();
    assert_eq!(item.claimed_by.as_deref(), Some("dev-B"));
}

#[tokio::test]
async fn test_broadcasts_arrive_as_event_frames() {
    let address = serve().await.to_string();
    let developer = CoordinationClient::connect_tcp(&address).await.unwrap();
    developer
        .claim_identity("dev-1", "developer", "shop")
        .await
        .unwrap();
    let reviewer = CoordinationClient::connect_tcp(&address).await.unwrap();
    reviewer
        .subscribe_workflow("shop", "reviewer", "rev-1", None)
        .await
        .unwrap();

    developer
        .publish_transition(Transition::new("3.1", "in progress", "ready for review", "dev-1", "developer"))
        .await
        .unwrap();

    let first = reviewer.next_event().await.unwrap();
    assert_eq!(first.kind(), EventKind::Transition);
    let second = reviewer.next_event().await.unwrap();
    let HubEvent::ReviewRequested(notice) = second else {
        panic!("expected a review request, got {second:?}");
    };
    assert_eq!(notice.item_id, "3.1");
    assert_eq!(notice.actor, "dev-1");
}

#[tokio::test]
async fn test_malformed_lines_do_not_close_the_connection() {
    let address = serve().await;
    let stream = TcpStream::connect(address).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"this is not json\n").await.unwrap();
    let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply["type"], "response");
    assert!(reply["id"].is_null());
    assert_eq!(reply["result"]["Err"]["error"], "malformed_request");

    writer
        .write_all(b"{\"id\":4,\"request\":{\"op\":\"teleport\"}}\n")
        .await
        .unwrap();
    let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply["id"], 4);
    assert_eq!(reply["result"]["Err"]["error"], "malformed_request");

    writer
        .write_all(b"{\"id\":5,\"request\":{\"op\":\"list_available\"}}\n")
        .await
        .unwrap();
    let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply["id"], 5);
    assert_eq!(reply["result"]["Ok"]["reply"], "items");
    assert_eq!(reply["result"]["Ok"]["items"], Value::Array(Vec::new()));
}

#[tokio::test]
async fn test_closing_a_socket_frees_its_identity() {
    let address = serve().await.to_string();
    let first = CoordinationClient::connect_tcp(&address).await.unwrap();
    first.claim_identity("alice", "developer", "shop").await.unwrap();

    let second = CoordinationClient::connect_tcp(&address).await.unwrap();
    assert!(matches!(
        second.claim_identity("alice", "developer", "shop").await,
        Err(HubError::NameTaken { .. })
    ));

    first.disconnect().await;
    let mut reclaimed = false;
    for _ in 0..100 {
        if second.claim_identity("alice", "developer", "shop").await.is_ok() {
            reclaimed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(reclaimed, "identity should be released once the socket closes");
}
