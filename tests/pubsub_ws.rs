//! Pub/sub round-trip over a real listener with two WebSocket clients.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use taskgate::{Config, Server};
use tokio_tungstenite::tungstenite::Message;

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_server(config: Value) -> std::net::SocketAddr {
    let config: Config = serde_json::from_value(config).unwrap();
    let server = Server::new(config).unwrap();
    let router = server.router().unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn connect(addr: std::net::SocketAddr, path: &str) -> WsClient {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}{}", addr, path))
        .await
        .expect("websocket connect");
    client
}

async fn send_json(client: &mut WsClient, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}

async fn recv_json(client: &mut WsClient) -> Value {
    let deadline = std::time::Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout(deadline, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

fn pubsub_config(group: &str) -> Value {
    json!({
        "endpoints": [{
            "path": "/room",
            "methods": {"GET": {"type": "pubsub", "config": {
                "group": group,
                "websocket_retry_duration": 1
            }}}
        }]
    })
}

#[tokio::test]
async fn publish_reaches_subscriber_in_same_group() {
    let addr = start_server(pubsub_config("shared")).await;

    let mut subscriber = connect(addr, "/room").await;
    send_json(&mut subscriber, json!({"subscribe": {"channel": "room.*"}})).await;
    assert_eq!(recv_json(&mut subscriber).await, json!({"simple": {}}));

    let mut publisher = connect(addr, "/room").await;
    send_json(
        &mut publisher,
        json!({"publish": {"channel": "room.1", "message": "aGVsbG8="}}),
    )
    .await;
    assert_eq!(recv_json(&mut publisher).await, json!({"simple": {}}));

    // delivery frame carries the matched subscription and the payload
    let delivery = recv_json(&mut subscriber).await;
    assert_eq!(delivery["channel"], json!("room.*"));
    assert_eq!(delivery["message"], json!("aGVsbG8="));
}

#[tokio::test]
async fn non_matching_channel_is_not_delivered() {
    let addr = start_server(pubsub_config("filtered")).await;

    let mut subscriber = connect(addr, "/room").await;
    send_json(&mut subscriber, json!({"subscribe": {"channel": "room.*"}})).await;
    recv_json(&mut subscriber).await;

    let mut publisher = connect(addr, "/room").await;
    send_json(
        &mut publisher,
        json!({"publish": {"channel": "lobby", "message": "eA=="}}),
    )
    .await;
    recv_json(&mut publisher).await;

    // then a matching publish; the first delivery is the matching one
    send_json(
        &mut publisher,
        json!({"publish": {"channel": "room.2", "message": "eQ=="}}),
    )
    .await;
    recv_json(&mut publisher).await;

    let delivery = recv_json(&mut subscriber).await;
    assert_eq!(delivery["message"], json!("eQ=="));
}

#[tokio::test]
async fn subscriptions_lists_current_globs() {
    let addr = start_server(pubsub_config("listing")).await;

    let mut client = connect(addr, "/room").await;
    send_json(&mut client, json!({"subscribe": {"channel": ["a.*", "b"]}})).await;
    recv_json(&mut client).await;

    send_json(&mut client, json!({"subscriptions": {}})).await;
    let response = recv_json(&mut client).await;
    let mut channels: Vec<String> = response["subscriptions"]["channels"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    channels.sort();
    assert_eq!(channels, vec!["a.*".to_string(), "b".to_string()]);

    send_json(&mut client, json!({"unsubscribe": {"channel": "b"}})).await;
    recv_json(&mut client).await;

    send_json(&mut client, json!({"subscriptions": {}})).await;
    let response = recv_json(&mut client).await;
    assert_eq!(response["subscriptions"]["channels"], json!(["a.*"]));
}

#[tokio::test]
async fn empty_group_isolates_connections() {
    let addr = start_server(pubsub_config("")).await;

    let mut subscriber = connect(addr, "/room").await;
    send_json(&mut subscriber, json!({"subscribe": {"channel": "c"}})).await;
    recv_json(&mut subscriber).await;

    // second connection lands in its own synthesized group
    let mut publisher = connect(addr, "/room").await;
    send_json(
        &mut publisher,
        json!({"publish": {"channel": "c", "message": "eA=="}}),
    )
    .await;
    recv_json(&mut publisher).await;

    let nothing =
        tokio::time::timeout(std::time::Duration::from_millis(300), subscriber.next()).await;
    assert!(nothing.is_err(), "isolated connection must not receive");
}
