use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;

use super::BrokerServer;
use super::message::{ClientFrame, ServerFrame};
use crate::broker::Broker;
use crate::broker::message::Message;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> String {
    let broker = Arc::new(Mutex::new(Broker::in_memory().unwrap()));
    let server = BrokerServer::bind("127.0.0.1:0", broker).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    format!("ws://{addr}/")
}

async fn send(ws: &mut Ws, value: serde_json::Value) {
    ws.send(WsMessage::text(value.to_string())).await.unwrap();
}

async fn next_frame(ws: &mut Ws) -> ServerFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .unwrap();
        if let WsMessage::Text(text) = msg {
            return ServerFrame::from_json(text.as_str()).unwrap();
        }
    }
}

async fn connect_client(url: &str, id: &str, will: Option<serde_json::Value>) -> Ws {
    let (mut ws, _) = connect_async(url).await.unwrap();
    let mut frame = json!({ "type": "connect", "client_id": id });
    if let Some(will) = will {
        frame["will"] = will;
    }
    send(&mut ws, frame).await;
    assert_eq!(
        next_frame(&mut ws).await,
        ServerFrame::ConnAck {
            client_id: id.to_string()
        }
    );
    ws
}

#[test]
fn test_client_frames_are_tagged() {
    let frame = ClientFrame::from_json(r#"{"type":"subscribe","filter":"a/+"}"#).unwrap();
    assert_eq!(
        frame,
        ClientFrame::Subscribe {
            filter: "a/+".into(),
            qos: Default::default()
        }
    );

    let publish = ClientFrame::Publish(Message::new("t", b"hi".to_vec()));
    let value: serde_json::Value = serde_json::from_str(&publish.to_json().unwrap()).unwrap();
    assert_eq!(value["type"], "publish");
    assert_eq!(value["topic"], "t");

    assert!(ClientFrame::from_json(r#"{"type":"login"}"#).is_err());
}

#[tokio::test]
async fn test_publish_reaches_subscriber() {
    let url = start_server().await;
    let mut sub = connect_client(&url, "sub", None).await;
    let mut publisher = connect_client(&url, "pub", None).await;

    send(&mut sub, json!({ "type": "subscribe", "filter": "chat/+" })).await;
    send(&mut sub, json!({ "type": "subscribe", "filter": "sync" })).await;

    // Subscriptions from one connection apply in order, so once `sync`
    // arrives `chat/+` is registered too.
    let mut synced = false;
    for _ in 0..50 {
        send(&mut publisher, json!({ "type": "publish", "topic": "sync", "payload": [] })).await;
        if tokio::time::timeout(Duration::from_millis(100), next_frame(&mut sub))
            .await
            .is_ok()
        {
            synced = true;
            break;
        }
    }
    assert!(synced);

    send(
        &mut publisher,
        json!({ "type": "publish", "topic": "chat/room", "payload": [104, 105] }),
    )
    .await;

    loop {
        match next_frame(&mut sub).await {
            ServerFrame::Deliver(msg) if msg.topic == "sync" => continue,
            ServerFrame::Deliver(msg) => {
                assert_eq!(msg.topic, "chat/room");
                assert_eq!(msg.payload, b"hi");
                break;
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_frame_before_connect_is_rejected() {
    let url = start_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send(&mut ws, json!({ "type": "subscribe", "filter": "x" })).await;
    assert!(matches!(next_frame(&mut ws).await, ServerFrame::Error { .. }));
}

#[tokio::test]
async fn test_will_sent_when_connection_drops() {
    let url = start_server().await;
    let mut watcher = connect_client(&url, "watcher", None).await;
    send(&mut watcher, json!({ "type": "subscribe", "filter": "/d/+" })).await;

    let will = json!({ "topic": "/d/crashy", "payload": [1, 2], "retain": false });
    let crashy = connect_client(&url, "crashy", Some(will)).await;
    drop(crashy);

    match next_frame(&mut watcher).await {
        ServerFrame::Deliver(msg) => {
            assert_eq!(msg.topic, "/d/crashy");
            assert_eq!(msg.payload, vec![1u8, 2]);
        }
        other => panic!("expected will, got {other:?}"),
    }
}

#[tokio::test]
async fn test_retained_delivered_on_subscribe() {
    let url = start_server().await;
    let mut publisher = connect_client(&url, "pub", None).await;
    send(
        &mut publisher,
        json!({ "type": "publish", "topic": "/d/a", "payload": [5], "retain": true }),
    )
    .await;
    send(&mut publisher, json!({ "type": "disconnect" })).await;

    let mut late = connect_client(&url, "late", None).await;
    // The retained publish may still be in flight; poll until it lands.
    let mut got = None;
    for _ in 0..50 {
        send(&mut late, json!({ "type": "subscribe", "filter": "/d/+" })).await;
        if let Ok(frame) = tokio::time::timeout(Duration::from_millis(100), next_frame(&mut late)).await {
            got = Some(frame);
            break;
        }
    }
    match got {
        Some(ServerFrame::Deliver(msg)) => {
            assert!(msg.retain);
            assert_eq!(msg.payload, vec![5u8]);
        }
        other => panic!("expected retained delivery, got {other:?}"),
    }
}
