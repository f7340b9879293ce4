use std::sync::Arc;
use std::time::Duration;

use meshsub::broker::Broker;
use meshsub::config::Settings;
use meshsub::control::WsControlClient;
use meshsub::transport::BrokerServer;
use meshsub::{Callback, Dispatcher, Message, Protocol, QoS};
use parking_lot::Mutex;
use tokio::sync::mpsc;

async fn start_broker() -> u16 {
    let broker = Arc::new(Mutex::new(Broker::in_memory().unwrap()));
    let server = BrokerServer::bind("127.0.0.1:0", broker).await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.serve());
    port
}

async fn join(id: &str, broker_port: u16) -> Dispatcher {
    let mut settings = Settings::default();
    settings.node.id = id.to_string();
    settings.node.host = "127.0.0.1".to_string();
    let control = Arc::new(WsControlClient::new(id));
    let node = Dispatcher::new(&settings, control);
    node.connect("127.0.0.1", broker_port).await.unwrap();
    node
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..150 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn peers_exchange_frames_through_a_websocket_broker() {
    let broker_port = start_broker().await;
    let camera = join("camera", broker_port).await;
    let display = join("display", broker_port).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let callback: Callback = Arc::new(move |msg: &Message| {
        let _ = tx.send(msg.clone());
    });
    display
        .subscribe("video/main", callback, Protocol::PeerRtc.into(), QoS::AtMostOnce)
        .await
        .unwrap();

    eventually(|| !camera.routes("video/main").is_empty()).await;
    camera
        .publish(
            "video/main",
            &[0x01, 0x02, 0x03],
            Protocol::PeerRtc.into(),
            QoS::AtMostOnce,
            false,
        )
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("frame did not arrive")
        .unwrap();
    assert_eq!(msg.payload, vec![0x01u8, 0x02, 0x03]);
    assert_eq!(msg.protocol, Protocol::PeerRtc);

    display.disconnect().await.unwrap();
    eventually(|| camera.routes("video/main").is_empty()).await;
    camera.disconnect().await.unwrap();
}
