use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::{Callback, Dispatcher, DispatcherConfig, Message, NodeEvent};
use crate::broker::Broker;
use crate::config::Settings;
use crate::control::LocalControlClient;
use crate::direct::{DirectTransport, PayloadSink};
use crate::protocol::{Protocol, ProtocolSet, QoS};
use crate::signaling::FrameMeta;
use crate::{Error, Result};

type SharedBroker = Arc<Mutex<Broker>>;

fn shared_broker() -> SharedBroker {
    Arc::new(Mutex::new(Broker::in_memory().unwrap()))
}

fn config(id: &str) -> DispatcherConfig {
    let mut settings = Settings::default();
    settings.node.id = id.to_string();
    settings.node.host = "127.0.0.1".to_string();
    settings.signaling.handshake_timeout_ms = 2_000;
    DispatcherConfig::from(&settings)
}

async fn node(broker: &SharedBroker, id: &str) -> Dispatcher {
    let control = Arc::new(LocalControlClient::new(id, broker.clone()));
    let dispatcher = Dispatcher::builder(config(id), control).build();
    dispatcher.connect("in-process", 0).await.unwrap();
    dispatcher
}

fn counter() -> (Callback, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let callback: Callback = Arc::new(move |_: &Message| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (callback, count)
}

fn forwarding() -> (Callback, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let callback: Callback = Arc::new(move |msg: &Message| {
        let _ = tx.send(msg.clone());
    });
    (callback, rx)
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..150 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("callback dropped")
}

async fn next_event(
    events: &mut broadcast::Receiver<NodeEvent>,
    wanted: impl Fn(&NodeEvent) -> bool,
) -> NodeEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(String, u16, String, Vec<u8>)>>,
}

#[async_trait]
impl DirectTransport for RecordingTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Stream
    }

    async fn listen(&self, _topic: &str, _sink: PayloadSink) -> Result<u16> {
        Ok(7000)
    }

    async fn send(&self, host: &str, port: u16, topic: &str, payload: &[u8]) -> Result<()> {
        self.sent
            .lock()
            .push((host.to_string(), port, topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn unlisten(&self, _port: u16) {}
}

async fn recording_node(
    broker: &SharedBroker,
    id: &str,
) -> (Dispatcher, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let control = Arc::new(LocalControlClient::new(id, broker.clone()));
    let dispatcher = Dispatcher::builder(config(id), control)
        .transport(transport.clone())
        .build();
    dispatcher.connect("in-process", 0).await.unwrap();
    (dispatcher, transport)
}

#[tokio::test]
async fn test_invalid_arguments_are_rejected() {
    let broker = shared_broker();
    let node = node(&broker, "n1").await;
    let broker_only = ProtocolSet::from(Protocol::Broker);
    let (callback, _) = counter();

    let invalid = |r: Result<()>| matches!(r, Err(Error::InvalidArgument(_)));
    assert!(invalid(node.publish("", b"x", broker_only, QoS::AtMostOnce, false).await));
    assert!(invalid(
        node.publish("t", b"x", ProtocolSet::empty(), QoS::AtMostOnce, false)
            .await
    ));
    assert!(invalid(
        node.subscribe("", callback.clone(), broker_only, QoS::AtMostOnce).await
    ));
    assert!(invalid(
        node.subscribe("t", callback.clone(), ProtocolSet::empty(), QoS::AtMostOnce)
            .await
    ));
    assert!(invalid(
        node.subscribe("host", callback.clone(), broker_only, QoS::AtMostOnce)
            .await
    ));
    assert!(invalid(
        node.subscribe("/meshsub/discovery/n2", callback.clone(), broker_only, QoS::AtMostOnce)
            .await
    ));
    assert!(invalid(
        node.subscribe(
            "t",
            callback,
            ProtocolSet::from(Protocol::SecureStream),
            QoS::AtMostOnce
        )
        .await
    ));
    assert!(invalid(node.unsubscribe("").await));
    assert!(node.subscriptions().is_empty());
}

#[tokio::test]
async fn test_publish_without_routes_is_a_no_op() {
    let broker = shared_broker();
    let (node, transport) = recording_node(&broker, "n1").await;

    let all: ProtocolSet = Protocol::ALL.into_iter().collect();
    node.publish("nobody/listens", b"x", all, QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert!(transport.sent.lock().is_empty());
}

#[tokio::test]
async fn test_publish_only_uses_requested_protocols() {
    let broker = shared_broker();
    let (node, transport) = recording_node(&broker, "n1").await;
    let table = node.routing_table();
    table.upsert("logs", "10.0.0.2", 5000, Protocol::Stream);
    table.upsert("logs", "10.0.0.3", 5001, Protocol::Stream);
    table.upsert("logs", "10.0.0.4", 5002, Protocol::SecureStream);

    node.publish(
        "logs",
        b"x",
        ProtocolSet::from(Protocol::Datagram),
        QoS::AtMostOnce,
        false,
    )
    .await
    .unwrap();
    assert!(transport.sent.lock().is_empty());

    let set: ProtocolSet = [Protocol::Stream, Protocol::SecureStream].into_iter().collect();
    node.publish("logs", b"x", set, QoS::AtMostOnce, false)
        .await
        .unwrap();
    let sent = transport.sent.lock().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], ("10.0.0.2".to_string(), 5000, "logs".to_string(), b"x".to_vec()));
    assert_eq!(sent[1].0, "10.0.0.3");
}

#[tokio::test]
async fn test_subscribe_needs_a_connected_channel() {
    let broker = shared_broker();
    let control = Arc::new(LocalControlClient::new("offline", broker));
    let node = Dispatcher::builder(config("offline"), control).build();
    let (callback, _) = counter();

    let result = node
        .subscribe("t", callback, Protocol::Broker.into(), QoS::AtMostOnce)
        .await;
    assert!(matches!(result, Err(Error::NotConnected)));
    assert!(node.subscriptions().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_silences_every_callback() {
    let broker = shared_broker();
    let sub = node(&broker, "sub").await;
    let publisher = node(&broker, "pub").await;

    let counters: Vec<_> = (0..3).map(|_| counter()).collect();
    for (callback, _) in &counters {
        sub.subscribe("alerts", callback.clone(), Protocol::Broker.into(), QoS::AtMostOnce)
            .await
            .unwrap();
    }
    wait_for(|| !publisher.routes("alerts").is_empty()).await;

    publisher
        .publish("alerts", b"1", Protocol::Broker.into(), QoS::AtMostOnce, false)
        .await
        .unwrap();
    wait_for(|| counters.iter().all(|(_, c)| c.load(Ordering::SeqCst) == 1)).await;

    sub.unsubscribe("alerts").await.unwrap();
    assert!(sub.subscriptions().is_empty());
    publisher
        .publish("alerts", b"2", Protocol::Broker.into(), QoS::AtMostOnce, false)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    for (_, count) in &counters {
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    // Unknown topics are ignored.
    sub.unsubscribe("alerts").await.unwrap();
}

#[tokio::test]
async fn test_duplicate_callback_is_invoked_once() {
    let broker = shared_broker();
    let sub = node(&broker, "sub").await;
    let publisher = node(&broker, "pub").await;

    let (callback, count) = counter();
    for _ in 0..2 {
        sub.subscribe("t", callback.clone(), Protocol::Broker.into(), QoS::AtMostOnce)
            .await
            .unwrap();
    }
    wait_for(|| !publisher.routes("t").is_empty()).await;

    for _ in 0..3 {
        publisher
            .publish("t", b"x", Protocol::Broker.into(), QoS::AtMostOnce, false)
            .await
            .unwrap();
    }
    wait_for(|| count.load(Ordering::SeqCst) >= 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_callbacks_run_in_registration_order() {
    let broker = shared_broker();
    let sub = node(&broker, "sub").await;
    let publisher = node(&broker, "pub").await;

    let order = Arc::new(Mutex::new(Vec::new()));
    for label in 1..=3u8 {
        let order = order.clone();
        let callback: Callback = Arc::new(move |_: &Message| order.lock().push(label));
        sub.subscribe("ordered", callback, Protocol::Broker.into(), QoS::AtMostOnce)
            .await
            .unwrap();
    }
    wait_for(|| !publisher.routes("ordered").is_empty()).await;

    publisher
        .publish("ordered", b"x", Protocol::Broker.into(), QoS::AtMostOnce, false)
        .await
        .unwrap();
    wait_for(|| order.lock().len() == 3).await;
    assert_eq!(*order.lock(), vec![1u8, 2, 3]);
}

#[tokio::test]
async fn test_peer_publish_reaches_subscriber() {
    let broker = shared_broker();
    let sub = node(&broker, "camera").await;
    let viewer = node(&broker, "viewer").await;
    let mut events = viewer.events();

    let (callback, mut inbox) = forwarding();
    sub.subscribe("frames", callback, Protocol::PeerRtc.into(), QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(sub.subscription_protocol("frames"), Some(Protocol::PeerRtc));
    wait_for(|| !viewer.routes("frames").is_empty()).await;

    viewer
        .publish(
            "frames",
            &[0x01, 0x02, 0x03],
            Protocol::PeerRtc.into(),
            QoS::AtMostOnce,
            false,
        )
        .await
        .unwrap();

    let msg = recv(&mut inbox).await;
    assert_eq!(msg.topic, "frames");
    assert_eq!(msg.payload, vec![0x01u8, 0x02, 0x03]);
    assert_eq!(msg.protocol, Protocol::PeerRtc);
    assert_eq!(msg.frame, Some(FrameMeta::video(640, 480)));

    next_event(&mut events, |e| matches!(e, NodeEvent::SessionReady { .. })).await;

    // The session is reused for the next frame.
    viewer
        .publish("frames", b"again", Protocol::PeerRtc.into(), QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert_eq!(recv(&mut inbox).await.payload, b"again".to_vec());
    assert_eq!(viewer.routes("frames").len(), 1);
    assert!(viewer.routes("frames")[0].session.is_some());
}

#[tokio::test]
async fn test_stream_publish_reaches_subscriber() {
    let broker = shared_broker();
    let sub = node(&broker, "sink").await;
    let publisher = node(&broker, "source").await;

    let (callback, mut inbox) = forwarding();
    let set: ProtocolSet = [Protocol::Stream, Protocol::Broker].into_iter().collect();
    sub.subscribe("logs", callback, set, QoS::AtMostOnce)
        .await
        .unwrap();
    wait_for(|| !publisher.routes("logs").is_empty()).await;
    assert_eq!(publisher.routes("logs")[0].protocol, Protocol::Stream);

    publisher
        .publish("logs", b"line", Protocol::Stream.into(), QoS::AtMostOnce, false)
        .await
        .unwrap();
    let msg = recv(&mut inbox).await;
    assert_eq!(msg.payload, b"line".to_vec());
    assert_eq!(msg.protocol, Protocol::Stream);
}

#[tokio::test]
async fn test_unreachable_peer_reports_connection_failure() {
    let broker = shared_broker();
    let node = node(&broker, "lonely").await;
    let mut events = node.events();

    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    node.routing_table()
        .upsert("frames", "127.0.0.1", port, Protocol::PeerRtc);

    node.publish("frames", b"x", Protocol::PeerRtc.into(), QoS::AtMostOnce, false)
        .await
        .unwrap();

    let event = next_event(&mut events, |e| {
        matches!(e, NodeEvent::ConnectionFailure { .. })
    })
    .await;
    match event {
        NodeEvent::ConnectionFailure { topic, .. } => assert_eq!(topic, "frames"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_request_reply_sequence() {
    let broker = shared_broker();
    let server = node(&broker, "server").await;
    let client = node(&broker, "client").await;

    let responder = server.clone();
    let handler: Callback = Arc::new(move |request: &Message| {
        let responder = responder.clone();
        let request = request.clone();
        tokio::spawn(async move {
            responder.send_reply(&request, b"one", false).await.unwrap();
            responder.send_reply(&request, b"two", true).await.unwrap();
        });
    });
    server
        .subscribe("rpc/echo", handler, Protocol::Broker.into(), QoS::AtMostOnce)
        .await
        .unwrap();

    let (callback, mut replies) = forwarding();
    client
        .publish_with_reply(
            "rpc/echo",
            b"ping",
            QoS::AtMostOnce,
            Some("req-1".to_string()),
            callback,
        )
        .await
        .unwrap();

    let first = recv(&mut replies).await;
    assert_eq!(first.payload, b"one".to_vec());
    assert_eq!(first.sequence, 0);
    assert_eq!(first.correlation.as_deref(), Some("req-1"));
    assert!(!first.end_sequence);

    let last = recv(&mut replies).await;
    assert_eq!(last.payload, b"two".to_vec());
    assert_eq!(last.sequence, 1);
    assert!(last.end_sequence);

    wait_for(|| client.subscriptions().is_empty()).await;
}

#[tokio::test]
async fn test_send_reply_needs_a_request() {
    let broker = shared_broker();
    let node = node(&broker, "n1").await;
    let plain = Message::new("t", b"x".to_vec(), Protocol::Broker);
    assert!(matches!(
        node.send_reply(&plain, b"y", true).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_disconnect_retracts_routes() {
    let broker = shared_broker();
    let leaving = node(&broker, "leaving").await;
    let staying = node(&broker, "staying").await;

    let (callback, _) = counter();
    leaving
        .subscribe("a", callback.clone(), Protocol::Broker.into(), QoS::AtMostOnce)
        .await
        .unwrap();
    leaving
        .subscribe("b", callback, Protocol::Datagram.into(), QoS::AtMostOnce)
        .await
        .unwrap();
    wait_for(|| staying.routing_table().len() == 2).await;

    leaving.disconnect().await.unwrap();
    assert!(leaving.subscriptions().is_empty());
    wait_for(|| staying.routing_table().is_empty()).await;
}

#[tokio::test]
async fn test_broker_failure_does_not_stop_other_routes() {
    let broker = shared_broker();
    let transport = Arc::new(RecordingTransport::default());
    let control = Arc::new(LocalControlClient::new("n1", broker.clone()));
    let node = Dispatcher::builder(config("n1"), control.clone())
        .transport(transport.clone())
        .build();
    node.connect("in-process", 0).await.unwrap();
    let mut events = node.events();

    let table = node.routing_table();
    table.upsert("t", "10.0.0.2", 0, Protocol::Broker);
    table.upsert("t", "10.0.0.3", 7001, Protocol::Stream);

    control.abort();
    next_event(&mut events, |e| {
        matches!(e, NodeEvent::ControlDisconnected { .. })
    })
    .await;

    let set: ProtocolSet = [Protocol::Broker, Protocol::Stream].into_iter().collect();
    node.publish("t", b"x", set, QoS::AtMostOnce, false)
        .await
        .unwrap();

    let sent = transport.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, 7001);
    let event = next_event(&mut events, |e| {
        matches!(e, NodeEvent::TransportFailure { .. })
    })
    .await;
    match event {
        NodeEvent::TransportFailure {
            topic, protocol, ..
        } => {
            assert_eq!(topic, "t");
            assert_eq!(protocol, Protocol::Broker);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_rejoin_after_lost_control_channel() {
    let broker = shared_broker();
    let control = Arc::new(LocalControlClient::new("sub", broker.clone()));
    let sub = Dispatcher::builder(config("sub"), control.clone()).build();
    sub.connect("in-process", 0).await.unwrap();
    let publisher = node(&broker, "pub").await;
    let mut events = sub.events();

    let (callback, count) = counter();
    sub.subscribe("alerts", callback, Protocol::Broker.into(), QoS::AtMostOnce)
        .await
        .unwrap();
    wait_for(|| !publisher.routes("alerts").is_empty()).await;

    control.abort();
    next_event(&mut events, |e| {
        matches!(e, NodeEvent::ControlDisconnected { .. })
    })
    .await;
    // The will retracts the routes of the crashed link.
    wait_for(|| publisher.routes("alerts").is_empty()).await;
    assert_eq!(sub.subscriptions(), vec!["alerts".to_string()]);

    sub.connect("in-process", 0).await.unwrap();
    wait_for(|| !publisher.routes("alerts").is_empty()).await;
    publisher
        .publish("alerts", b"back", Protocol::Broker.into(), QoS::AtMostOnce, false)
        .await
        .unwrap();
    wait_for(|| count.load(Ordering::SeqCst) == 1).await;
}
