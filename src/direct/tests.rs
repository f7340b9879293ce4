use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{
    DatagramTransport, DirectTransport, PayloadSink, StreamTransport, decode_envelope,
    encode_envelope,
};
use crate::Error;

fn channel_sink() -> (PayloadSink, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
    let (tx, rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
    let sink: PayloadSink = Arc::new(move |topic: String, payload: Vec<u8>| {
        let _ = tx.send((topic, payload));
    });
    (sink, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<(String, Vec<u8>)>) -> (String, Vec<u8>) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an envelope")
        .expect("sink dropped")
}

#[test]
fn test_envelope_layout() {
    let buf = encode_envelope("ab", &[9u8, 8]).unwrap();
    assert_eq!(buf, vec![0u8, 2, b'a', b'b', 0, 0, 0, 2, 9, 8]);
    assert_eq!(
        decode_envelope(&buf).unwrap(),
        ("ab".to_string(), vec![9u8, 8])
    );
}

#[test]
fn test_truncated_envelopes_are_rejected() {
    let buf = encode_envelope("topic", b"payload").unwrap();
    for cut in [0, 1, 4, 10, buf.len() - 1] {
        assert!(matches!(decode_envelope(&buf[..cut]), Err(Error::Decode(_))));
    }
}

#[tokio::test]
async fn test_stream_delivers_in_order() {
    let transport = StreamTransport::new();
    let (sink, mut rx) = channel_sink();
    let port = transport.listen("logs", sink).await.unwrap();

    transport.send("127.0.0.1", port, "logs", b"one").await.unwrap();
    assert_eq!(recv(&mut rx).await, ("logs".to_string(), b"one".to_vec()));
    transport.send("127.0.0.1", port, "logs", b"").await.unwrap();
    assert_eq!(recv(&mut rx).await, ("logs".to_string(), Vec::new()));
}

#[tokio::test]
async fn test_stream_unlisten_refuses_connections() {
    let transport = StreamTransport::new();
    let (sink, _rx) = channel_sink();
    let port = transport.listen("logs", sink).await.unwrap();
    transport.unlisten(port);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = transport.send("127.0.0.1", port, "logs", b"late").await;
    assert!(matches!(result, Err(Error::TransportFailure(_))));
}

#[tokio::test]
async fn test_datagram_roundtrip() {
    let transport = DatagramTransport::new();
    let (sink, mut rx) = channel_sink();
    let port = transport.listen("pose", sink).await.unwrap();

    transport
        .send("127.0.0.1", port, "pose", &[1u8, 2, 3])
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, ("pose".to_string(), vec![1u8, 2, 3]));
}

#[tokio::test]
async fn test_datagram_rejects_oversized_payload() {
    let transport = DatagramTransport::new();
    let result = transport
        .send("127.0.0.1", 9, "big", &vec![0u8; 70_000])
        .await;
    assert!(matches!(result, Err(Error::TransportFailure(_))));
}
