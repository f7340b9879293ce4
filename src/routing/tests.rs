use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use super::{RouteUpdate, RoutingTable};
use crate::protocol::Protocol;
use crate::signaling::session::{self, SessionConfig, SessionHandle, SessionHooks};
use crate::signaling::DirectPeerFactory;

/// A session stuck in the handshake: the port accepts TCP but never upgrades.
async fn pending_session() -> (SessionHandle, TcpListener) {
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let handle = session::connect(
        "127.0.0.1",
        port,
        SessionConfig {
            handshake_timeout: Duration::from_secs(30),
            ..SessionConfig::default()
        },
        Arc::new(DirectPeerFactory::new("127.0.0.1")),
        SessionHooks::default(),
    );
    (handle, silent)
}

#[test]
fn test_upsert_replaces_in_place() {
    let table = RoutingTable::new();
    table.upsert("t", "10.0.0.2", 5000, Protocol::Stream);
    table.upsert("t", "10.0.0.2", 5000, Protocol::PeerRtc);

    let entries = table.lookup("t");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].protocol, Protocol::PeerRtc);
    assert_eq!(entries[0].host, "10.0.0.2");
    assert_eq!(entries[0].port, 5000);
}

#[test]
fn test_upsert_is_idempotent() {
    let table = RoutingTable::new();
    for _ in 0..3 {
        table.upsert("t", "h", 1, Protocol::Datagram);
    }
    assert_eq!(table.len(), 1);
}

#[test]
fn test_lookup_orders_by_host_then_port() {
    let table = RoutingTable::new();
    table.upsert("t", "b", 2, Protocol::Stream);
    table.upsert("t", "a", 9, Protocol::Stream);
    table.upsert("t", "b", 1, Protocol::Datagram);

    let order: Vec<(String, u16)> = table
        .lookup("t")
        .into_iter()
        .map(|e| (e.host, e.port))
        .collect();
    assert_eq!(
        order,
        vec![
            ("a".to_string(), 9),
            ("b".to_string(), 1),
            ("b".to_string(), 2)
        ]
    );
}

#[test]
fn test_lookup_unknown_topic_is_empty() {
    let table = RoutingTable::new();
    assert!(table.lookup("nobody").is_empty());
    assert!(table.is_empty());
}

#[test]
fn test_lookup_is_a_snapshot() {
    let table = RoutingTable::new();
    table.upsert("t", "h1", 1, Protocol::Stream);
    let snapshot = table.lookup("t");

    table.upsert("t", "h2", 2, Protocol::Stream);
    table.remove_host("h1");

    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].host, "h1");
    assert_eq!(table.lookup("t")[0].host, "h2");
}

#[test]
fn test_remove_host_leaves_other_hosts() {
    let table = RoutingTable::new();
    table.upsert("a", "10.0.0.2", 1, Protocol::Stream);
    table.upsert("a", "10.0.0.3", 1, Protocol::Stream);
    table.upsert("b", "10.0.0.2", 2, Protocol::PeerRtc);

    table.remove_host("10.0.0.2");

    let a = table.lookup("a");
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].host, "10.0.0.3");
    assert!(table.lookup("b").is_empty());
    assert_eq!(table.topics(), vec!["a".to_string()]);
}

#[test]
fn test_apply_inserts_every_update() {
    let table = RoutingTable::new();
    let displaced = table.apply(
        "10.0.0.9",
        &[
            RouteUpdate {
                topic: "x".into(),
                port: 10,
                protocol: Protocol::PeerRtc,
            },
            RouteUpdate {
                topic: "y".into(),
                port: 0,
                protocol: Protocol::Broker,
            },
        ],
    );
    assert!(displaced.is_empty());
    assert_eq!(table.len(), 2);
    assert_eq!(table.topics(), vec!["x".to_string(), "y".to_string()]);
}

#[test]
fn test_retire_drops_only_listed_entries() {
    let table = RoutingTable::new();
    table.upsert("cam", "h", 1, Protocol::PeerRtc);
    table.upsert("cam", "h", 2, Protocol::PeerRtc);
    table.upsert("cam", "other", 1, Protocol::PeerRtc);
    table.upsert("mic", "h", 3, Protocol::Datagram);

    let displaced = table.retire(
        "h",
        &[("cam".to_string(), 1), ("mic".to_string(), 3), ("gone".to_string(), 9)],
    );
    assert!(displaced.is_empty());
    let left: Vec<(String, u16)> = table
        .lookup("cam")
        .into_iter()
        .map(|r| (r.host, r.port))
        .collect();
    assert_eq!(left, vec![("h".to_string(), 2), ("other".to_string(), 1)]);
    assert_eq!(table.topics(), vec!["cam".to_string()]);
}

#[test]
fn test_forget_topic() {
    let table = RoutingTable::new();
    table.upsert("keep", "h", 1, Protocol::Stream);
    table.upsert("drop", "h", 1, Protocol::Stream);

    table.forget_topic("drop");
    table.forget_topic("never-seen");

    assert!(table.lookup("drop").is_empty());
    assert_eq!(table.lookup("keep").len(), 1);
}

#[tokio::test]
async fn test_session_is_created_once_and_reused() {
    let table = RoutingTable::new();
    table.upsert("cam", "127.0.0.1", 7000, Protocol::PeerRtc);
    let (first, _silent) = pending_session().await;

    let got = table
        .session_or_insert_with("cam", "127.0.0.1", 7000, || first.clone())
        .unwrap();
    assert_eq!(got.id(), first.id());

    let again = table
        .session_or_insert_with("cam", "127.0.0.1", 7000, || panic!("must reuse"))
        .unwrap();
    assert_eq!(again.id(), first.id());
    assert_eq!(table.lookup("cam")[0].session.as_ref().map(|s| s.id()), Some(first.id()));

    first.close();
}

#[tokio::test]
async fn test_session_needs_an_entry() {
    let table = RoutingTable::new();
    let created = table.session_or_insert_with("cam", "127.0.0.1", 7000, || {
        panic!("no entry, nothing to create")
    });
    assert!(created.is_none());
}

#[tokio::test]
async fn test_closed_session_is_replaced() {
    let table = RoutingTable::new();
    table.upsert("cam", "h", 1, Protocol::PeerRtc);
    let (first, _a) = pending_session().await;
    let (second, _b) = pending_session().await;

    table.session_or_insert_with("cam", "h", 1, || first.clone());
    first.close();
    tokio::time::timeout(Duration::from_secs(5), first.wait_closed())
        .await
        .unwrap();

    let got = table
        .session_or_insert_with("cam", "h", 1, || second.clone())
        .unwrap();
    assert_eq!(got.id(), second.id());
    second.close();
}

#[tokio::test]
async fn test_detach_session_only_matches_current_id() {
    let table = RoutingTable::new();
    table.upsert("cam", "h", 1, Protocol::PeerRtc);
    let (session, _silent) = pending_session().await;
    table.session_or_insert_with("cam", "h", 1, || session.clone());

    assert!(!table.detach_session("cam", "h", 1, uuid::Uuid::new_v4()));
    assert!(table.detach_session("cam", "h", 1, session.id()));
    assert!(table.lookup("cam")[0].session.is_none());
    assert!(!table.detach_session("cam", "h", 2, session.id()));
    session.close();
}

#[tokio::test]
async fn test_protocol_change_displaces_session() {
    let table = RoutingTable::new();
    table.upsert("cam", "h", 1, Protocol::PeerRtc);
    let (session, _silent) = pending_session().await;
    table.session_or_insert_with("cam", "h", 1, || session.clone());

    // Same protocol keeps the live session.
    assert!(table.upsert("cam", "h", 1, Protocol::PeerRtc).is_none());
    assert!(table.lookup("cam")[0].session.is_some());

    let displaced = table.upsert("cam", "h", 1, Protocol::Stream).unwrap();
    assert_eq!(displaced.id(), session.id());
    assert!(table.lookup("cam")[0].session.is_none());
    session.close();
}

#[tokio::test]
async fn test_remove_host_and_clear_return_sessions() {
    let table = RoutingTable::new();
    table.upsert("a", "h1", 1, Protocol::PeerRtc);
    table.upsert("b", "h2", 1, Protocol::PeerRtc);
    let (s1, _x) = pending_session().await;
    let (s2, _y) = pending_session().await;
    table.session_or_insert_with("a", "h1", 1, || s1.clone());
    table.session_or_insert_with("b", "h2", 1, || s2.clone());

    let removed = table.remove_host("h1");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].id(), s1.id());

    let cleared = table.clear();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].id(), s2.id());
    assert!(table.is_empty());

    s1.close();
    s2.close();
}
