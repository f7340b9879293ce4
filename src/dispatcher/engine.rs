//! Dispatcher
//!
//! The public publish/subscribe entry point of a node. It owns the routing
//! table, the discovery engine, the local subscriptions and the transports,
//! and glues them together:
//!
//! - `subscribe` opens an endpoint for the topic (broker subscription,
//!   direct listener or signaling listener) and advertises it;
//! - `publish` fans a payload out to every route the table knows for the
//!   topic, creating peer sessions on first use;
//! - control-channel deliveries are routed either to discovery or to the
//!   topic's callbacks.
//!
//! Background failures are reported through `events()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::message::{Message as BrokerMessage, ReplyInfo};
use crate::config::Settings;
use crate::control::ControlChannel;
use crate::direct::{DatagramTransport, DirectTransport, PayloadSink, StreamTransport};
use crate::discovery::{DiscoveryConfig, DiscoveryEngine, is_reserved_key};
use crate::dispatcher::message::{Callback, Message, NodeEvent, REPLY_POSTFIX};
use crate::dispatcher::registry::{Endpoint, Insert, SubscriptionRecord, SubscriptionRegistry};
use crate::protocol::{Protocol, ProtocolSet, QoS};
use crate::routing::{RouteEntry, RoutingTable};
use crate::signaling::session::{self, FrameSink, SessionEventSink};
use crate::signaling::{
    CloseReason, DirectPeerFactory, Frame, FrameMeta, Listener, PeerFactory, SessionConfig,
    SessionEvent, SessionHandle, SessionHooks,
};
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 256;

/// Order in which a subscription picks its single advertised protocol.
const SUBSCRIBE_PREFERENCE: [Protocol; 4] = [
    Protocol::PeerRtc,
    Protocol::Stream,
    Protocol::Datagram,
    Protocol::Broker,
];

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub node_id: String,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl From<&Settings> for DispatcherConfig {
    fn from(s: &Settings) -> Self {
        Self {
            node_id: s.node.id.clone(),
            discovery: DiscoveryConfig::from(s),
            session: SessionConfig::from(&s.signaling),
            frame_width: s.media.frame_width,
            frame_height: s.media.frame_height,
        }
    }
}

pub struct DispatcherBuilder {
    config: DispatcherConfig,
    control: Arc<dyn ControlChannel>,
    transports: HashMap<Protocol, Arc<dyn DirectTransport>>,
    peer_factory: Option<Arc<dyn PeerFactory>>,
}

impl DispatcherBuilder {
    /// Replaces the transport registered for `transport.protocol()`.
    pub fn transport(mut self, transport: Arc<dyn DirectTransport>) -> Self {
        self.transports.insert(transport.protocol(), transport);
        self
    }

    pub fn peer_factory(mut self, factory: Arc<dyn PeerFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    pub fn build(self) -> Dispatcher {
        let table = Arc::new(RoutingTable::new());
        let discovery = DiscoveryEngine::new(
            self.config.discovery.clone(),
            self.control.clone(),
            table.clone(),
        );
        let peer_factory = self.peer_factory.unwrap_or_else(|| {
            Arc::new(DirectPeerFactory::new(self.config.discovery.host.clone()))
                as Arc<dyn PeerFactory>
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            config: self.config,
            control: self.control,
            table,
            discovery,
            registry: SubscriptionRegistry::new(),
            transports: self.transports,
            peer_factory,
            events,
            reply_counter: AtomicU64::new(0),
            reply_sequences: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.control.set_sink(Arc::new(move |msg: BrokerMessage| {
            if let Some(inner) = weak.upgrade() {
                inner.on_control_message(msg);
            }
        }));
        let weak = Arc::downgrade(&inner);
        inner.control.set_link_lost_sink(Arc::new(move |reason: &str| {
            if let Some(inner) = weak.upgrade() {
                warn!("{} lost the control channel: {}", inner.config.node_id, reason);
                inner.emit(NodeEvent::ControlDisconnected {
                    reason: reason.to_string(),
                });
            }
        }));

        Dispatcher { inner }
    }
}

/// A node's publish/subscribe handle. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: DispatcherConfig,
    control: Arc<dyn ControlChannel>,
    table: Arc<RoutingTable>,
    discovery: DiscoveryEngine,
    registry: SubscriptionRegistry,
    transports: HashMap<Protocol, Arc<dyn DirectTransport>>,
    peer_factory: Arc<dyn PeerFactory>,
    events: broadcast::Sender<NodeEvent>,
    reply_counter: AtomicU64,
    /// Next sequence number per reply topic this node answers on.
    reply_sequences: Mutex<HashMap<String, u32>>,
}

impl Dispatcher {
    /// A builder with the stock STREAM and DATAGRAM transports and the
    /// direct peer connection.
    pub fn builder(
        config: DispatcherConfig,
        control: Arc<dyn ControlChannel>,
    ) -> DispatcherBuilder {
        let mut transports: HashMap<Protocol, Arc<dyn DirectTransport>> = HashMap::new();
        transports.insert(Protocol::Stream, Arc::new(StreamTransport::new()));
        transports.insert(Protocol::Datagram, Arc::new(DatagramTransport::new()));
        DispatcherBuilder {
            config,
            control,
            transports,
            peer_factory: None,
        }
    }

    pub fn new(settings: &Settings, control: Arc<dyn ControlChannel>) -> Self {
        Self::builder(DispatcherConfig::from(settings), control).build()
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// Connects the control channel and starts discovery. After a lost
    /// link this rejoins: broker subscriptions are renewed and the local
    /// capabilities announced again.
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        let inner = &self.inner;
        inner.control.set_will(inner.discovery.will()?);
        inner.control.connect(host, port).await?;
        for (topic, qos) in inner.registry.broker_topics() {
            debug!("renewing broker subscription to '{}'", topic);
            inner.control.subscribe(&topic, qos).await?;
        }
        inner.discovery.start().await?;
        info!("{} joined via {}:{}", inner.config.node_id, host, port);
        Ok(())
    }

    /// Tears down every subscription, announces the departure, disconnects
    /// the control channel and closes every session.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        for (topic, record) in inner.registry.drain() {
            inner.teardown(&topic, record.endpoint).await;
        }
        inner.reply_sequences.lock().clear();

        if inner.control.is_connected() {
            if let Err(e) = inner.discovery.shutdown().await {
                warn!("failed to announce departure: {}", e);
            }
        }
        inner.control.disconnect().await?;

        let sessions = inner.table.clear();
        debug!("closing {} peer sessions", sessions.len());
        for session in sessions {
            session.close();
        }
        info!("{} left", inner.config.node_id);
        Ok(())
    }

    /// Sends `payload` to every known subscriber of `topic` reachable through
    /// one of `protocols`. Without a route this is a no-op.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        protocols: ProtocolSet,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        validate_topic(topic)?;
        if protocols.is_empty() {
            return Err(Error::invalid_argument("empty protocol set"));
        }

        let routes = self.inner.table.lookup(topic);
        if routes.is_empty() {
            debug!("{}", Error::RouteNotFound(topic.to_string()));
            return Ok(());
        }

        let (connectionless, oriented) = protocols.split_connection_oriented();
        self.inner
            .publish_connectionless(topic, payload, connectionless, &routes, qos, retain)
            .await;
        if oriented.contains(Protocol::PeerRtc) {
            self.inner.publish_peer(topic, payload, &routes);
        }
        Ok(())
    }

    /// Registers `callback` for `topic`. The first subscription of a topic
    /// opens its endpoint and advertises it; later ones only add callbacks.
    /// Registering the same callback twice has no effect.
    pub async fn subscribe(
        &self,
        topic: &str,
        callback: Callback,
        protocols: ProtocolSet,
        qos: QoS,
    ) -> Result<()> {
        validate_topic(topic)?;
        if protocols.is_empty() {
            return Err(Error::invalid_argument("empty protocol set"));
        }
        if is_reserved_key(topic) || self.inner.discovery.is_discovery_topic(topic) {
            return Err(Error::invalid_argument(format!(
                "'{topic}' is reserved for discovery"
            )));
        }
        let protocol = SUBSCRIBE_PREFERENCE
            .into_iter()
            .find(|p| protocols.contains(*p))
            .ok_or_else(|| {
                Error::invalid_argument("no transport serves the requested protocols")
            })?;

        self.inner
            .subscribe_with(topic, callback, protocol, qos, true)
            .await
    }

    /// Drops every callback of `topic` and closes its endpoint. Unknown
    /// topics are ignored.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        validate_topic(topic)?;
        self.inner.unsubscribe(topic).await
    }

    /// Publishes a request over the broker and delivers every reply to
    /// `callback` until one marks the end of the sequence.
    pub async fn publish_with_reply(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        correlation: Option<String>,
        callback: Callback,
    ) -> Result<()> {
        validate_topic(topic)?;
        let inner = &self.inner;
        let n = inner.reply_counter.fetch_add(1, Ordering::Relaxed);
        let reply_topic = format!("{}{}{}-{}", topic, REPLY_POSTFIX, inner.config.node_id, n);

        let weak = Arc::downgrade(inner);
        let finished = Arc::new(AtomicBool::new(false));
        let wrapped: Callback = Arc::new(move |msg: &Message| {
            if finished.load(Ordering::SeqCst) {
                return;
            }
            callback(msg);
            if msg.end_sequence && !finished.swap(true, Ordering::SeqCst) {
                drop_reply_subscription(weak.clone(), msg.topic.clone());
            }
        });

        inner
            .subscribe_with(&reply_topic, wrapped, Protocol::Broker, qos, false)
            .await?;

        let request = BrokerMessage::new(topic, payload.to_vec())
            .with_qos(qos)
            .with_reply(ReplyInfo {
                reply_topic: reply_topic.clone(),
                correlation,
                sequence: 0,
                end: false,
            });
        if let Err(e) = inner.control.publish(request).await {
            inner.unsubscribe(&reply_topic).await?;
            return Err(e);
        }
        debug!("request on '{}' awaits replies on '{}'", topic, reply_topic);
        Ok(())
    }

    /// Answers a request received by a subscriber callback. `end` closes the
    /// reply sequence.
    pub async fn send_reply(&self, request: &Message, payload: &[u8], end: bool) -> Result<()> {
        let reply_topic = request
            .reply_topic
            .clone()
            .ok_or_else(|| Error::invalid_argument("message does not expect a reply"))?;

        let sequence = {
            let mut sequences = self.inner.reply_sequences.lock();
            let next = sequences.entry(reply_topic.clone()).or_insert(0);
            let sequence = *next;
            *next += 1;
            if end {
                sequences.remove(&reply_topic);
            }
            sequence
        };

        let reply = BrokerMessage::new(reply_topic.clone(), payload.to_vec())
            .with_qos(request.qos)
            .with_reply(ReplyInfo {
                reply_topic,
                correlation: request.correlation.clone(),
                sequence,
                end,
            });
        self.inner.control.publish(reply).await
    }

    /// Subscribes to background notifications.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the routes known for `topic`.
    pub fn routes(&self, topic: &str) -> Vec<RouteEntry> {
        self.inner.table.lookup(topic)
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.inner.table.clone()
    }

    /// Topics with at least one local callback.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.registry.topics()
    }

    pub fn subscription_protocol(&self, topic: &str) -> Option<Protocol> {
        self.inner.registry.protocol(topic)
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        Err(Error::invalid_argument("empty topic"))
    } else {
        Ok(())
    }
}

fn drop_reply_subscription(weak: Weak<Inner>, topic: String) {
    tokio::spawn(async move {
        if let Some(inner) = weak.upgrade() {
            if let Err(e) = inner.unsubscribe(&topic).await {
                warn!("failed to drop reply subscription '{}': {}", topic, e);
            }
        }
    });
}

impl Inner {
    fn emit(&self, event: NodeEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn on_control_message(&self, msg: BrokerMessage) {
        if self.discovery.is_discovery_topic(&msg.topic) {
            self.discovery.on_delivery(&msg.topic, &msg.payload);
            return;
        }
        self.deliver(Message::from(msg));
    }

    fn deliver(&self, msg: Message) {
        let callbacks = self.registry.callbacks(&msg.topic);
        if callbacks.is_empty() {
            debug!("no callbacks for '{}', dropping", msg.topic);
            return;
        }
        for callback in callbacks {
            callback(&msg);
        }
    }

    fn frame_meta(&self, topic: &str) -> FrameMeta {
        if topic.contains(REPLY_POSTFIX) {
            FrameMeta::message()
        } else {
            FrameMeta::video(self.config.frame_width, self.config.frame_height)
        }
    }

    async fn publish_connectionless(
        &self,
        topic: &str,
        payload: &[u8],
        protocols: ProtocolSet,
        routes: &[RouteEntry],
        qos: QoS,
        retain: bool,
    ) {
        if protocols.contains(Protocol::Broker)
            && routes.iter().any(|r| r.protocol == Protocol::Broker)
        {
            let msg = BrokerMessage::new(topic, payload.to_vec())
                .with_qos(qos)
                .retained(retain);
            if let Err(e) = self.control.publish(msg).await {
                warn!("broker publish on '{}' failed: {}", topic, e);
                self.emit(NodeEvent::TransportFailure {
                    topic: topic.to_string(),
                    peer: "broker".to_string(),
                    protocol: Protocol::Broker,
                    reason: e.to_string(),
                });
            }
        }

        for route in routes {
            if route.protocol == Protocol::Broker || !protocols.contains(route.protocol) {
                continue;
            }
            let Some(transport) = self.transports.get(&route.protocol) else {
                warn!(
                    "no transport for {} route {}:{} on '{}'",
                    route.protocol, route.host, route.port, topic
                );
                continue;
            };
            if let Err(e) = transport.send(&route.host, route.port, topic, payload).await {
                warn!(
                    "{} send to {}:{} failed: {}",
                    route.protocol, route.host, route.port, e
                );
                self.emit(NodeEvent::TransportFailure {
                    topic: topic.to_string(),
                    peer: format!("{}:{}", route.host, route.port),
                    protocol: route.protocol,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn publish_peer(self: &Arc<Self>, topic: &str, payload: &[u8], routes: &[RouteEntry]) {
        let meta = self.frame_meta(topic);
        for route in routes.iter().filter(|r| r.protocol == Protocol::PeerRtc) {
            let session = self
                .table
                .session_or_insert_with(topic, &route.host, route.port, || {
                    self.open_session(topic, &route.host, route.port)
                });
            let Some(session) = session else {
                debug!("route {}:{} vanished during publish", route.host, route.port);
                continue;
            };
            if let Err(e) = session.send(Frame::new(meta, payload)) {
                warn!("dropping frame for {}: {}", session.peer(), e);
            }
        }
    }

    fn open_session(self: &Arc<Self>, topic: &str, host: &str, port: u16) -> SessionHandle {
        debug!("opening session to {}:{} for '{}'", host, port, topic);
        let weak = Arc::downgrade(self);
        let closed_topic = topic.to_string();
        let closed_host = host.to_string();
        let hooks = SessionHooks {
            on_frame: Some(self.frame_sink(topic)),
            on_event: Some(self.session_event_sink(topic)),
            on_closed: Some(Box::new(move |id: Uuid| {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .table
                        .detach_session(&closed_topic, &closed_host, port, id);
                }
            })),
        };
        session::connect(
            host,
            port,
            self.config.session.clone(),
            self.peer_factory.clone(),
            hooks,
        )
    }

    fn frame_sink(self: &Arc<Self>, topic: &str) -> FrameSink {
        let weak = Arc::downgrade(self);
        let topic = topic.to_string();
        Arc::new(move |frame: Frame| {
            if let Some(inner) = weak.upgrade() {
                let mut msg = Message::new(topic.clone(), frame.data, Protocol::PeerRtc);
                msg.frame = Some(frame.meta);
                inner.deliver(msg);
            }
        })
    }

    fn session_event_sink(self: &Arc<Self>, topic: &str) -> SessionEventSink {
        let weak = Arc::downgrade(self);
        let topic = topic.to_string();
        let timeout_ms = self.config.session.handshake_timeout.as_millis() as u64;
        Arc::new(move |event: SessionEvent| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let event = match event {
                SessionEvent::Ready { peer, .. } => NodeEvent::SessionReady {
                    topic: topic.clone(),
                    peer,
                },
                SessionEvent::Closed { peer, reason, .. } if reason.is_failure() => {
                    NodeEvent::ConnectionFailure {
                        topic: topic.clone(),
                        peer,
                        reason: describe(&reason, timeout_ms),
                    }
                }
                SessionEvent::Closed { peer, reason, .. } => NodeEvent::SessionClosed {
                    topic: topic.clone(),
                    peer,
                    reason,
                },
            };
            inner.emit(event);
        })
    }

    fn payload_sink(self: &Arc<Self>, protocol: Protocol) -> PayloadSink {
        let weak = Arc::downgrade(self);
        Arc::new(move |topic: String, payload: Vec<u8>| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver(Message::new(topic, payload, protocol));
            }
        })
    }

    async fn open_endpoint(
        self: &Arc<Self>,
        topic: &str,
        protocol: Protocol,
        qos: QoS,
    ) -> Result<Endpoint> {
        match protocol {
            Protocol::Broker => {
                self.control.subscribe(topic, qos).await?;
                Ok(Endpoint::Broker)
            }
            Protocol::PeerRtc => {
                let listener = Listener::bind(
                    topic,
                    self.config.session.clone(),
                    self.peer_factory.clone(),
                    self.frame_sink(topic),
                    Some(self.session_event_sink(topic)),
                )
                .await?;
                Ok(Endpoint::Peer(listener))
            }
            Protocol::Stream | Protocol::Datagram | Protocol::SecureStream => {
                let transport = self.transports.get(&protocol).ok_or_else(|| {
                    Error::invalid_argument(format!("no transport registered for {protocol}"))
                })?;
                let port = transport.listen(topic, self.payload_sink(protocol)).await?;
                Ok(Endpoint::Direct { protocol, port })
            }
        }
    }

    async fn subscribe_with(
        self: &Arc<Self>,
        topic: &str,
        callback: Callback,
        protocol: Protocol,
        qos: QoS,
        advertise: bool,
    ) -> Result<()> {
        match self.registry.add_callback(topic, &callback) {
            Some(true) => {
                debug!("added callback to '{}'", topic);
                return Ok(());
            }
            Some(false) => {
                debug!("callback already registered on '{}'", topic);
                return Ok(());
            }
            None => {}
        }

        if !self.control.is_connected() {
            return Err(Error::NotConnected);
        }

        let endpoint = self.open_endpoint(topic, protocol, qos).await?;
        let port = endpoint.port();
        let record = SubscriptionRecord {
            callbacks: vec![callback],
            endpoint,
            qos,
            advertised: advertise,
        };
        if let Insert::Merged(endpoint) = self.registry.insert(topic, record) {
            debug!("'{}' was subscribed concurrently, merging", topic);
            self.teardown(topic, endpoint).await;
            return Ok(());
        }

        if advertise {
            if let Err(e) = self.discovery.advertise(topic, protocol, port).await {
                error!("failed to advertise '{}': {}", topic, e);
                if let Some(record) = self.registry.remove(topic) {
                    self.teardown(topic, record.endpoint).await;
                }
                return Err(e);
            }
        }
        info!("subscribed to '{}' via {}", topic, protocol);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let Some(record) = self.registry.remove(topic) else {
            debug!("'{}' is not subscribed", topic);
            return Ok(());
        };
        self.teardown(topic, record.endpoint).await;
        if record.advertised {
            self.discovery.withdraw(topic).await?;
        }
        info!("unsubscribed from '{}'", topic);
        Ok(())
    }

    async fn teardown(&self, topic: &str, endpoint: Endpoint) {
        match endpoint {
            Endpoint::Broker => {
                if self.control.is_connected() {
                    if let Err(e) = self.control.unsubscribe(topic).await {
                        warn!("broker unsubscribe of '{}' failed: {}", topic, e);
                    }
                }
            }
            Endpoint::Direct { protocol, port } => {
                if let Some(transport) = self.transports.get(&protocol) {
                    transport.unlisten(port);
                }
            }
            Endpoint::Peer(listener) => listener.stop(),
        }
    }
}

fn describe(reason: &CloseReason, timeout_ms: u64) -> String {
    match reason {
        CloseReason::Timeout => Error::HandshakeTimeout(timeout_ms).to_string(),
        CloseReason::Failed(why) => why.clone(),
        other => format!("{other:?}"),
    }
}
