use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{Message, Will};
use crate::control::{ControlChannel, DeliverySink, LinkLostSink};
use crate::protocol::QoS;
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::{Error, Result};

const CONNACK_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The current broker connection. `generation` tells a finished reader
/// whether the link it served is still the installed one.
#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    generation: u64,
}

/// Control-channel client for a broker reached over WebSocket.
pub struct WsControlClient {
    client_id: String,
    sink: Arc<RwLock<Option<DeliverySink>>>,
    link_lost: Arc<RwLock<Option<LinkLostSink>>>,
    will: Mutex<Option<Will>>,
    link: Arc<Mutex<Link>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl WsControlClient {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            sink: Arc::new(RwLock::new(None)),
            link_lost: Arc::new(RwLock::new(None)),
            will: Mutex::new(None),
            link: Arc::new(Mutex::new(Link::default())),
            tasks: Mutex::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    fn send_frame(&self, frame: ClientFrame) -> Result<()> {
        let link = self.link.lock();
        let tx = link.outbound.as_ref().ok_or(Error::NotConnected)?;
        tx.send(frame).map_err(|_| Error::NotConnected)
    }
}

#[async_trait]
impl ControlChannel for WsControlClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn set_sink(&self, sink: DeliverySink) {
        *self.sink.write() = Some(sink);
    }

    fn set_link_lost_sink(&self, sink: LinkLostSink) {
        *self.link_lost.write() = Some(sink);
    }

    fn set_will(&self, will: Option<Will>) {
        *self.will.lock() = will;
    }

    fn is_connected(&self) -> bool {
        self.link.lock().outbound.is_some()
    }

    async fn connect(&self, host: &str, port: u16) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_connected() {
            debug!("{} already connected", self.client_id);
            return Ok(());
        }

        let url = if host.contains(':') && !host.starts_with('[') {
            format!("ws://[{}]:{}/", host, port)
        } else {
            format!("ws://{}:{}/", host, port)
        };
        let (ws, _) = connect_async(url.as_str()).await?;
        let (mut ws_sender, mut ws_receiver) = ws.split();

        let hello = ClientFrame::Connect {
            client_id: self.client_id.clone(),
            will: self.will.lock().clone(),
        };
        ws_sender.send(WsMessage::text(hello.to_json()?)).await?;

        let ack = tokio::time::timeout(CONNACK_TIMEOUT, next_frame(&mut ws_receiver))
            .await
            .map_err(|_| Error::transport("broker did not acknowledge connect"))??;
        match ack {
            ServerFrame::ConnAck { .. } => {}
            ServerFrame::Error { reason } => return Err(Error::transport(reason)),
            other => {
                return Err(Error::transport(format!(
                    "unexpected frame before connack: {other:?}"
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut link = self.link.lock();
            link.generation += 1;
            link.outbound = Some(tx);
            link.generation
        };
        for stale in self.tasks.lock().drain(..) {
            stale.abort();
        }
        let writer = tokio::spawn(write_loop(rx, ws_sender));
        let reader = tokio::spawn(read_loop(
            self.client_id.clone(),
            ws_receiver,
            self.sink.clone(),
            LinkWatch {
                link: self.link.clone(),
                generation,
                link_lost: self.link_lost.clone(),
            },
        ));
        *self.tasks.lock() = vec![writer, reader];

        info!("{} connected to broker at {}", self.client_id, url);
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<()> {
        self.send_frame(ClientFrame::Publish(message))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.send_frame(ClientFrame::Subscribe {
            filter: filter.to_string(),
            qos,
        })
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.send_frame(ClientFrame::Unsubscribe {
            filter: filter.to_string(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let Some(tx) = self.link.lock().outbound.take() else {
            return Ok(());
        };
        let _ = tx.send(ClientFrame::Disconnect);
        drop(tx);

        let mut tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if let Some(writer) = tasks.first_mut() {
            if tokio::time::timeout(DRAIN_TIMEOUT, writer).await.is_err() {
                warn!("{} timed out flushing the control channel", self.client_id);
            }
        }
        for task in tasks {
            task.abort();
        }
        info!("{} disconnected from broker", self.client_id);
        Ok(())
    }
}

impl Drop for WsControlClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn next_frame(stream: &mut SplitStream<Ws>) -> Result<ServerFrame> {
    while let Some(msg) = stream.next().await {
        match msg? {
            WsMessage::Text(text) => return ServerFrame::from_json(text.as_str()),
            WsMessage::Close(_) => break,
            _ => continue,
        }
    }
    Err(Error::transport("broker closed the connection"))
}

async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<ClientFrame>,
    mut ws_sender: SplitSink<Ws, WsMessage>,
) {
    while let Some(frame) = rx.recv().await {
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("dropping unencodable frame: {}", e);
                continue;
            }
        };
        if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
            warn!("control channel write failed: {}", e);
            break;
        }
    }
    let _ = ws_sender.close().await;
}

/// What a reader needs to retire its link once the socket ends.
struct LinkWatch {
    link: Arc<Mutex<Link>>,
    generation: u64,
    link_lost: Arc<RwLock<Option<LinkLostSink>>>,
}

impl LinkWatch {
    /// Clears the link if it is still this reader's and nobody called
    /// `disconnect`, then reports the loss.
    fn lost(self, client_id: &str, reason: &str) {
        let dropped = {
            let mut link = self.link.lock();
            if link.generation == self.generation {
                link.outbound.take()
            } else {
                None
            }
        };
        if dropped.is_none() {
            return;
        }
        warn!("{} lost the broker connection: {}", client_id, reason);
        let link_lost = self.link_lost.read().clone();
        if let Some(link_lost) = link_lost {
            link_lost(reason);
        }
    }
}

async fn read_loop(
    client_id: String,
    mut stream: SplitStream<Ws>,
    sink: Arc<RwLock<Option<DeliverySink>>>,
    watch: LinkWatch,
) {
    let reason = loop {
        match next_frame(&mut stream).await {
            Ok(ServerFrame::Deliver(message)) => {
                let sink = sink.read().clone();
                match sink {
                    Some(sink) => sink(message),
                    None => debug!("no sink installed, dropping delivery on {}", message.topic),
                }
            }
            Ok(ServerFrame::Error { reason }) => warn!("broker reported: {}", reason),
            Ok(ServerFrame::ConnAck { .. }) => {}
            Err(Error::Decode(e)) => warn!("undecodable frame from broker: {}", e),
            Err(e) => {
                debug!("{} control channel read ended: {}", client_id, e);
                break e.to_string();
            }
        }
    };
    watch.lost(&client_id, &reason);
}
