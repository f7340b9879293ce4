use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::Result;
use crate::broker::Broker;
use crate::client::Client;
use crate::transport::message::{ClientFrame, ServerFrame};

/// WebSocket front end of the control broker.
pub struct BrokerServer {
    listener: TcpListener,
    broker: Arc<Mutex<Broker>>,
}

impl BrokerServer {
    pub async fn bind(addr: &str, broker: Arc<Mutex<Broker>>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("control broker listening on ws://{}", listener.local_addr()?);
        Ok(Self { listener, broker })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broker(&self) -> Arc<Mutex<Broker>> {
        self.broker.clone()
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    spawn(handle_connection(stream, addr, self.broker.clone()));
                }
                Err(e) => {
                    error!("control broker accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Runs one client connection. The first frame must be `connect`; the
/// connection ends on `disconnect`, on a close frame or on a socket error.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, broker: Arc<Mutex<Broker>>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake error from {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let client_id = match ws_receiver.next().await {
        Some(Ok(WsMessage::Text(text))) => match ClientFrame::from_json(text.as_str()) {
            Ok(ClientFrame::Connect { client_id, will }) => {
                let (tx, rx) = mpsc::unbounded_channel::<ServerFrame>();
                let client = Client::with_id(client_id.clone(), tx.clone()).with_will(will);
                broker.lock().register_client(client);
                let _ = tx.send(ServerFrame::ConnAck {
                    client_id: client_id.clone(),
                });
                spawn(forward_frames(client_id.clone(), rx, ws_sender));
                client_id
            }
            Ok(other) => {
                warn!("{} sent {:?} before connect", addr, other);
                let _ = reject(&mut ws_sender, "expected connect").await;
                return;
            }
            Err(e) => {
                warn!("invalid first frame from {}: {}", addr, e);
                let _ = reject(&mut ws_sender, "invalid frame").await;
                return;
            }
        },
        _ => {
            debug!("{} went away before connecting", addr);
            return;
        }
    };

    info!("{} connected from {}", client_id, addr);

    let mut graceful = false;
    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("read error from {}: {}", client_id, e);
                break;
            }
        };

        match ClientFrame::from_json(text.as_str()) {
            Ok(ClientFrame::Subscribe { filter, qos }) => {
                broker.lock().subscribe(&filter, client_id.clone(), qos);
                debug!("{} subscribed to {}", client_id, filter);
            }
            Ok(ClientFrame::Unsubscribe { filter }) => {
                broker.lock().unsubscribe(&filter, &client_id);
                debug!("{} unsubscribed from {}", client_id, filter);
            }
            Ok(ClientFrame::Publish(message)) => {
                debug!("{} published to {}", client_id, message.topic);
                broker.lock().publish(message);
            }
            Ok(ClientFrame::Disconnect) => {
                graceful = true;
                break;
            }
            Ok(ClientFrame::Connect { .. }) => {
                warn!("{} sent a second connect, ignoring", client_id);
            }
            Err(err) => {
                warn!("invalid client message from {}: {}", client_id, err);
            }
        }
    }

    info!("{} disconnected", client_id);
    broker.lock().cleanup_client(&client_id, graceful);
}

async fn forward_frames<S>(
    client_id: String,
    mut rx: mpsc::UnboundedReceiver<ServerFrame>,
    mut ws_sender: S,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = rx.recv().await {
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("failed to encode frame for {}: {}", client_id, e);
                continue;
            }
        };
        if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
            warn!("failed to send message to {}: {}", client_id, e);
            break;
        }
    }
    let _ = ws_sender.close().await;
    debug!("send loop closed for {}", client_id);
}

async fn reject<S>(ws_sender: &mut S, reason: &str) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
{
    let frame = ServerFrame::Error {
        reason: reason.to_string(),
    };
    let _ = ws_sender.send(WsMessage::text(frame.to_json()?)).await;
    let _ = ws_sender.close().await;
    Ok(())
}
