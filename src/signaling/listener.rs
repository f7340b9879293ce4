//! Per-topic listening endpoint.
//!
//! A `Listener` accepts inbound control streams for one subscribed topic and
//! runs a responder session on each. Its bound port is what discovery
//! advertises for the topic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Result;
use crate::signaling::peer::PeerFactory;
use crate::signaling::session::{
    self, FrameSink, SessionConfig, SessionEventSink, SessionHandle, SessionHooks,
};

type SessionMap = Arc<Mutex<HashMap<Uuid, SessionHandle>>>;

pub struct Listener {
    topic: String,
    port: u16,
    sessions: SessionMap,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("topic", &self.topic)
            .field("port", &self.port)
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl Listener {
    /// Binds an ephemeral port on all interfaces and starts accepting.
    pub async fn bind(
        topic: &str,
        config: SessionConfig,
        factory: Arc<dyn PeerFactory>,
        on_frame: FrameSink,
        on_event: Option<SessionEventSink>,
    ) -> Result<Listener> {
        let tcp = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = tcp.local_addr()?.port();
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!("signaling listener for '{}' on port {}", topic, port);

        tokio::spawn(accept_loop(
            tcp,
            topic.to_string(),
            shutdown_rx,
            sessions.clone(),
            Context {
                config,
                factory,
                on_frame,
                on_event,
            },
        ));

        Ok(Listener {
            topic: topic.to_string(),
            port,
            sessions,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Snapshot of the sessions currently open on this endpoint.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Stops accepting and closes every open session. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let sessions: Vec<SessionHandle> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        debug!(
            "stopping listener for '{}', closing {} sessions",
            self.topic,
            sessions.len()
        );
        for session in sessions {
            session.close();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct Context {
    config: SessionConfig,
    factory: Arc<dyn PeerFactory>,
    on_frame: FrameSink,
    on_event: Option<SessionEventSink>,
}

async fn accept_loop(
    tcp: TcpListener,
    topic: String,
    mut shutdown: watch::Receiver<bool>,
    sessions: SessionMap,
    ctx: Context,
) {
    loop {
        let accepted = tokio::select! {
            res = tcp.accept() => res,
            _ = shutdown.changed() => break,
        };
        match accepted {
            Ok((stream, addr)) => {
                tokio::spawn(upgrade(
                    stream,
                    addr,
                    shutdown.clone(),
                    sessions.clone(),
                    ctx.clone(),
                ));
            }
            Err(e) => {
                error!("accept failed on listener for '{}': {}", topic, e);
                break;
            }
        }
    }
    debug!("listener for '{}' stopped accepting", topic);
}

async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
    sessions: SessionMap,
    ctx: Context,
) {
    let ws = match tokio::time::timeout(ctx.config.handshake_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("websocket handshake with {} failed: {}", addr, e);
            return;
        }
        Err(_) => {
            warn!("websocket handshake with {} timed out", addr);
            return;
        }
    };

    let registry = sessions.clone();
    let hooks = SessionHooks {
        on_frame: Some(ctx.on_frame),
        on_event: ctx.on_event,
        on_closed: Some(Box::new(move |id| {
            registry.lock().remove(&id);
        })),
    };
    let handle = session::accept(ws, addr.to_string(), ctx.config, ctx.factory, hooks);

    if *shutdown.borrow() {
        handle.close();
        return;
    }
    sessions.lock().insert(handle.id(), handle.clone());
    // The session may have finished before it was registered.
    if handle.is_closed() {
        sessions.lock().remove(&handle.id());
    }
}
