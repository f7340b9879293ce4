//! Signaling sessions
//!
//! A session owns one point-to-point WebSocket control stream and the payload
//! channel negotiated over it. Everything about a session is mutated by a
//! single driver task; `SessionHandle` only reads the published state and
//! posts commands, so it can be cloned and used from any thread.
//!
//! Lifecycle:
//! - `connect` spawns an initiator that dials `ws://host:port/`.
//! - `accept` spawns a responder over an already upgraded stream.
//! - The driver feeds stream messages, payload events, commands and the
//!   handshake deadline into `Handshake::step` and carries out the effects.
//! - Teardown releases the payload channel and the stream, publishes
//!   `CLOSED`, reports a `SessionEvent::Closed` and runs the `on_closed` hook.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::config::{Settings, SignalingSettings};
use crate::signaling::message::SignalMessage;
use crate::signaling::peer::{Frame, PeerEvent, PeerFactory};
use crate::signaling::state::{CloseReason, Effect, Handshake, Input, Role, SessionState};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub candidate_queue_limit: usize,
    pub pending_frame_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Settings::default().signaling)
    }
}

impl From<&SignalingSettings> for SessionConfig {
    fn from(s: &SignalingSettings) -> Self {
        Self {
            handshake_timeout: Duration::from_millis(s.handshake_timeout_ms),
            candidate_queue_limit: s.candidate_queue_limit,
            pending_frame_limit: s.pending_frame_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ready {
        id: Uuid,
        peer: String,
    },
    Closed {
        id: Uuid,
        peer: String,
        reason: CloseReason,
    },
}

pub type FrameSink = Arc<dyn Fn(Frame) + Send + Sync>;
pub type SessionEventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;
pub type ClosedHook = Box<dyn FnOnce(Uuid) + Send>;

/// Callbacks a session reports through. All are invoked from the driver task.
#[derive(Default)]
pub struct SessionHooks {
    pub on_frame: Option<FrameSink>,
    pub on_event: Option<SessionEventSink>,
    pub on_closed: Option<ClosedHook>,
}

enum Command {
    Send(Frame),
    Close,
}

struct Shared {
    id: Uuid,
    role: Role,
    peer: String,
    state: watch::Receiver<SessionState>,
    commands: mpsc::UnboundedSender<Command>,
}

#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Shared>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// `host:port` of the remote side.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Queues a frame. Frames sent before `READY` are held (bounded) and
    /// flushed once the payload channel opens.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.inner
            .commands
            .send(Command::Send(frame))
            .map_err(|_| Error::SessionClosed)
    }

    /// Requests teardown. Idempotent and never blocks.
    pub fn close(&self) {
        let _ = self.inner.commands.send(Command::Close);
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.state.clone();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed)),
        )
        .await;
        match waited {
            Ok(Ok(state)) if *state == SessionState::Ready => Ok(()),
            Ok(_) => Err(Error::SessionClosed),
            Err(_) => Err(Error::HandshakeTimeout(timeout.as_millis() as u64)),
        }
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.inner.state.clone();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// Starts an initiator session towards `host:port`. Must be called from
/// within a Tokio runtime; the handshake runs in a spawned task.
pub fn connect(
    host: &str,
    port: u16,
    config: SessionConfig,
    factory: Arc<dyn PeerFactory>,
    hooks: SessionHooks,
) -> SessionHandle {
    let peer = format_peer(host, port);
    let url = format!("ws://{}/", peer);
    let (handle, mut driver) = Driver::new(Role::Initiator, peer, config, factory, hooks);

    tokio::spawn(async move {
        if let Err(e) = driver.machine.step(Input::Start) {
            warn!("[{}] {}", driver.id, e);
        }
        driver.publish_state();
        debug!("[{}] dialing {}", driver.id, url);

        let connecting = connect_async(url);
        tokio::pin!(connecting);

        let ws = loop {
            tokio::select! {
                res = &mut connecting => match res {
                    Ok((ws, _)) => break ws,
                    Err(e) => return driver.close_before_stream(Input::Failed(e.to_string())),
                },
                _ = sleep_until(driver.deadline) => {
                    return driver.close_before_stream(Input::Timeout);
                }
                cmd = driver.commands.recv() => match cmd {
                    Some(Command::Send(frame)) => driver.queue_frame(frame),
                    Some(Command::Close) | None => return driver.close_before_stream(Input::Close),
                },
            }
        };

        driver.run(ws).await;
    });

    handle
}

/// Starts a responder session over an accepted control stream.
pub fn accept<S>(
    ws: WebSocketStream<S>,
    peer: String,
    config: SessionConfig,
    factory: Arc<dyn PeerFactory>,
    hooks: SessionHooks,
) -> SessionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (handle, mut driver) = Driver::new(Role::Responder, peer, config, factory, hooks);

    tokio::spawn(async move {
        if let Err(e) = driver.machine.step(Input::Start) {
            warn!("[{}] {}", driver.id, e);
        }
        driver.publish_state();
        driver.run(ws).await;
    });

    handle
}

fn format_peer(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

struct Driver {
    id: Uuid,
    peer: String,
    machine: Handshake,
    state_tx: watch::Sender<SessionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    pending_frames: VecDeque<Frame>,
    pending_limit: usize,
    deadline: Instant,
    factory: Arc<dyn PeerFactory>,
    hooks: SessionHooks,
}

impl Driver {
    fn new(
        role: Role,
        peer: String,
        config: SessionConfig,
        factory: Arc<dyn PeerFactory>,
        hooks: SessionHooks,
    ) -> (SessionHandle, Driver) {
        let id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            inner: Arc::new(Shared {
                id,
                role,
                peer: peer.clone(),
                state: state_rx,
                commands: commands_tx,
            }),
        };
        let driver = Driver {
            id,
            peer,
            machine: Handshake::new(role, config.candidate_queue_limit),
            state_tx,
            commands: commands_rx,
            pending_frames: VecDeque::new(),
            pending_limit: config.pending_frame_limit,
            deadline: Instant::now() + config.handshake_timeout,
            factory,
            hooks,
        };
        (handle, driver)
    }

    fn publish_state(&self) {
        let next = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current != next {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    fn queue_frame(&mut self, frame: Frame) {
        if self.pending_frames.len() >= self.pending_limit {
            warn!(
                "[{}] pending frame queue full ({}), dropping oldest frame",
                self.id, self.pending_limit
            );
            self.pending_frames.pop_front();
        }
        self.pending_frames.push_back(frame);
    }

    fn close_before_stream(mut self, input: Input) {
        let reason = match self.machine.step(input) {
            Ok(effects) => effects.into_iter().find_map(|e| match e {
                Effect::Closed(reason) => Some(reason),
                _ => None,
            }),
            Err(e) => {
                warn!("[{}] {}", self.id, e);
                None
            }
        };
        self.finish(reason.unwrap_or(CloseReason::Local));
    }

    async fn run<S>(mut self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut peer = self.factory.create(self.machine.role(), events_tx);
        let (mut sink, mut stream) = ws.split();
        let mut inputs = VecDeque::from([Input::StreamOpened]);

        loop {
            while let Some(input) = inputs.pop_front() {
                let effects = match self.machine.step(input) {
                    Ok(effects) => effects,
                    Err(e) => {
                        warn!("[{}] ignoring: {}", self.id, e);
                        continue;
                    }
                };
                self.publish_state();

                for effect in effects {
                    match effect {
                        Effect::Send(message) => {
                            if let Err(e) = send_signal(&mut sink, &message).await {
                                inputs.push_back(Input::Failed(e.to_string()));
                            }
                        }
                        Effect::CreateOffer => match peer.create_offer().await {
                            Ok(sdp) => inputs.push_back(Input::LocalDescription(sdp)),
                            Err(e) => inputs.push_back(Input::Failed(e.to_string())),
                        },
                        Effect::CreateAnswer => match peer.create_answer().await {
                            Ok(sdp) => inputs.push_back(Input::LocalDescription(sdp)),
                            Err(e) => inputs.push_back(Input::Failed(e.to_string())),
                        },
                        Effect::ApplyRemoteDescription(kind, sdp) => {
                            if let Err(e) = peer.set_remote_description(kind, &sdp).await {
                                inputs.push_back(Input::Failed(e.to_string()));
                            }
                        }
                        Effect::ApplyCandidate(candidate) => {
                            if let Err(e) = peer.add_ice_candidate(&candidate).await {
                                warn!("[{}] candidate rejected: {}", self.id, e);
                            }
                        }
                        Effect::Ready => {
                            info!("[{}] session with {} is ready", self.id, self.peer);
                            self.emit(SessionEvent::Ready {
                                id: self.id,
                                peer: self.peer.clone(),
                            });
                            while let Some(frame) = self.pending_frames.pop_front() {
                                if let Err(e) = peer.send(&frame).await {
                                    inputs.push_back(Input::Failed(e.to_string()));
                                    break;
                                }
                            }
                        }
                        Effect::Closed(reason) => {
                            peer.close().await;
                            let _ = sink.close().await;
                            self.finish(reason);
                            return;
                        }
                    }
                }
            }

            let ready = self.machine.state() == SessionState::Ready;
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => match SignalMessage::from_json(text.as_str()) {
                        Ok(message) => inputs.push_back(Input::Signal(message)),
                        Err(e) => warn!("[{}] ignoring undecodable signal: {}", self.id, e),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => inputs.push_back(Input::StreamClosed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => inputs.push_back(Input::Failed(e.to_string())),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(frame)) if ready => {
                        if let Err(e) = peer.send(&frame).await {
                            inputs.push_back(Input::Failed(e.to_string()));
                        }
                    }
                    Some(Command::Send(frame)) => self.queue_frame(frame),
                    Some(Command::Close) | None => inputs.push_back(Input::Close),
                },
                Some(event) = events_rx.recv() => match event {
                    PeerEvent::LocalCandidate(candidate) => inputs.push_back(Input::LocalCandidate(candidate)),
                    PeerEvent::ChannelOpen => inputs.push_back(Input::ChannelOpen),
                    PeerEvent::Frame(frame) => {
                        if let Some(on_frame) = &self.hooks.on_frame {
                            on_frame(frame);
                        }
                    }
                    PeerEvent::ChannelClosed => inputs.push_back(Input::ChannelClosed),
                    PeerEvent::Failed(reason) => inputs.push_back(Input::Failed(reason)),
                },
                _ = sleep_until(self.deadline), if !ready => inputs.push_back(Input::Timeout),
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(on_event) = &self.hooks.on_event {
            on_event(event);
        }
    }

    fn finish(mut self, reason: CloseReason) {
        self.state_tx.send_replace(SessionState::Closed);

        if !self.pending_frames.is_empty() {
            debug!(
                "[{}] discarding {} undelivered frames",
                self.id,
                self.pending_frames.len()
            );
            self.pending_frames.clear();
        }

        if reason.is_failure() {
            warn!("[{}] session with {} failed: {:?}", self.id, self.peer, reason);
        } else {
            info!("[{}] session with {} closed: {:?}", self.id, self.peer, reason);
        }

        self.emit(SessionEvent::Closed {
            id: self.id,
            peer: self.peer.clone(),
            reason,
        });
        if let Some(on_closed) = self.hooks.on_closed.take() {
            on_closed(self.id);
        }
    }
}

async fn send_signal<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    message: &SignalMessage,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = message.to_json()?;
    sink.send(WsMessage::text(text)).await?;
    Ok(())
}
