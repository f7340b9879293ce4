//! Connection-oriented payload transport.
//!
//! `PeerConnection` is the seam between the signaling driver and whatever
//! carries the payload once the handshake is done. The driver asks it for
//! local descriptions, hands it the remote description and candidates, and
//! listens on a `PeerEvent` channel for candidates, channel state and frames.
//!
//! `DirectPeer` is the implementation shipped with the crate: the responder
//! opens a TCP listener while answering and advertises it as a host
//! candidate, and the initiator dials that candidate. Frames travel with a
//! fixed header carrying the frame kind and video coordinates.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::signaling::message::IceCandidate;
use crate::signaling::state::{DescriptionKind, Role};
use crate::{Error, Result};

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Opaque message bytes.
    Message,
    /// An encoded video frame with its coordinates.
    Video,
}

impl FrameKind {
    fn to_wire(self) -> u8 {
        match self {
            FrameKind::Message => 0,
            FrameKind::Video => 1,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Message),
            1 => Some(FrameKind::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub kind: FrameKind,
    pub width: u32,
    pub height: u32,
}

impl FrameMeta {
    pub const fn message() -> Self {
        Self {
            kind: FrameKind::Message,
            width: 0,
            height: 0,
        }
    }

    pub const fn video(width: u32, height: u32) -> Self {
        Self {
            kind: FrameKind::Video,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub meta: FrameMeta,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(meta: FrameMeta, data: impl Into<Vec<u8>>) -> Self {
        Self {
            meta,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    ChannelOpen,
    Frame(Frame),
    ChannelClosed,
    Failed(String),
}

#[async_trait]
pub trait PeerConnection: Send {
    async fn create_offer(&mut self) -> Result<String>;

    async fn create_answer(&mut self) -> Result<String>;

    async fn set_remote_description(&mut self, kind: DescriptionKind, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;

    async fn send(&mut self, frame: &Frame) -> Result<()>;

    /// Releases the payload channel. Must be safe to call more than once.
    async fn close(&mut self);
}

pub trait PeerFactory: Send + Sync {
    fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Box<dyn PeerConnection>;
}

/// Builds `DirectPeer`s that advertise `advertise_host` in their candidates.
#[derive(Debug, Clone)]
pub struct DirectPeerFactory {
    advertise_host: String,
}

impl DirectPeerFactory {
    pub fn new(advertise_host: impl Into<String>) -> Self {
        Self {
            advertise_host: advertise_host.into(),
        }
    }
}

impl PeerFactory for DirectPeerFactory {
    fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Box<dyn PeerConnection> {
        Box::new(DirectPeer::new(role, self.advertise_host.clone(), events))
    }
}

type SharedWriter = Arc<Mutex<Option<OwnedWriteHalf>>>;

pub struct DirectPeer {
    role: Role,
    session_id: String,
    advertise_host: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    writer: SharedWriter,
    remote: Option<String>,
    dialing: bool,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DirectPeer {
    pub fn new(
        role: Role,
        advertise_host: String,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            role,
            session_id: Uuid::new_v4().simple().to_string(),
            advertise_host,
            events,
            writer: Arc::new(Mutex::new(None)),
            remote: None,
            dialing: false,
            shutdown,
            tasks: Vec::new(),
        }
    }

    fn description(&self, setup: &str) -> String {
        format!(
            "v=0\r\no=- {} 0 IN IP4 {}\r\ns=meshsub\r\nt=0 0\r\nm=application 9 TCP meshsub-frames\r\na=setup:{}\r\n",
            self.session_id, self.advertise_host, setup
        )
    }
}

#[async_trait]
impl PeerConnection for DirectPeer {
    async fn create_offer(&mut self) -> Result<String> {
        if self.role != Role::Initiator {
            return Err(Error::SignalingProtocolViolation(
                "only the initiator creates an offer".to_string(),
            ));
        }
        Ok(self.description("active"))
    }

    async fn create_answer(&mut self) -> Result<String> {
        if self.role != Role::Responder || self.remote.is_none() {
            return Err(Error::SignalingProtocolViolation(
                "answer requested without a remote offer".to_string(),
            ));
        }

        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        debug!("payload channel listening on port {}", port);

        let task = tokio::spawn(accept_channel(
            listener,
            self.writer.clone(),
            self.events.clone(),
            self.shutdown.subscribe(),
        ));
        self.tasks.push(task);

        let candidate = IceCandidate {
            label: 0,
            id: "0".to_string(),
            candidate: format!(
                "candidate:1 1 tcp 2122260223 {} {} typ host tcptype passive",
                self.advertise_host, port
            ),
        };
        let _ = self.events.send(PeerEvent::LocalCandidate(candidate));

        Ok(self.description("passive"))
    }

    async fn set_remote_description(&mut self, kind: DescriptionKind, sdp: &str) -> Result<()> {
        let expected = match self.role {
            Role::Initiator => DescriptionKind::Answer,
            Role::Responder => DescriptionKind::Offer,
        };
        if kind != expected || !sdp.starts_with("v=0") {
            return Err(Error::SignalingProtocolViolation(format!(
                "unusable remote {:?} description",
                kind
            )));
        }
        self.remote = Some(sdp.to_string());
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        if self.role == Role::Responder {
            // The responder is the passive side and never dials.
            return Ok(());
        }
        if self.dialing {
            debug!("already dialing, ignoring extra candidate");
            return Ok(());
        }
        let (host, port) = parse_host_candidate(&candidate.candidate)?;
        self.dialing = true;

        let task = tokio::spawn(dial_channel(
            host,
            port,
            self.writer.clone(),
            self.events.clone(),
            self.shutdown.subscribe(),
        ));
        self.tasks.push(task);
        Ok(())
    }

    async fn send(&mut self, frame: &Frame) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::SessionClosed)?;
        write_frame(writer, frame).await
    }

    async fn close(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Extracts `(host, port)` from a host candidate line.
pub fn parse_host_candidate(line: &str) -> Result<(String, u16)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 || !fields[0].starts_with("candidate:") || fields[7] != "host" {
        return Err(Error::SignalingProtocolViolation(format!(
            "unsupported candidate: {line}"
        )));
    }
    let port = fields[5]
        .parse::<u16>()
        .map_err(|_| Error::SignalingProtocolViolation(format!("bad candidate port: {line}")))?;
    Ok((fields[4].to_string(), port))
}

async fn accept_channel(
    listener: TcpListener,
    writer: SharedWriter,
    events: mpsc::UnboundedSender<PeerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let accepted = tokio::select! {
        res = listener.accept() => res,
        _ = shutdown.changed() => return,
    };
    match accepted {
        Ok((stream, addr)) => {
            debug!("payload channel accepted from {}", addr);
            run_channel(stream, writer, events, shutdown).await;
        }
        Err(e) => {
            let _ = events.send(PeerEvent::Failed(e.to_string()));
        }
    }
}

async fn dial_channel(
    host: String,
    port: u16,
    writer: SharedWriter,
    events: mpsc::UnboundedSender<PeerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let connected = tokio::select! {
        res = TcpStream::connect((host.as_str(), port)) => res,
        _ = shutdown.changed() => return,
    };
    match connected {
        Ok(stream) => run_channel(stream, writer, events, shutdown).await,
        Err(e) => {
            warn!("payload channel to {}:{} failed: {}", host, port, e);
            let _ = events.send(PeerEvent::Failed(e.to_string()));
        }
    }
}

async fn run_channel(
    stream: TcpStream,
    writer: SharedWriter,
    events: mpsc::UnboundedSender<PeerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, write_half) = stream.into_split();
    *writer.lock().await = Some(write_half);
    let _ = events.send(PeerEvent::ChannelOpen);

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(frame)) => {
                    if events.send(PeerEvent::Frame(frame)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = events.send(PeerEvent::ChannelClosed);
                    break;
                }
                Err(e) => {
                    let _ = events.send(PeerEvent::Failed(e.to_string()));
                    break;
                }
            },
            // Local close: the read is abandoned, not reported.
            _ = shutdown.changed() => break,
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.data.len() > MAX_FRAME_LEN {
        return Err(Error::Encode(format!(
            "frame of {} bytes exceeds {} bytes",
            frame.data.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + frame.data.len());
    buf.push(frame.meta.kind.to_wire());
    buf.extend_from_slice(&frame.meta.width.to_be_bytes());
    buf.extend_from_slice(&frame.meta.height.to_be_bytes());
    buf.extend_from_slice(&(frame.data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.data);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame; `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let kind = match reader.read_u8().await {
        Ok(kind) => kind,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let kind = FrameKind::from_wire(kind)
        .ok_or_else(|| Error::Decode(format!("unknown frame kind {kind}")))?;
    let width = reader.read_u32().await?;
    let height = reader.read_u32().await?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Decode(format!("frame length {len} exceeds limit")));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(Frame {
        meta: FrameMeta {
            kind,
            width,
            height,
        },
        data,
    }))
}
