//! Handshake state machine
//!
//! The machine is pure: `Handshake::step` maps the current state and one
//! input to the next state plus a list of effects for the session driver to
//! carry out. It performs no I/O, so every transition can be exercised
//! without a network.
//!
//! Errors returned by `step` are recoverable protocol violations. The state
//! is left untouched and the driver only logs them; inputs that make the
//! handshake impossible to continue produce a `Closed` effect instead.

use std::collections::VecDeque;
use std::fmt;

use crate::signaling::message::{IceCandidate, SignalMessage};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    OfferSent,
    AwaitingOffer,
    AnswerExchanged,
    Ready,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::Connecting => "CONNECTING",
            SessionState::OfferSent => "OFFER_SENT",
            SessionState::AwaitingOffer => "AWAITING_OFFER",
            SessionState::AnswerExchanged => "ANSWER_EXCHANGED",
            SessionState::Ready => "READY",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally.
    Local,
    /// The peer sent `bye`.
    RemoteBye,
    /// The handshake did not reach `READY` in time.
    Timeout,
    /// The control stream ended.
    StreamClosed,
    /// The payload channel ended.
    ChannelClosed,
    /// Unrecoverable transport or protocol error.
    Failed(String),
}

impl CloseReason {
    /// Whether the owner should treat the close as a connection failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, CloseReason::Timeout | CloseReason::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `connect()` was called or an inbound control stream was accepted.
    Start,
    /// The control stream is established.
    StreamOpened,
    /// The transport produced the description requested by `CreateOffer` or
    /// `CreateAnswer`.
    LocalDescription(String),
    Signal(SignalMessage),
    LocalCandidate(IceCandidate),
    ChannelOpen,
    ChannelClosed,
    StreamClosed,
    Timeout,
    Failed(String),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(SignalMessage),
    CreateOffer,
    CreateAnswer,
    ApplyRemoteDescription(DescriptionKind, String),
    ApplyCandidate(IceCandidate),
    Ready,
    Closed(CloseReason),
}

#[derive(Debug)]
pub struct Handshake {
    role: Role,
    state: SessionState,
    stream_open: bool,
    offer_sent: bool,
    local_description: Option<String>,
    remote_description: Option<String>,
    pending_candidates: VecDeque<IceCandidate>,
    candidate_limit: usize,
}

impl Handshake {
    pub fn new(role: Role, candidate_limit: usize) -> Self {
        Self {
            role,
            state: SessionState::Idle,
            stream_open: false,
            offer_sent: false,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
            candidate_limit,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    pub fn remote_description(&self) -> Option<&str> {
        self.remote_description.as_deref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn step(&mut self, input: Input) -> Result<Vec<Effect>> {
        use SessionState::*;

        match input {
            Input::Start => match self.state {
                Idle => {
                    self.state = Connecting;
                    Ok(Vec::new())
                }
                other => Err(violation(format!("start requested in {other}"))),
            },

            Input::StreamOpened => match (self.state, self.role) {
                (Connecting, Role::Initiator) => {
                    self.stream_open = true;
                    Ok(vec![Effect::CreateOffer])
                }
                (Connecting, Role::Responder) => {
                    self.stream_open = true;
                    self.state = AwaitingOffer;
                    Ok(Vec::new())
                }
                (other, _) => Err(violation(format!("stream opened in {other}"))),
            },

            Input::LocalDescription(sdp) => match (self.state, self.role) {
                (Connecting, Role::Initiator) if !self.offer_sent => {
                    self.offer_sent = true;
                    self.local_description = Some(sdp.clone());
                    self.state = OfferSent;
                    Ok(vec![Effect::Send(SignalMessage::Offer { sdp })])
                }
                (AwaitingOffer, Role::Responder)
                    if self.remote_description.is_some() && self.local_description.is_none() =>
                {
                    self.local_description = Some(sdp.clone());
                    self.state = AnswerExchanged;
                    let mut effects = vec![Effect::Send(SignalMessage::Answer { sdp })];
                    effects.extend(self.drain_candidates());
                    Ok(effects)
                }
                (other, _) => Err(violation(format!("local description produced in {other}"))),
            },

            Input::Signal(message) => self.on_signal(message),

            Input::LocalCandidate(candidate) => {
                if self.state == Closed {
                    return Err(violation("local candidate after close".to_string()));
                }
                if self.local_description.is_none() {
                    return Err(violation(
                        "local candidate before local description".to_string(),
                    ));
                }
                Ok(vec![Effect::Send(SignalMessage::Candidate(candidate))])
            }

            Input::ChannelOpen => match self.state {
                AnswerExchanged => {
                    self.state = Ready;
                    Ok(vec![Effect::Ready])
                }
                Ready => Ok(Vec::new()),
                other => Err(violation(format!("payload channel opened in {other}"))),
            },

            Input::ChannelClosed => Ok(self.close_with(CloseReason::ChannelClosed, false)),
            Input::StreamClosed => {
                self.stream_open = false;
                Ok(self.close_with(CloseReason::StreamClosed, false))
            }
            Input::Failed(reason) => Ok(self.close_with(CloseReason::Failed(reason), false)),
            Input::Close => Ok(self.close_with(CloseReason::Local, true)),

            Input::Timeout => match self.state {
                Ready | Closed => Ok(Vec::new()),
                _ => Ok(self.close_with(CloseReason::Timeout, true)),
            },
        }
    }

    fn on_signal(&mut self, message: SignalMessage) -> Result<Vec<Effect>> {
        use SessionState::*;

        if self.state == Closed {
            return Err(violation(format!("{} received after close", message.kind())));
        }

        match message {
            SignalMessage::Offer { sdp } => {
                let acceptable = self.role == Role::Responder
                    && self.state == AwaitingOffer
                    && self.remote_description.is_none();
                if !acceptable {
                    return Err(violation(format!(
                        "unexpected offer in {} as {:?}",
                        self.state, self.role
                    )));
                }
                self.remote_description = Some(sdp.clone());
                Ok(vec![
                    Effect::ApplyRemoteDescription(DescriptionKind::Offer, sdp),
                    Effect::CreateAnswer,
                ])
            }

            SignalMessage::Answer { sdp } => {
                if self.role != Role::Initiator || self.state != OfferSent {
                    return Err(violation(format!("unexpected answer in {}", self.state)));
                }
                self.remote_description = Some(sdp.clone());
                self.state = AnswerExchanged;
                let mut effects = vec![Effect::ApplyRemoteDescription(DescriptionKind::Answer, sdp)];
                effects.extend(self.drain_candidates());
                Ok(effects)
            }

            SignalMessage::Candidate(candidate) => match self.state {
                AnswerExchanged | Ready => Ok(vec![Effect::ApplyCandidate(candidate)]),
                _ if self.pending_candidates.len() < self.candidate_limit => {
                    self.pending_candidates.push_back(candidate);
                    Ok(Vec::new())
                }
                _ => Err(violation(format!(
                    "candidate queue full ({}), dropping candidate",
                    self.candidate_limit
                ))),
            },

            SignalMessage::Bye => Ok(self.close_with(CloseReason::RemoteBye, false)),
        }
    }

    fn drain_candidates(&mut self) -> impl Iterator<Item = Effect> + '_ {
        self.pending_candidates.drain(..).map(Effect::ApplyCandidate)
    }

    fn close_with(&mut self, reason: CloseReason, say_bye: bool) -> Vec<Effect> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        self.state = SessionState::Closed;
        self.pending_candidates.clear();

        let mut effects = Vec::new();
        if say_bye && self.stream_open {
            effects.push(Effect::Send(SignalMessage::Bye));
        }
        effects.push(Effect::Closed(reason));
        effects
    }
}

fn violation(msg: String) -> Error {
    Error::SignalingProtocolViolation(msg)
}
