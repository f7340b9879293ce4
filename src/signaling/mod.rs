//! Point-to-point session establishment for connection-oriented protocols.
//!
//! - `message`: the JSON signaling messages (offer, answer, candidate, bye).
//! - `state`: the pure handshake state machine.
//! - `peer`: the payload transport negotiated by the handshake.
//! - `session`: the driver task and the `SessionHandle` owners hold.
//! - `listener`: the per-topic endpoint accepting responder sessions.

pub mod listener;
pub mod message;
pub mod peer;
pub mod session;
pub mod state;

pub use listener::Listener;
pub use message::{IceCandidate, SignalMessage};
pub use peer::{DirectPeerFactory, Frame, FrameKind, FrameMeta, PeerConnection, PeerEvent, PeerFactory};
pub use session::{SessionConfig, SessionEvent, SessionHandle, SessionHooks};
pub use state::{CloseReason, Role, SessionState};
