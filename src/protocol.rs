//! Transport protocol identifiers and delivery QoS.
//!
//! Every protocol owns a distinct bit so callers can request several at once
//! through a `ProtocolSet`. The bit values travel on the wire inside discovery
//! announcements and must not change.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Protocol {
    /// Broker-mediated delivery over the control channel.
    Broker = 0x01,
    /// Raw stream socket.
    Stream = 0x02,
    /// Raw datagram socket.
    Datagram = 0x04,
    /// Encrypted stream socket.
    SecureStream = 0x08,
    /// Peer-to-peer data/video channel negotiated through signaling.
    PeerRtc = 0x10,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Broker,
        Protocol::Stream,
        Protocol::Datagram,
        Protocol::SecureStream,
        Protocol::PeerRtc,
    ];

    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Maps a single wire value back to a protocol; combined masks and
    /// unknown bits yield `None`.
    pub fn from_bits(value: u32) -> Option<Protocol> {
        Self::ALL.into_iter().find(|p| p.bits() == value)
    }

    /// Connection-oriented protocols need a signaling session before payload
    /// can flow.
    pub const fn is_connection_oriented(self) -> bool {
        matches!(self, Protocol::PeerRtc)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Protocol::Broker => "broker",
            Protocol::Stream => "stream",
            Protocol::Datagram => "datagram",
            Protocol::SecureStream => "secure-stream",
            Protocol::PeerRtc => "peer-rtc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown protocol '{s}'"))
    }
}

/// A bitmask of protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProtocolSet(u32);

impl ProtocolSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Keeps only the bits that name a known protocol.
    pub fn from_bits_truncate(bits: u32) -> Self {
        let known = Protocol::ALL.iter().fold(0, |acc, p| acc | p.bits());
        Self(bits & known)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, protocol: Protocol) -> bool {
        self.0 & protocol.bits() != 0
    }

    pub fn insert(&mut self, protocol: Protocol) {
        self.0 |= protocol.bits();
    }

    pub fn remove(&mut self, protocol: Protocol) {
        self.0 &= !protocol.bits();
    }

    pub fn iter(self) -> impl Iterator<Item = Protocol> {
        Protocol::ALL.into_iter().filter(move |p| self.contains(*p))
    }

    /// Splits the set into its connectionless part and its connection-oriented
    /// part so the two never share a send.
    pub fn split_connection_oriented(self) -> (ProtocolSet, ProtocolSet) {
        self.iter().fold(
            (ProtocolSet::empty(), ProtocolSet::empty()),
            |(mut direct, mut oriented), p| {
                if p.is_connection_oriented() {
                    oriented.insert(p);
                } else {
                    direct.insert(p);
                }
                (direct, oriented)
            },
        )
    }
}

impl From<Protocol> for ProtocolSet {
    fn from(p: Protocol) -> Self {
        Self(p.bits())
    }
}

impl FromIterator<Protocol> for ProtocolSet {
    fn from_iter<I: IntoIterator<Item = Protocol>>(iter: I) -> Self {
        let mut set = ProtocolSet::empty();
        for p in iter {
            set.insert(p);
        }
        set
    }
}

impl BitOr for Protocol {
    type Output = ProtocolSet;

    fn bitor(self, rhs: Protocol) -> ProtocolSet {
        ProtocolSet(self.bits() | rhs.bits())
    }
}

impl BitOr<Protocol> for ProtocolSet {
    type Output = ProtocolSet;

    fn bitor(self, rhs: Protocol) -> ProtocolSet {
        ProtocolSet(self.0 | rhs.bits())
    }
}

/// Delivery guarantee requested from the underlying transport. The routing
/// core passes it through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(Protocol::Broker.bits(), 1);
        assert_eq!(Protocol::Stream.bits(), 2);
        assert_eq!(Protocol::Datagram.bits(), 4);
        assert_eq!(Protocol::SecureStream.bits(), 8);
        assert_eq!(Protocol::PeerRtc.bits(), 16);
    }

    #[test]
    fn from_bits_rejects_masks_and_unknown_values() {
        assert_eq!(Protocol::from_bits(16), Some(Protocol::PeerRtc));
        assert_eq!(Protocol::from_bits(3), None);
        assert_eq!(Protocol::from_bits(64), None);
        assert_eq!(Protocol::from_bits(0), None);
    }

    #[test]
    fn only_peer_rtc_is_connection_oriented() {
        let oriented: Vec<_> = Protocol::ALL
            .into_iter()
            .filter(|p| p.is_connection_oriented())
            .collect();
        assert_eq!(oriented, vec![Protocol::PeerRtc]);
    }

    #[test]
    fn split_separates_peer_rtc() {
        let set = Protocol::Broker | Protocol::PeerRtc | Protocol::Datagram;
        let (direct, oriented) = set.split_connection_oriented();
        assert_eq!(direct, Protocol::Broker | Protocol::Datagram);
        assert_eq!(oriented, ProtocolSet::from(Protocol::PeerRtc));
    }

    #[test]
    fn set_iterates_in_bit_order() {
        let set: ProtocolSet = [Protocol::PeerRtc, Protocol::Broker].into_iter().collect();
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![Protocol::Broker, Protocol::PeerRtc]
        );
        assert!(ProtocolSet::from_bits_truncate(0x80).is_empty());
    }

    #[test]
    fn protocol_names_parse_back() {
        for p in Protocol::ALL {
            assert_eq!(p.name().parse::<Protocol>(), Ok(p));
        }
        assert!("carrier-pigeon".parse::<Protocol>().is_err());
    }
}
