//! Collaborator interfaces consumed by the bonding engine.
//!
//! The engine never touches sockets, packet framing, or key material. It asks
//! the node for the interface name behind a local socket and hands it fully
//! formed control payloads to frame, seal, and transmit. Timestamps are
//! supplied by callers on every operation, so the node's clock is the only
//! clock.

use std::net::SocketAddr;

/// Opaque handle of a bound local socket, assigned by the node.
pub type SocketId = i64;

/// Packet verbs the engine distinguishes for quality accounting and control
/// traffic. The node maps these onto its own wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Data frame.
    Frame,
    /// Extended data frame.
    ExtFrame,
    /// Heartbeat / RTT probe.
    Echo,
    /// Acknowledgement.
    Ack,
    /// QoS measurement report.
    QosMeasurement,
    /// Path negotiation petition.
    PathNegotiationRequest,
}

impl Verb {
    /// Verbs that count as user-visible frames for packet accounting.
    pub fn is_frame(self) -> bool {
        matches!(self, Verb::Frame | Verb::ExtFrame | Verb::Echo)
    }

    pub fn code(self) -> u8 {
        match self {
            Verb::Frame => 1,
            Verb::ExtFrame => 2,
            Verb::Echo => 3,
            Verb::Ack => 4,
            Verb::QosMeasurement => 5,
            Verb::PathNegotiationRequest => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Verb::Frame,
            2 => Verb::ExtFrame,
            3 => Verb::Echo,
            4 => Verb::Ack,
            5 => Verb::QosMeasurement,
            6 => Verb::PathNegotiationRequest,
            _ => return None,
        })
    }
}

/// Node services the engine depends on.
///
/// `send_control` is fire-and-forget: failures surface only as missing
/// samples, which degrade the path's quality scores naturally.
pub trait Transport: Send + Sync {
    /// Interface name owning the local socket, if the node knows it.
    fn ifname(&self, local_socket: SocketId) -> Option<String>;

    /// Frame, seal, and transmit an engine control packet.
    fn send_control(&self, local_socket: SocketId, remote: SocketAddr, verb: Verb, payload: &[u8]);
}

/// Identity and capability facts about the remote peer a bond serves.
#[derive(Debug, Clone)]
pub struct PeerContext {
    /// Our own node id (used for deterministic negotiation tie-breaks).
    pub local_node_id: u64,
    /// The remote peer's id.
    pub peer_id: u64,
    /// Remote protocol version; gates optional control traffic.
    pub remote_protocol_version: u8,
    /// Whether the peer negotiated multipath support at all.
    pub multipath_supported: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_codes_round_trip() {
        for verb in [
            Verb::Frame,
            Verb::ExtFrame,
            Verb::Echo,
            Verb::Ack,
            Verb::QosMeasurement,
            Verb::PathNegotiationRequest,
        ] {
            assert_eq!(Verb::from_code(verb.code()), Some(verb));
        }
        assert_eq!(Verb::from_code(0), None);
        assert_eq!(Verb::from_code(99), None);
    }

    #[test]
    fn test_frame_verbs() {
        assert!(Verb::Frame.is_frame());
        assert!(Verb::ExtFrame.is_frame());
        assert!(Verb::Echo.is_frame());
        assert!(!Verb::Ack.is_frame());
        assert!(!Verb::QosMeasurement.is_frame());
    }
}
