//! Error types for the routing layer

use thiserror::Error;

use reto_core::{DecodeError, PeerIdentifier};
use reto_transport::link::LinkError;

/// Errors during the handshake exchange on a fresh direct link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("timed out waiting for handshake")]
    Timeout,

    #[error("handshake purpose mismatch")]
    PurposeMismatch,

    #[error("unexpected handshake packet")]
    UnexpectedPacket,

    #[error("undecodable handshake: {0}")]
    Decode(#[from] DecodeError),

    #[error("link failed during handshake: {0}")]
    Link(#[from] LinkError),
}

/// Errors establishing or operating routed connections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("destination set is empty")]
    EmptyDestinationSet,

    #[error("destination {0} is unreachable")]
    Unreachable(PeerIdentifier),

    #[error("no route for destination {0}")]
    NoRouteForDestination(PeerIdentifier),

    #[error("peer {0} is not known")]
    UnknownPeer(PeerIdentifier),

    #[error("connection partially established; missing confirmations from {missing:?}")]
    PartiallyEstablished { missing: Vec<PeerIdentifier> },

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("link error: {0}")]
    Link(#[from] LinkError),
}
