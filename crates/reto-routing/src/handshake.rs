//! Handshake exchange on fresh direct links
//!
//! Handshakes run on the raw link before a packet connection wraps it: the
//! dialer announces itself and the link's purpose, the acceptor classifies
//! the link and echoes its own handshake back. Routed links additionally
//! carry the connection identifier and the multicast handshake downstream.
//! A link that stays silent past the timeout is torn down by the caller.

use std::time::Duration;

use reto_core::wire::Packet;
use reto_transport::link::{LinkError, LinkEvent};
use tokio::sync::mpsc;

use crate::error::HandshakeError;

/// Receive and decode one frame, bounded by `timeout`
pub(crate) async fn expect_frame(
    events: &mut mpsc::Receiver<LinkEvent>,
    timeout: Duration,
) -> Result<Packet, HandshakeError> {
    match tokio::time::timeout(timeout, events.recv()).await {
        Err(_) => Err(HandshakeError::Timeout),
        Ok(None) => Err(HandshakeError::Link(LinkError::ClosedByPeer)),
        Ok(Some(LinkEvent::Closed(error))) => Err(HandshakeError::Link(
            error.unwrap_or(LinkError::ClosedByPeer),
        )),
        Ok(Some(LinkEvent::Message(frame))) => Ok(Packet::deserialize(&frame)?),
    }
}
