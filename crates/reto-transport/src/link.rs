//! Underlying link contract
//!
//! A link is a bidirectional pipe for discrete frames. Transports hand an
//! open link over as a [`LinkChannel`]: the send half as a trait object, the
//! receive half as an event stream. Whoever owns the channel owns the link.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by an underlying link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("failed to open link: {0}")]
    OpenFailed(String),

    #[error("link closed by peer")]
    ClosedByPeer,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Events emitted by an underlying link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// One discrete inbound frame
    Message(Bytes),
    /// The link is gone; `None` means a clean close
    Closed(Option<LinkError>),
}

/// Send half of a bidirectional framed packet pipe
#[async_trait]
pub trait Link: Send + Sync {
    /// Transmit one frame; frames sent sequentially arrive in order
    async fn send(&self, frame: Bytes) -> Result<(), LinkError>;

    /// Close the link; both ends observe a clean close
    async fn close(&self);
}

/// An open link together with its inbound event stream
pub struct LinkChannel {
    pub link: Arc<dyn Link>,
    pub events: mpsc::Receiver<LinkEvent>,
}

impl LinkChannel {
    pub fn new(link: Arc<dyn Link>, events: mpsc::Receiver<LinkEvent>) -> Self {
        Self { link, events }
    }
}
