//! Transport module contracts
//!
//! A module bundles one [`Advertiser`] (accepting incoming links under a
//! peer identifier) and one [`Browser`] (discovering remote addresses).
//! Delegate callbacks from the original design are expressed as event enums
//! delivered over mpsc channels; the router consumes them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use reto_core::PeerIdentifier;

use crate::link::{LinkChannel, LinkError};

/// Dialable handle yielding an underlying link to one specific remote peer
#[async_trait]
pub trait Address: Send + Sync {
    /// Open a fresh underlying link to the peer this address names
    async fn open(&self) -> Result<LinkChannel, LinkError>;
}

/// Events from an advertiser
pub enum AdvertiserEvent {
    /// Advertising is up
    DidStart,
    /// Advertising went down, possibly because of an error
    DidStop(Option<LinkError>),
    /// A remote peer opened a link to us
    IncomingLink(LinkChannel),
}

/// Events from a browser
pub enum BrowserEvent {
    /// Browsing is up
    DidStart,
    /// Browsing went down, possibly because of an error
    DidStop(Option<LinkError>),
    /// A new address for a peer became known
    AddressDiscovered {
        peer: PeerIdentifier,
        address: Arc<dyn Address>,
    },
    /// A previously discovered address was retracted
    AddressRemoved {
        peer: PeerIdentifier,
        address: Arc<dyn Address>,
    },
}

/// Accepts incoming links while advertising a peer identifier
#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn start_advertising(&self, identifier: PeerIdentifier);
    async fn stop_advertising(&self);
    fn is_advertising(&self) -> bool;
}

/// Discovers addresses of remote peers
#[async_trait]
pub trait Browser: Send + Sync {
    async fn start_browsing(&self);
    async fn stop_browsing(&self);
    fn is_browsing(&self) -> bool;
}

/// Event streams of a module; handed out once
pub struct ModuleEvents {
    pub advertiser: mpsc::Receiver<AdvertiserEvent>,
    pub browser: mpsc::Receiver<BrowserEvent>,
}

/// A transport module: one advertiser plus one browser
pub trait Module: Send + Sync {
    fn advertiser(&self) -> Arc<dyn Advertiser>;
    fn browser(&self) -> Arc<dyn Browser>;

    /// Take the module's event streams; `None` after the first call
    fn take_events(&self) -> Option<ModuleEvents>;
}
