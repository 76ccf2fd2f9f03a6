//! URL layout for the WebSocket relay transport
//!
//! A relay module speaks the RemoteP2P control packets over WebSocket
//! connections rooted at a base URL. The endpoints here are the fixed
//! layout the relay server serves.

use reto_core::PeerIdentifier;

/// Produces the RemoteP2P endpoint URLs under a relay base URL
#[derive(Debug, Clone)]
pub struct RelayUrls {
    base: String,
}

impl RelayUrls {
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self { base }
    }

    /// Discovery socket carrying advertisement/browse control packets
    pub fn discovery(&self) -> String {
        format!("{}/RemoteP2P/discovery", self.base)
    }

    /// Socket on which the dialer requests a connection to a remote peer
    pub fn connection_request(&self, local: PeerIdentifier, remote: PeerIdentifier) -> String {
        format!("{}/RemoteP2P/connection/request/{local}/{remote}", self.base)
    }

    /// Socket on which the advertiser accepts a requested connection
    pub fn connection_accept(&self, local: PeerIdentifier, remote: PeerIdentifier) -> String {
        format!("{}/RemoteP2P/connection/accept/{local}/{remote}", self.base)
    }
}
