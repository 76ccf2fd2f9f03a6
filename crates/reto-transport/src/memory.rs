//! In-memory transport module
//!
//! Provides an in-process hub for testing routing and connection logic
//! without real network I/O. Peers register modules with a shared
//! [`MemoryHub`]; advertising peers become discoverable to browsing peers,
//! and opening a discovered address yields a real in-memory link pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use reto_core::PeerIdentifier;

use crate::link::{Link, LinkChannel, LinkError, LinkEvent};
use crate::module::{
    Address, Advertiser, AdvertiserEvent, Browser, BrowserEvent, Module, ModuleEvents,
};

const EVENT_BUFFER: usize = 64;

/// Create a pair of connected in-memory links
///
/// Frames sent on one side arrive as [`LinkEvent::Message`] on the other.
/// Closing either side delivers a clean [`LinkEvent::Closed`] to both.
pub fn memory_link_pair() -> (LinkChannel, LinkChannel) {
    let (tx_a, rx_a) = mpsc::channel(EVENT_BUFFER);
    let (tx_b, rx_b) = mpsc::channel(EVENT_BUFFER);
    let closed = Arc::new(AtomicBool::new(false));

    let side_a = Arc::new(MemoryLink {
        to_peer: tx_b.clone(),
        to_local: tx_a.clone(),
        closed: Arc::clone(&closed),
    });
    let side_b = Arc::new(MemoryLink {
        to_peer: tx_a,
        to_local: tx_b,
        closed,
    });

    (LinkChannel::new(side_a, rx_a), LinkChannel::new(side_b, rx_b))
}

struct MemoryLink {
    to_peer: mpsc::Sender<LinkEvent>,
    to_local: mpsc::Sender<LinkEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, frame: Bytes) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::ClosedByPeer);
        }
        self.to_peer
            .send(LinkEvent::Message(frame))
            .await
            .map_err(|_| LinkError::ClosedByPeer)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.to_peer.send(LinkEvent::Closed(None)).await;
        let _ = self.to_local.send(LinkEvent::Closed(None)).await;
    }
}

struct HubEntry {
    advertising: AtomicBool,
    browsing: AtomicBool,
    advertiser_tx: mpsc::Sender<AdvertiserEvent>,
    browser_tx: mpsc::Sender<BrowserEvent>,
    /// One shared address per peer so discovery and retraction events carry
    /// the same instance
    address: Arc<MemoryAddress>,
}

/// In-process hub connecting memory modules
pub struct MemoryHub {
    entries: DashMap<PeerIdentifier, Arc<HubEntry>>,
    /// Unordered peer pairs that must not see each other
    partitions: Mutex<Vec<(PeerIdentifier, PeerIdentifier)>>,
    // handed to modules and addresses so they do not keep the hub alive
    self_ref: Weak<MemoryHub>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            entries: DashMap::new(),
            partitions: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Create a module for `local` registered with this hub
    pub fn create_module(&self, local: PeerIdentifier) -> Arc<MemoryModule> {
        let (advertiser_tx, advertiser_rx) = mpsc::channel(EVENT_BUFFER);
        let (browser_tx, browser_rx) = mpsc::channel(EVENT_BUFFER);

        let address = Arc::new(MemoryAddress {
            target: local,
            hub: self.self_ref.clone(),
        });
        let entry = Arc::new(HubEntry {
            advertising: AtomicBool::new(false),
            browsing: AtomicBool::new(false),
            advertiser_tx,
            browser_tx,
            address,
        });
        self.entries.insert(local, entry);

        Arc::new(MemoryModule {
            advertiser: Arc::new(MemoryAdvertiser {
                hub: self.self_ref.clone(),
                local,
            }),
            browser: Arc::new(MemoryBrowser {
                hub: self.self_ref.clone(),
                local,
            }),
            events: Mutex::new(Some(ModuleEvents {
                advertiser: advertiser_rx,
                browser: browser_rx,
            })),
        })
    }

    /// Hide two peers from each other's discovery
    ///
    /// Only affects discovery events delivered after this call.
    pub fn partition(&self, a: PeerIdentifier, b: PeerIdentifier) {
        self.partitions.lock().unwrap().push((a, b));
    }

    fn visible(&self, a: PeerIdentifier, b: PeerIdentifier) -> bool {
        if a == b {
            return false;
        }
        !self
            .partitions
            .lock()
            .unwrap()
            .iter()
            .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    async fn start_advertising(&self, peer: PeerIdentifier) {
        let Some(entry) = self.entries.get(&peer).map(|e| Arc::clone(e.value())) else {
            return;
        };
        entry.advertising.store(true, Ordering::SeqCst);
        let _ = entry.advertiser_tx.send(AdvertiserEvent::DidStart).await;

        // announce to everyone currently browsing
        for (watcher, tx) in self.browsing_peers() {
            if self.visible(peer, watcher) {
                let _ = tx
                    .send(BrowserEvent::AddressDiscovered {
                        peer,
                        address: entry.address.clone() as Arc<dyn Address>,
                    })
                    .await;
            }
        }
        debug!(peer = %peer.short_id(), "memory module advertising");
    }

    async fn stop_advertising(&self, peer: PeerIdentifier) {
        let Some(entry) = self.entries.get(&peer).map(|e| Arc::clone(e.value())) else {
            return;
        };
        entry.advertising.store(false, Ordering::SeqCst);
        let _ = entry
            .advertiser_tx
            .send(AdvertiserEvent::DidStop(None))
            .await;

        for (watcher, tx) in self.browsing_peers() {
            if self.visible(peer, watcher) {
                let _ = tx
                    .send(BrowserEvent::AddressRemoved {
                        peer,
                        address: entry.address.clone() as Arc<dyn Address>,
                    })
                    .await;
            }
        }
    }

    async fn start_browsing(&self, peer: PeerIdentifier) {
        let Some(entry) = self.entries.get(&peer).map(|e| Arc::clone(e.value())) else {
            return;
        };
        entry.browsing.store(true, Ordering::SeqCst);
        let _ = entry.browser_tx.send(BrowserEvent::DidStart).await;

        // deliver the currently advertising peers
        for (remote, remote_entry) in self.advertising_peers() {
            if self.visible(peer, remote) {
                let _ = entry
                    .browser_tx
                    .send(BrowserEvent::AddressDiscovered {
                        peer: remote,
                        address: remote_entry.address.clone() as Arc<dyn Address>,
                    })
                    .await;
            }
        }
    }

    async fn stop_browsing(&self, peer: PeerIdentifier) {
        let Some(entry) = self.entries.get(&peer).map(|e| Arc::clone(e.value())) else {
            return;
        };
        entry.browsing.store(false, Ordering::SeqCst);
        let _ = entry.browser_tx.send(BrowserEvent::DidStop(None)).await;
    }

    fn is_advertising(&self, peer: PeerIdentifier) -> bool {
        self.entries
            .get(&peer)
            .map(|e| e.advertising.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn is_browsing(&self, peer: PeerIdentifier) -> bool {
        self.entries
            .get(&peer)
            .map(|e| e.browsing.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn browsing_peers(&self) -> Vec<(PeerIdentifier, mpsc::Sender<BrowserEvent>)> {
        self.entries
            .iter()
            .filter(|e| e.value().browsing.load(Ordering::SeqCst))
            .map(|e| (*e.key(), e.value().browser_tx.clone()))
            .collect()
    }

    fn advertising_peers(&self) -> Vec<(PeerIdentifier, Arc<HubEntry>)> {
        self.entries
            .iter()
            .filter(|e| e.value().advertising.load(Ordering::SeqCst))
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    async fn open_link(&self, target: PeerIdentifier) -> Result<LinkChannel, LinkError> {
        let entry = self
            .entries
            .get(&target)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| LinkError::OpenFailed(format!("unknown peer {target}")))?;
        if !entry.advertising.load(Ordering::SeqCst) {
            return Err(LinkError::OpenFailed(format!(
                "peer {target} is not advertising"
            )));
        }

        let (dialer, acceptor) = memory_link_pair();
        entry
            .advertiser_tx
            .send(AdvertiserEvent::IncomingLink(acceptor))
            .await
            .map_err(|_| LinkError::OpenFailed("advertiser is gone".into()))?;
        Ok(dialer)
    }
}

/// Address of a peer registered with a [`MemoryHub`]
pub struct MemoryAddress {
    target: PeerIdentifier,
    hub: Weak<MemoryHub>,
}

#[async_trait]
impl Address for MemoryAddress {
    async fn open(&self) -> Result<LinkChannel, LinkError> {
        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| LinkError::OpenFailed("memory hub is gone".into()))?;
        hub.open_link(self.target).await
    }
}

struct MemoryAdvertiser {
    hub: Weak<MemoryHub>,
    local: PeerIdentifier,
}

#[async_trait]
impl Advertiser for MemoryAdvertiser {
    async fn start_advertising(&self, identifier: PeerIdentifier) {
        if identifier != self.local {
            warn!(
                requested = %identifier.short_id(),
                registered = %self.local.short_id(),
                "memory advertiser registered under a different identifier"
            );
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.start_advertising(self.local).await;
        }
    }

    async fn stop_advertising(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.stop_advertising(self.local).await;
        }
    }

    fn is_advertising(&self) -> bool {
        self.hub
            .upgrade()
            .map(|hub| hub.is_advertising(self.local))
            .unwrap_or(false)
    }
}

struct MemoryBrowser {
    hub: Weak<MemoryHub>,
    local: PeerIdentifier,
}

#[async_trait]
impl Browser for MemoryBrowser {
    async fn start_browsing(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.start_browsing(self.local).await;
        }
    }

    async fn stop_browsing(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.stop_browsing(self.local).await;
        }
    }

    fn is_browsing(&self) -> bool {
        self.hub
            .upgrade()
            .map(|hub| hub.is_browsing(self.local))
            .unwrap_or(false)
    }
}

/// Module backed by a [`MemoryHub`]
pub struct MemoryModule {
    advertiser: Arc<MemoryAdvertiser>,
    browser: Arc<MemoryBrowser>,
    events: Mutex<Option<ModuleEvents>>,
}

impl Module for MemoryModule {
    fn advertiser(&self) -> Arc<dyn Advertiser> {
        self.advertiser.clone()
    }

    fn browser(&self) -> Arc<dyn Browser> {
        self.browser.clone()
    }

    fn take_events(&self) -> Option<ModuleEvents> {
        self.events.lock().unwrap().take()
    }
}
