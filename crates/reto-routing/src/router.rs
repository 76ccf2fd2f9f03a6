//! The router: peer graph, reachability dissemination, and routed
//! connection establishment
//!
//! The router consumes discovery events from transport modules, keeps one
//! routing connection per direct neighbor for metadata exchange, and builds
//! routed (unicast or multicast) connections across the overlay by handing
//! next-hop trees downstream. Intermediate peers relay opaque frames;
//! destinations confirm upstream, and the initiator's connection is
//! established once every destination has confirmed.
//!
//! Lock discipline: the router never holds two of its mutexes at once and
//! never holds one across an await point.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use reto_connection::packet_connection::{PacketConnection, PacketHandler};
use reto_connection::reliability::{
    ConnectionManager, ReliabilityDelegate, ReliabilityManager, ReliabilitySettings,
};
use reto_connection::transfer::{TransferManager, DEFAULT_CHUNK_SIZE};
use reto_core::wire::{
    ConnectionPurpose, LinkHandshake, ManagedConnectionHandshake, MulticastHandshake, Packet,
    PacketType, ReachabilityUpdate, RoutedConnectionEstablishedConfirmation,
};
use reto_core::{
    BackoffSettings, ConnectionIdentifier, PeerIdentifier, StartStopHelper, Tree,
};
use reto_transport::link::{Link, LinkChannel, LinkError, LinkEvent};
use reto_transport::module::{
    Address, AdvertiserEvent, BrowserEvent, Module,
};

use crate::connection::{ConfirmationTracker, RoutedConnection};
use crate::error::{HandshakeError, RoutingError};
use crate::handshake::expect_frame;
use crate::multicast::multicast_channel;
use crate::spanning::partial_next_hop_tree;
use crate::table::{RoutingTable, TableDelta};

const EVENT_BUFFER: usize = 256;
const RELAY_BUFFER: usize = 64;
const ROUTING_DECODE_ERROR_LIMIT: u32 = 3;

/// Router configuration, passed at construction
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a fresh link may stay silent before it is torn down
    pub handshake_timeout: Duration,
    /// Bounded wait for establishment confirmations and re-associations
    pub establish_timeout: Duration,
    /// Reconnect pacing for routed connections
    pub reliability: ReliabilitySettings,
    /// Retry pacing for module advertise/browse intents
    pub module_retry: BackoffSettings,
    /// Transfer chunk size
    pub chunk_size: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            establish_timeout: Duration::from_secs(10),
            reliability: ReliabilitySettings::default(),
            module_retry: BackoffSettings::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Why a routed connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close finished
    Expected,
    /// Reconnection was exhausted
    Unexpected(Option<LinkError>),
}

/// Events surfaced to the application
pub enum RouterEvent {
    /// A peer became reachable over the overlay
    PeerDiscovered(PeerIdentifier),
    /// A peer is no longer reachable
    PeerLost(PeerIdentifier),
    /// A remote peer opened a routed connection with us as destination
    ConnectionAccepted(Arc<RoutedConnection>),
    /// A routed connection ended
    ConnectionClosed {
        identifier: ConnectionIdentifier,
        reason: CloseReason,
    },
}

#[derive(Default)]
struct PeerEntry {
    addresses: Vec<Arc<dyn Address>>,
    routing_connection: Option<Arc<PacketConnection>>,
    routing_handler: Option<Arc<RoutingLinkHandler>>,
    dialing: bool,
}

impl PeerEntry {
    fn is_vacant(&self) -> bool {
        self.addresses.is_empty() && self.routing_connection.is_none() && !self.dialing
    }
}

struct RoutedEntry {
    connection: Arc<RoutedConnection>,
    /// Whether this side initiated the connection and drives reconnection
    driving: bool,
}

struct RelayState {
    parent: Arc<dyn Link>,
    children: Vec<Arc<dyn Link>>,
}

struct ModuleDriver {
    /// Kept alive for the module's lifetime
    #[allow(dead_code)]
    module: Arc<dyn Module>,
    advertise_helper: Arc<StartStopHelper>,
    browse_helper: Arc<StartStopHelper>,
}

/// The routing core of one peer
pub struct Router {
    local: PeerIdentifier,
    config: RouterConfig,
    peers: Mutex<HashMap<PeerIdentifier, PeerEntry>>,
    table: Mutex<RoutingTable>,
    routed: Mutex<HashMap<ConnectionIdentifier, RoutedEntry>>,
    relays: Mutex<HashMap<ConnectionIdentifier, RelayState>>,
    pending_reassociation: Mutex<HashMap<ConnectionIdentifier, oneshot::Sender<LinkChannel>>>,
    modules: Mutex<Vec<ModuleDriver>>,
    started: Mutex<bool>,
    events: mpsc::Sender<RouterEvent>,
    self_ref: Weak<Router>,
}

impl Router {
    /// Create a router; the receiver yields [`RouterEvent`]s
    pub fn new(
        local: PeerIdentifier,
        config: RouterConfig,
    ) -> (Arc<Self>, mpsc::Receiver<RouterEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let router = Arc::new_cyclic(|self_ref| Self {
            local,
            config,
            peers: Mutex::new(HashMap::new()),
            table: Mutex::new(RoutingTable::new(local)),
            routed: Mutex::new(HashMap::new()),
            relays: Mutex::new(HashMap::new()),
            pending_reassociation: Mutex::new(HashMap::new()),
            modules: Mutex::new(Vec::new()),
            started: Mutex::new(false),
            events,
            self_ref: self_ref.clone(),
        });
        (router, events_rx)
    }

    /// This peer's identifier
    pub fn local_identifier(&self) -> PeerIdentifier {
        self.local
    }

    /// Destinations currently reachable over the overlay, with hop counts
    pub fn reachable_peers(&self) -> Vec<(PeerIdentifier, u32)> {
        self.table.lock().unwrap().reachable()
    }

    /// Peers with at least one known direct address
    pub fn addressed_peers(&self) -> Vec<PeerIdentifier> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| !entry.addresses.is_empty())
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Register a transport module and begin consuming its events
    pub fn add_module(&self, module: Arc<dyn Module>) {
        let Some(events) = module.take_events() else {
            warn!("module events already taken; module not added");
            return;
        };

        let advertiser = module.advertiser();
        let browser = module.browser();
        let local = self.local;

        let advertise_helper = Arc::new(StartStopHelper::new(
            {
                let advertiser = advertiser.clone();
                Arc::new(move |_attempt| {
                    let advertiser = advertiser.clone();
                    tokio::spawn(async move {
                        advertiser.start_advertising(local).await;
                    });
                })
            },
            self.config.module_retry.clone(),
            {
                let advertiser = advertiser.clone();
                Arc::new(move |_attempt| {
                    let advertiser = advertiser.clone();
                    tokio::spawn(async move {
                        advertiser.stop_advertising().await;
                    });
                })
            },
            self.config.module_retry.clone(),
        ));

        let browse_helper = Arc::new(StartStopHelper::new(
            {
                let browser = browser.clone();
                Arc::new(move |_attempt| {
                    let browser = browser.clone();
                    tokio::spawn(async move {
                        browser.start_browsing().await;
                    });
                })
            },
            self.config.module_retry.clone(),
            {
                let browser = browser.clone();
                Arc::new(move |_attempt| {
                    let browser = browser.clone();
                    tokio::spawn(async move {
                        browser.stop_browsing().await;
                    });
                })
            },
            self.config.module_retry.clone(),
        ));

        self.spawn_advertiser_loop(events.advertiser, advertise_helper.clone());
        self.spawn_browser_loop(events.browser, browse_helper.clone());

        let start_now = *self.started.lock().unwrap();
        if start_now {
            advertise_helper.start();
            browse_helper.start();
        }
        self.modules.lock().unwrap().push(ModuleDriver {
            module,
            advertise_helper,
            browse_helper,
        });
    }

    /// Start advertising and browsing on every module
    pub fn start(&self) {
        *self.started.lock().unwrap() = true;
        for driver in self.modules.lock().unwrap().iter() {
            driver.advertise_helper.start();
            driver.browse_helper.start();
        }
        info!(local = %self.local.short_id(), "router started");
    }

    /// Stop advertising and browsing on every module
    pub fn stop(&self) {
        *self.started.lock().unwrap() = false;
        for driver in self.modules.lock().unwrap().iter() {
            driver.advertise_helper.stop();
            driver.browse_helper.stop();
        }
    }

    fn spawn_advertiser_loop(
        &self,
        mut events: mpsc::Receiver<AdvertiserEvent>,
        helper: Arc<StartStopHelper>,
    ) {
        let router = self.self_ref.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    AdvertiserEvent::DidStart => helper.confirm_start_occurred(),
                    AdvertiserEvent::DidStop(error) => {
                        if let Some(error) = error {
                            warn!(%error, "advertiser stopped with error");
                        }
                        helper.confirm_stop_occurred();
                    }
                    AdvertiserEvent::IncomingLink(channel) => {
                        let Some(router) = router.upgrade() else { return };
                        tokio::spawn(async move {
                            router.handle_incoming_link(channel).await;
                        });
                    }
                }
            }
        });
    }

    fn spawn_browser_loop(
        &self,
        mut events: mpsc::Receiver<BrowserEvent>,
        helper: Arc<StartStopHelper>,
    ) {
        let router = self.self_ref.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(router) = router.upgrade() else { return };
                match event {
                    BrowserEvent::DidStart => helper.confirm_start_occurred(),
                    BrowserEvent::DidStop(error) => {
                        if let Some(error) = error {
                            warn!(%error, "browser stopped with error");
                        }
                        helper.confirm_stop_occurred();
                    }
                    BrowserEvent::AddressDiscovered { peer, address } => {
                        router.address_discovered(peer, address);
                    }
                    BrowserEvent::AddressRemoved { peer, address } => {
                        router.address_removed(peer, &address);
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Peer graph
    // ------------------------------------------------------------------

    fn address_discovered(&self, peer: PeerIdentifier, address: Arc<dyn Address>) {
        if peer == self.local {
            return;
        }
        debug!(peer = %peer.short_id(), "address discovered");

        let dial = {
            let mut peers = self.peers.lock().unwrap();
            let entry = peers.entry(peer).or_default();
            entry.addresses.push(address);
            // the lower identifier dials, so exactly one side initiates
            let dial =
                entry.routing_connection.is_none() && !entry.dialing && self.local < peer;
            if dial {
                entry.dialing = true;
            }
            dial
        };

        if dial {
            if let Some(router) = self.self_ref.upgrade() {
                tokio::spawn(async move {
                    router.establish_routing_connection(peer).await;
                });
            }
        }
    }

    fn address_removed(&self, peer: PeerIdentifier, address: &Arc<dyn Address>) {
        let mut peers = self.peers.lock().unwrap();
        let vacant = match peers.get_mut(&peer) {
            Some(entry) => {
                entry.addresses.retain(|known| !Arc::ptr_eq(known, address));
                entry.is_vacant()
            }
            None => false,
        };
        if vacant {
            peers.remove(&peer);
        }
    }

    #[instrument(skip(self), fields(local = %self.local.short_id(), peer = %peer.short_id()))]
    async fn establish_routing_connection(self: Arc<Self>, peer: PeerIdentifier) {
        let result = self
            .open_direct_link(peer, ConnectionPurpose::RoutingConnection)
            .await;
        if let Some(entry) = self.peers.lock().unwrap().get_mut(&peer) {
            entry.dialing = false;
        }
        match result {
            Ok(channel) => self.install_routing_connection(peer, channel),
            Err(error) => warn!(%error, "failed to establish routing connection"),
        }
    }

    /// Open a direct link to a known peer and run the handshake exchange
    async fn open_direct_link(
        &self,
        peer: PeerIdentifier,
        purpose: ConnectionPurpose,
    ) -> Result<LinkChannel, RoutingError> {
        let address = {
            let peers = self.peers.lock().unwrap();
            peers
                .get(&peer)
                .and_then(|entry| entry.addresses.first().cloned())
        }
        .ok_or(RoutingError::UnknownPeer(peer))?;

        let mut channel = address.open().await?;

        let handshake = Packet::LinkHandshake(LinkHandshake {
            peer_identifier: self.local,
            purpose,
        });
        channel.link.send(handshake.serialize()).await?;

        match expect_frame(&mut channel.events, self.config.handshake_timeout).await {
            Ok(Packet::LinkHandshake(reply)) if reply.purpose == purpose => Ok(channel),
            Ok(Packet::LinkHandshake(_)) => {
                channel.link.close().await;
                Err(HandshakeError::PurposeMismatch.into())
            }
            Ok(_) => {
                channel.link.close().await;
                Err(HandshakeError::UnexpectedPacket.into())
            }
            Err(error) => {
                channel.link.close().await;
                Err(error.into())
            }
        }
    }

    /// An accepted or dialed routing link is ready; wire it up
    fn install_routing_connection(&self, peer: PeerIdentifier, channel: LinkChannel) {
        let connection =
            PacketConnection::with_decode_error_limit([peer].into(), ROUTING_DECODE_ERROR_LIMIT);
        let handler = Arc::new(RoutingLinkHandler {
            router: self.self_ref.clone(),
            peer,
        });
        connection.add_handler(&handler);

        let replaced = {
            let mut peers = self.peers.lock().unwrap();
            let entry = peers.entry(peer).or_default();
            let replaced = entry.routing_connection.take();
            entry.routing_connection = Some(connection.clone());
            entry.routing_handler = Some(handler);
            replaced
        };
        if let Some(old) = replaced {
            debug!(peer = %peer.short_id(), "replacing routing connection");
            old.disconnect_underlying_link();
        }

        connection.attach(channel);
        info!(peer = %peer.short_id(), "routing connection up");

        let (delta, newly, full) = {
            let mut table = self.table.lock().unwrap();
            let before = known_destinations(&table);
            let delta = table.neighbor_up(peer);
            let newly = newly_reachable(&delta, &before);
            (delta, newly, table.full_update_for(&peer))
        };
        connection.write(&Packet::ReachabilityUpdate(ReachabilityUpdate {
            source: self.local,
            added: full,
            removed: Vec::new(),
        }));
        self.disseminate(delta, newly, Some(peer));
    }

    fn handle_reachability_update(&self, from: PeerIdentifier, update: ReachabilityUpdate) {
        let (delta, newly) =
            self.update_table(|table| table.apply_update(from, &update.added, &update.removed));
        self.disseminate(delta, newly, Some(from));
    }

    /// Run a table mutation, returning its delta and the destinations that
    /// were not reachable at all before it
    fn update_table(
        &self,
        mutate: impl FnOnce(&mut RoutingTable) -> TableDelta,
    ) -> (TableDelta, Vec<PeerIdentifier>) {
        let mut table = self.table.lock().unwrap();
        let before = known_destinations(&table);
        let delta = mutate(&mut table);
        let newly = newly_reachable(&delta, &before);
        (delta, newly)
    }

    fn routing_link_closed(&self, peer: PeerIdentifier) {
        info!(peer = %peer.short_id(), "routing connection down");
        let redial = {
            let mut peers = self.peers.lock().unwrap();
            let (redial, vacant) = match peers.get_mut(&peer) {
                Some(entry) => {
                    entry.routing_connection = None;
                    entry.routing_handler = None;
                    let redial = !entry.addresses.is_empty() && self.local < peer;
                    entry.dialing = redial;
                    (redial, entry.is_vacant())
                }
                None => (false, false),
            };
            if vacant {
                peers.remove(&peer);
            }
            redial
        };

        let (delta, newly) = self.update_table(|table| table.neighbor_down(peer));
        self.disseminate(delta, newly, None);

        if redial {
            if let Some(router) = self.self_ref.upgrade() {
                tokio::spawn(async move {
                    router.establish_routing_connection(peer).await;
                });
            }
        }
    }

    /// Forward a table delta to routing neighbors and surface peer events
    fn disseminate(
        &self,
        delta: TableDelta,
        newly: Vec<PeerIdentifier>,
        exclude: Option<PeerIdentifier>,
    ) {
        if delta.is_empty() {
            return;
        }

        // next hops looked up before touching the peer map, so no two
        // router locks are ever held together
        let next_hops: HashMap<PeerIdentifier, PeerIdentifier> = {
            let table = self.table.lock().unwrap();
            delta
                .added
                .iter()
                .filter_map(|(destination, _)| {
                    table.next_hop(destination).map(|hop| (*destination, hop))
                })
                .collect()
        };

        let neighbors: Vec<(PeerIdentifier, Arc<PacketConnection>)> = {
            let peers = self.peers.lock().unwrap();
            peers
                .iter()
                .filter(|(peer, entry)| {
                    Some(**peer) != exclude && entry.routing_connection.is_some()
                })
                .filter_map(|(peer, entry)| {
                    entry
                        .routing_connection
                        .clone()
                        .map(|connection| (*peer, connection))
                })
                .collect()
        };

        for (neighbor, connection) in neighbors {
            // split horizon: never advertise a route back through itself
            let added: Vec<(PeerIdentifier, u32)> = delta
                .added
                .iter()
                .filter(|(destination, _)| {
                    next_hops.get(destination) != Some(&neighbor) && *destination != neighbor
                })
                .copied()
                .collect();
            if added.is_empty() && delta.removed.is_empty() {
                continue;
            }
            connection.write(&Packet::ReachabilityUpdate(ReachabilityUpdate {
                source: self.local,
                added,
                removed: delta.removed.clone(),
            }));
        }

        for destination in newly {
            self.emit(RouterEvent::PeerDiscovered(destination));
        }
        for destination in &delta.removed {
            self.emit(RouterEvent::PeerLost(*destination));
        }
    }

    fn emit(&self, event: RouterEvent) {
        if self.events.try_send(event).is_err() {
            warn!("router event queue full; event dropped");
        }
    }

    // ------------------------------------------------------------------
    // Routed connections
    // ------------------------------------------------------------------

    /// Open a routed connection to a destination set
    ///
    /// Resolves once every destination confirmed. If only part of the set
    /// confirmed within the bounded wait, the attempt fails with
    /// [`RoutingError::PartiallyEstablished`].
    #[instrument(skip(self, destinations), fields(local = %self.local.short_id()))]
    pub async fn connect(
        &self,
        destinations: HashSet<PeerIdentifier>,
    ) -> Result<Arc<RoutedConnection>, RoutingError> {
        if destinations.is_empty() {
            return Err(RoutingError::EmptyDestinationSet);
        }
        let identifier = ConnectionIdentifier::random();
        let channel = self.open_routed_fanout(identifier, &destinations).await?;

        let connection = PacketConnection::new(destinations.clone());
        let tracker = ConfirmationTracker::new(destinations.clone());
        connection.add_handler(&tracker);
        connection.attach(channel);

        if let Err(error) = tracker.wait(self.config.establish_timeout).await {
            connection.disconnect_underlying_link();
            return Err(error);
        }

        info!(connection = %identifier, "routed connection established");
        self.finish_routed(identifier, destinations, connection, Some(tracker), true)
            .ok_or(RoutingError::Link(LinkError::OpenFailed(
                "router is shutting down".into(),
            )))
    }

    /// Build the first-hop fan-out for a routed connection
    async fn open_routed_fanout(
        &self,
        identifier: ConnectionIdentifier,
        destinations: &HashSet<PeerIdentifier>,
    ) -> Result<LinkChannel, RoutingError> {
        let (tree, missing) = {
            let table = self.table.lock().unwrap();
            partial_next_hop_tree(&table, destinations)?
        };
        for destination in &missing {
            warn!(
                destination = %destination.short_id(),
                "no route for destination; proceeding without it"
            );
        }

        let mut ordered: Vec<PeerIdentifier> = destinations.iter().copied().collect();
        ordered.sort();

        let mut children = Vec::new();
        for subtree in &tree.subtrees {
            match self
                .open_routed_branch(identifier, subtree, &ordered, self.local)
                .await
            {
                Ok(channel) => children.push(channel),
                Err(error) => warn!(
                    child = %subtree.value.short_id(),
                    %error,
                    "failed to open routed branch"
                ),
            }
        }
        if children.is_empty() {
            let first = ordered.first().copied().ok_or(RoutingError::EmptyDestinationSet)?;
            return Err(RoutingError::Unreachable(first));
        }
        Ok(multicast_channel(children))
    }

    /// Open one first-hop link and hand its subtree downstream
    async fn open_routed_branch(
        &self,
        identifier: ConnectionIdentifier,
        subtree: &Tree<PeerIdentifier>,
        destinations: &[PeerIdentifier],
        source: PeerIdentifier,
    ) -> Result<LinkChannel, RoutingError> {
        let child = subtree.value;
        let channel = self
            .open_direct_link(child, ConnectionPurpose::RoutedConnection)
            .await?;

        let managed = Packet::ManagedConnectionHandshake(ManagedConnectionHandshake {
            connection_identifier: identifier,
        });
        channel.link.send(managed.serialize()).await?;

        let multicast = Packet::MulticastHandshake(MulticastHandshake {
            source,
            destinations: destinations.to_vec(),
            next_hop_tree: subtree.clone(),
        });
        channel.link.send(multicast.serialize()).await?;

        Ok(channel)
    }

    fn finish_routed(
        &self,
        identifier: ConnectionIdentifier,
        destinations: HashSet<PeerIdentifier>,
        connection: Arc<PacketConnection>,
        tracker: Option<Arc<ConfirmationTracker>>,
        driving: bool,
    ) -> Option<Arc<RoutedConnection>> {
        let manager: Arc<dyn ConnectionManager> = self.self_ref.upgrade()?;
        let observer = Arc::new(ConnectionObserver {
            router: self.self_ref.clone(),
            identifier,
        });
        let reliability = ReliabilityManager::new(
            connection.clone(),
            self.local,
            driving,
            self.config.reliability.clone(),
            manager,
            observer,
        );
        let transfers = TransferManager::new(&connection, self.config.chunk_size);
        let routed = RoutedConnection::new(
            identifier,
            destinations,
            connection,
            reliability,
            transfers,
            tracker,
        );
        self.routed.lock().unwrap().insert(
            identifier,
            RoutedEntry {
                connection: routed.clone(),
                driving,
            },
        );
        Some(routed)
    }

    // ------------------------------------------------------------------
    // Incoming links
    // ------------------------------------------------------------------

    async fn handle_incoming_link(self: Arc<Self>, mut channel: LinkChannel) {
        let handshake = match expect_frame(&mut channel.events, self.config.handshake_timeout)
            .await
        {
            Ok(Packet::LinkHandshake(handshake)) => handshake,
            Ok(_) => {
                warn!("incoming link sent a non-handshake packet first");
                channel.link.close().await;
                return;
            }
            Err(error) => {
                warn!(%error, "incoming link handshake failed");
                channel.link.close().await;
                return;
            }
        };

        let reply = Packet::LinkHandshake(LinkHandshake {
            peer_identifier: self.local,
            purpose: handshake.purpose,
        });
        if channel.link.send(reply.serialize()).await.is_err() {
            return;
        }

        debug!(
            peer = %handshake.peer_identifier.short_id(),
            purpose = ?handshake.purpose,
            "incoming link classified"
        );
        match handshake.purpose {
            ConnectionPurpose::RoutingConnection => {
                self.install_routing_connection(handshake.peer_identifier, channel);
            }
            ConnectionPurpose::RoutedConnection => {
                self.handle_incoming_routed(channel).await;
            }
            ConnectionPurpose::Unknown => {
                warn!("incoming link with unknown purpose");
                channel.link.close().await;
            }
        }
    }

    /// An incoming routed link: we are an intermediate, a destination, or
    /// both
    async fn handle_incoming_routed(&self, mut channel: LinkChannel) {
        let identifier = match expect_frame(&mut channel.events, self.config.handshake_timeout)
            .await
        {
            Ok(Packet::ManagedConnectionHandshake(managed)) => managed.connection_identifier,
            Ok(_) | Err(_) => {
                warn!("routed link did not identify its connection");
                channel.link.close().await;
                return;
            }
        };
        let handshake = match expect_frame(&mut channel.events, self.config.handshake_timeout)
            .await
        {
            Ok(Packet::MulticastHandshake(handshake)) => handshake,
            Ok(_) | Err(_) => {
                warn!(connection = %identifier, "routed link sent no multicast handshake");
                channel.link.close().await;
                return;
            }
        };
        if handshake.next_hop_tree.value != self.local {
            warn!(connection = %identifier, "received a subtree rooted elsewhere");
            channel.link.close().await;
            return;
        }

        let is_destination = handshake.destinations.contains(&self.local);
        let forward: HashSet<PeerIdentifier> = handshake
            .next_hop_tree
            .leaves()
            .into_iter()
            .copied()
            .filter(|leaf| *leaf != self.local)
            .collect();

        // open the downstream branches from our own routing table
        let mut child_channels = Vec::new();
        if !forward.is_empty() {
            let subtree_result = {
                let table = self.table.lock().unwrap();
                partial_next_hop_tree(&table, &forward)
            };
            match subtree_result {
                Ok((tree, missing)) => {
                    for destination in &missing {
                        warn!(
                            destination = %destination.short_id(),
                            "{}", RoutingError::NoRouteForDestination(*destination)
                        );
                    }
                    for subtree in &tree.subtrees {
                        match self
                            .open_routed_branch(
                                identifier,
                                subtree,
                                &handshake.destinations,
                                handshake.source,
                            )
                            .await
                        {
                            Ok(child) => child_channels.push(child),
                            Err(error) => warn!(
                                child = %subtree.value.short_id(),
                                %error,
                                "failed to open downstream branch"
                            ),
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, "cannot forward to any downstream destination");
                }
            }
        }

        if child_channels.is_empty() {
            if is_destination {
                self.accept_destination(identifier, handshake.source, channel);
            } else {
                warn!(connection = %identifier, "neither destination nor able to forward");
                channel.link.close().await;
            }
            return;
        }

        let local_channel =
            self.install_relay(identifier, channel, child_channels, is_destination);
        if let Some(local_channel) = local_channel {
            self.accept_destination(identifier, handshake.source, local_channel);
        }
    }

    /// Surface (or re-associate) a routed connection we are a destination of
    fn accept_destination(
        &self,
        identifier: ConnectionIdentifier,
        source: PeerIdentifier,
        channel: LinkChannel,
    ) {
        // a reconnect attempt may already be waiting for this link
        let channel = {
            let waiter = self.pending_reassociation.lock().unwrap().remove(&identifier);
            match waiter {
                Some(waiter) => match waiter.send(channel) {
                    Ok(()) => return,
                    Err(channel) => channel,
                },
                None => channel,
            }
        };

        // the connection may survive from before a link loss we have not
        // noticed yet; swap the fresh link in
        let existing = self
            .routed
            .lock()
            .unwrap()
            .get(&identifier)
            .map(|entry| entry.connection.clone());
        if let Some(existing) = existing {
            debug!(connection = %identifier, "re-associating fresh link");
            existing.packet_connection().swap_underlying_link(channel);
            return;
        }

        let connection = PacketConnection::new([source].into());
        let Some(routed) =
            self.finish_routed(identifier, [source].into(), connection.clone(), None, false)
        else {
            return;
        };
        connection.attach(channel);
        connection.write(&Packet::RoutedConnectionEstablishedConfirmation(
            RoutedConnectionEstablishedConfirmation { source: self.local },
        ));
        info!(connection = %identifier, source = %source.short_id(), "routed connection accepted");
        self.emit(RouterEvent::ConnectionAccepted(routed));
    }

    // ------------------------------------------------------------------
    // Relaying
    // ------------------------------------------------------------------

    /// Wire an intermediate relay: upstream frames fan out to the children,
    /// child frames flow upstream. With `tee_local` a synthetic channel for
    /// the local destination end is returned; it sends upstream.
    fn install_relay(
        &self,
        identifier: ConnectionIdentifier,
        parent_channel: LinkChannel,
        children: Vec<LinkChannel>,
        tee_local: bool,
    ) -> Option<LinkChannel> {
        let LinkChannel {
            link: parent_link,
            events: mut parent_events,
        } = parent_channel;

        let child_links: Vec<Arc<dyn Link>> =
            children.iter().map(|child| child.link.clone()).collect();

        let (tee_tx, tee_rx) = if tee_local {
            let (tx, rx) = mpsc::channel(RELAY_BUFFER);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        // replace any relay surviving from a previous link
        let previous = self.relays.lock().unwrap().insert(
            identifier,
            RelayState {
                parent: parent_link.clone(),
                children: child_links.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(connection = %identifier, "tearing down superseded relay");
            close_relay_links(previous);
        }

        // upstream -> children (and the local tee)
        {
            let router = self.self_ref.clone();
            let child_links = child_links.clone();
            let tee_tx = tee_tx.clone();
            tokio::spawn(async move {
                loop {
                    let event = match parent_events.recv().await {
                        Some(event) => event,
                        None => LinkEvent::Closed(Some(LinkError::ClosedByPeer)),
                    };
                    match event {
                        LinkEvent::Message(frame) => {
                            for child in &child_links {
                                if let Err(error) = child.send(frame.clone()).await {
                                    debug!(%error, "relay child rejected frame");
                                }
                            }
                            if let Some(tee) = &tee_tx {
                                let _ = tee.send(LinkEvent::Message(frame)).await;
                            }
                        }
                        LinkEvent::Closed(error) => {
                            if let Some(tee) = &tee_tx {
                                let _ = tee.send(LinkEvent::Closed(error)).await;
                            }
                            if let Some(router) = router.upgrade() {
                                router.teardown_relay(identifier);
                            }
                            return;
                        }
                    }
                }
            });
        }

        // each child -> upstream
        for child in children {
            let LinkChannel {
                link: _child_link,
                events: mut child_events,
            } = child;
            let parent = parent_link.clone();
            let router = self.self_ref.clone();
            tokio::spawn(async move {
                loop {
                    let event = match child_events.recv().await {
                        Some(event) => event,
                        None => LinkEvent::Closed(Some(LinkError::ClosedByPeer)),
                    };
                    match event {
                        LinkEvent::Message(frame) => {
                            if let Err(error) = parent.send(frame).await {
                                debug!(%error, "relay upstream rejected frame");
                                return;
                            }
                        }
                        LinkEvent::Closed(_) => {
                            // losing one branch takes the relay down so the
                            // endpoints notice promptly
                            if let Some(router) = router.upgrade() {
                                router.teardown_relay(identifier);
                            }
                            return;
                        }
                    }
                }
            });
        }

        tee_rx.map(|events| LinkChannel::new(parent_link, events))
    }

    fn teardown_relay(&self, identifier: ConnectionIdentifier) {
        if let Some(relay) = self.relays.lock().unwrap().remove(&identifier) {
            debug!(connection = %identifier, "tearing down relay");
            close_relay_links(relay);
        }
    }
}

fn close_relay_links(relay: RelayState) {
    tokio::spawn(async move {
        relay.parent.close().await;
        for child in relay.children {
            child.close().await;
        }
    });
}

fn known_destinations(table: &RoutingTable) -> HashSet<PeerIdentifier> {
    table
        .reachable()
        .into_iter()
        .map(|(destination, _)| destination)
        .collect()
}

fn newly_reachable(delta: &TableDelta, before: &HashSet<PeerIdentifier>) -> Vec<PeerIdentifier> {
    delta
        .added
        .iter()
        .map(|(destination, _)| *destination)
        .filter(|destination| !before.contains(destination))
        .collect()
}

/// Packet handler of one routing connection
struct RoutingLinkHandler {
    router: Weak<Router>,
    peer: PeerIdentifier,
}

const ROUTING_TYPES: [PacketType; 1] = [PacketType::ReachabilityUpdate];

impl PacketHandler for RoutingLinkHandler {
    fn handled_types(&self) -> &[PacketType] {
        &ROUTING_TYPES
    }

    fn handle_packet(&self, packet: Packet) {
        if let Packet::ReachabilityUpdate(update) = packet {
            if let Some(router) = self.router.upgrade() {
                router.handle_reachability_update(self.peer, update);
            }
        }
    }

    fn underlying_link_closed(&self, _error: Option<LinkError>) {
        if let Some(router) = self.router.upgrade() {
            router.routing_link_closed(self.peer);
        }
    }
}

/// Relays reliability outcomes of one routed connection as router events
struct ConnectionObserver {
    router: Weak<Router>,
    identifier: ConnectionIdentifier,
}

impl ReliabilityDelegate for ConnectionObserver {
    fn connection_connected(&self) {
        debug!(connection = %self.identifier, "routed connection link up");
    }

    fn connection_closed_expectedly(&self) {
        if let Some(router) = self.router.upgrade() {
            router.emit(RouterEvent::ConnectionClosed {
                identifier: self.identifier,
                reason: CloseReason::Expected,
            });
        }
    }

    fn connection_closed_unexpectedly(&self, error: Option<LinkError>) {
        if let Some(router) = self.router.upgrade() {
            router.emit(RouterEvent::ConnectionClosed {
                identifier: self.identifier,
                reason: CloseReason::Unexpected(error),
            });
        }
    }
}

#[async_trait]
impl ConnectionManager for Router {
    async fn establish_underlying_link(
        &self,
        connection: &Arc<PacketConnection>,
    ) -> Result<(), LinkError> {
        let found = {
            let routed = self.routed.lock().unwrap();
            routed
                .iter()
                .find(|(_, entry)| {
                    Arc::ptr_eq(entry.connection.packet_connection(), connection)
                })
                .map(|(identifier, entry)| {
                    (
                        *identifier,
                        entry.driving,
                        entry.connection.destinations().clone(),
                    )
                })
        };
        let Some((identifier, driving, destinations)) = found else {
            return Err(LinkError::OpenFailed("connection is not managed".into()));
        };

        if driving {
            let channel = self
                .open_routed_fanout(identifier, &destinations)
                .await
                .map_err(|error| LinkError::OpenFailed(error.to_string()))?;
            connection.swap_underlying_link(channel);
            Ok(())
        } else {
            // hosted side: wait for the initiator to re-associate
            let (sender, receiver) = oneshot::channel();
            self.pending_reassociation
                .lock()
                .unwrap()
                .insert(identifier, sender);
            match tokio::time::timeout(self.config.establish_timeout, receiver).await {
                Ok(Ok(channel)) => {
                    connection.swap_underlying_link(channel);
                    Ok(())
                }
                _ => {
                    self.pending_reassociation
                        .lock()
                        .unwrap()
                        .remove(&identifier);
                    Err(LinkError::OpenFailed(
                        "initiator did not re-associate in time".into(),
                    ))
                }
            }
        }
    }

    fn remove_connection(&self, connection: &Arc<PacketConnection>) {
        self.routed.lock().unwrap().retain(|_, entry| {
            !Arc::ptr_eq(entry.connection.packet_connection(), connection)
        });
    }
}
