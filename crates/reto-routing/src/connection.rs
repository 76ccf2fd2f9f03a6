//! User-facing routed connections
//!
//! A [`RoutedConnection`] is what the application gets back from the router:
//! one packet connection to a destination set (unicast is a destination set
//! of one), a reliability manager driving close and reconnect, and a
//! transfer manager for payload exchange.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use reto_connection::packet_connection::{ConnectionState, PacketConnection, PacketHandler};
use reto_connection::reliability::ReliabilityManager;
use reto_connection::transfer::{InTransfer, OutTransfer, TransferManager};
use reto_core::wire::{Packet, PacketType};
use reto_core::{ConnectionIdentifier, PeerIdentifier};

use crate::error::RoutingError;

/// Collects establishment confirmations from the destination set
///
/// Registered as the handler for confirmation packets on the initiator's
/// connection; `wait` resolves once every destination has confirmed.
pub(crate) struct ConfirmationTracker {
    expected: HashSet<PeerIdentifier>,
    received: Mutex<HashSet<PeerIdentifier>>,
    notify: Notify,
}

const CONFIRMATION_TYPES: [PacketType; 1] =
    [PacketType::RoutedConnectionEstablishedConfirmation];

impl ConfirmationTracker {
    pub(crate) fn new(expected: HashSet<PeerIdentifier>) -> Arc<Self> {
        Arc::new(Self {
            expected,
            received: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        })
    }

    fn is_complete(&self) -> bool {
        *self.received.lock().unwrap() == self.expected
    }

    fn missing(&self) -> Vec<PeerIdentifier> {
        let received = self.received.lock().unwrap();
        let mut missing: Vec<_> = self.expected.difference(&received).copied().collect();
        missing.sort();
        missing
    }

    /// Wait for all confirmations, bounded by `timeout`
    pub(crate) async fn wait(&self, timeout: Duration) -> Result<(), RoutingError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.is_complete() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(RoutingError::PartiallyEstablished {
                    missing: self.missing(),
                });
            }
        }
    }
}

impl PacketHandler for ConfirmationTracker {
    fn handled_types(&self) -> &[PacketType] {
        &CONFIRMATION_TYPES
    }

    fn handle_packet(&self, packet: Packet) {
        if let Packet::RoutedConnectionEstablishedConfirmation(confirmation) = packet {
            if !self.expected.contains(&confirmation.source) {
                tracing::warn!(
                    source = %confirmation.source.short_id(),
                    "confirmation from a peer outside the destination set"
                );
                return;
            }
            let complete = {
                let mut received = self.received.lock().unwrap();
                received.insert(confirmation.source);
                *received == self.expected
            };
            if complete {
                self.notify.notify_waiters();
            }
        }
    }
}

/// A routed connection to one or more destinations
///
/// Dropping the connection detaches its handlers; call [`close`] for an
/// orderly shutdown instead.
///
/// [`close`]: RoutedConnection::close
pub struct RoutedConnection {
    identifier: ConnectionIdentifier,
    destinations: HashSet<PeerIdentifier>,
    connection: Arc<PacketConnection>,
    reliability: Arc<ReliabilityManager>,
    transfers: Arc<TransferManager>,
    /// Initiator side keeps the confirmation handler registered for late
    /// confirmations after reconnects
    _confirmations: Option<Arc<ConfirmationTracker>>,
}

impl std::fmt::Debug for RoutedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedConnection")
            .field("identifier", &self.identifier)
            .field("destinations", &self.destinations)
            .finish_non_exhaustive()
    }
}

impl RoutedConnection {
    pub(crate) fn new(
        identifier: ConnectionIdentifier,
        destinations: HashSet<PeerIdentifier>,
        connection: Arc<PacketConnection>,
        reliability: Arc<ReliabilityManager>,
        transfers: Arc<TransferManager>,
        confirmations: Option<Arc<ConfirmationTracker>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            destinations,
            connection,
            reliability,
            transfers,
            _confirmations: confirmations,
        })
    }

    /// Stable identifier of this connection across reconnects
    pub fn identifier(&self) -> ConnectionIdentifier {
        self.identifier
    }

    /// The destination peers
    pub fn destinations(&self) -> &HashSet<PeerIdentifier> {
        &self.destinations
    }

    /// Current state of the underlying packet connection
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Send a payload to every destination as a chunked transfer
    pub fn send_data(&self, data: Bytes) -> Arc<OutTransfer> {
        self.transfers.send(data)
    }

    /// Observe inbound transfers
    pub fn on_transfer(&self, hook: impl Fn(Arc<InTransfer>) + Send + Sync + 'static) {
        self.transfers.set_on_transfer(hook);
    }

    /// Start an orderly close
    pub fn close(&self) {
        self.reliability.close_connection();
    }

    pub(crate) fn packet_connection(&self) -> &Arc<PacketConnection> {
        &self.connection
    }
}
