//! Orderly close and automatic reconnection for one packet connection
//!
//! The close protocol is three packets: an announcement, one acknowledgement
//! per destination, and the disconnect once every destination has
//! acknowledged. Duplicate acknowledgements are idempotent.
//!
//! The reconnect loop is a single task that awaits an explicit success or
//! failure from the [`ConnectionManager`] for every attempt; a new attempt
//! never starts while one is in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use reto_core::wire::{CloseAcknowledge, Packet, PacketType};
use reto_core::PeerIdentifier;
use reto_transport::link::LinkError;

use crate::packet_connection::{PacketConnection, PacketHandler};

/// Reconnect pacing, passed through constructors rather than kept globally
#[derive(Debug, Clone)]
pub struct ReliabilitySettings {
    /// Delay before the first reconnect attempt
    pub short_delay: Duration,
    /// Delay between subsequent attempts
    pub regular_delay: Duration,
    /// Attempts before giving up
    pub maximum_attempts: u32,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        Self {
            short_delay: Duration::from_millis(200),
            regular_delay: Duration::from_millis(500),
            maximum_attempts: 5,
        }
    }
}

/// Receives terminal notifications about a managed connection
pub trait ReliabilityDelegate: Send + Sync {
    /// A fresh underlying link is up
    fn connection_connected(&self) {}

    /// The connection finished an orderly close
    fn connection_closed_expectedly(&self);

    /// Reconnection was exhausted; the original link error is attached
    fn connection_closed_unexpectedly(&self, error: Option<LinkError>);
}

/// Re-establishes underlying links and tracks managed connections
///
/// `establish_underlying_link` must attach or swap a fresh link into the
/// connection before returning `Ok`; returning `Err` counts as one failed
/// attempt.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn establish_underlying_link(
        &self,
        connection: &Arc<PacketConnection>,
    ) -> Result<(), LinkError>;

    fn remove_connection(&self, connection: &Arc<PacketConnection>);
}

const CLOSE_TYPES: [PacketType; 3] = [
    PacketType::CloseRequest,
    PacketType::CloseAnnounce,
    PacketType::CloseAcknowledge,
];

struct ReliabilityState {
    acknowledged: HashSet<PeerIdentifier>,
    expecting_close: bool,
    original_error: Option<LinkError>,
    reconnect_task: Option<JoinHandle<()>>,
}

/// Drives the close protocol and the reconnect loop for one connection
pub struct ReliabilityManager {
    connection: Arc<PacketConnection>,
    local_identifier: PeerIdentifier,
    destinations: HashSet<PeerIdentifier>,
    /// Whether this side drives the connection (announces closes itself)
    /// rather than passively hosting it
    driving: bool,
    settings: ReliabilitySettings,
    manager: Arc<dyn ConnectionManager>,
    delegate: Arc<dyn ReliabilityDelegate>,
    state: Mutex<ReliabilityState>,
    self_ref: Weak<ReliabilityManager>,
}

impl ReliabilityManager {
    /// Create the manager and register it on the connection
    ///
    /// The returned `Arc` keeps the handler registration alive; dropping it
    /// detaches the manager.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: Arc<PacketConnection>,
        local_identifier: PeerIdentifier,
        driving: bool,
        settings: ReliabilitySettings,
        manager: Arc<dyn ConnectionManager>,
        delegate: Arc<dyn ReliabilityDelegate>,
    ) -> Arc<Self> {
        let destinations = connection.destinations().clone();
        let this = Arc::new_cyclic(|self_ref| Self {
            connection,
            local_identifier,
            destinations,
            driving,
            settings,
            manager,
            delegate,
            state: Mutex::new(ReliabilityState {
                acknowledged: HashSet::new(),
                expecting_close: false,
                original_error: None,
                reconnect_task: None,
            }),
            self_ref: self_ref.clone(),
        });
        this.connection.add_handler(&this);
        this
    }

    /// Start an orderly close
    ///
    /// The driving side announces directly; a hosted side asks the driving
    /// side to announce.
    pub fn close_connection(&self) {
        if self.driving {
            self.connection.write(&Packet::CloseAnnounce);
        } else {
            self.connection.write(&Packet::CloseRequest);
        }
    }

    /// The packet connection this manager watches
    pub fn connection(&self) -> &Arc<PacketConnection> {
        &self.connection
    }

    fn handle_close_acknowledge(&self, source: PeerIdentifier) {
        if !self.destinations.contains(&source) {
            warn!(source = %source.short_id(), "close acknowledged by a peer outside the destination set");
            return;
        }
        let complete = {
            let mut state = self.state.lock().unwrap();
            state.acknowledged.insert(source);
            if state.acknowledged == self.destinations {
                state.acknowledged.clear();
                state.expecting_close = true;
                true
            } else {
                false
            }
        };
        if complete {
            debug!("all destinations acknowledged close");
            self.connection.disconnect_underlying_link();
        }
    }

    fn schedule_reconnect(&self) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        if state.reconnect_task.is_some() {
            return;
        }
        state.reconnect_task = Some(tokio::spawn(async move {
            Self::reconnect_loop(this).await;
        }));
    }

    async fn reconnect_loop(this: Arc<Self>) {
        for attempt in 1..=this.settings.maximum_attempts {
            let delay = if attempt == 1 {
                this.settings.short_delay
            } else {
                this.settings.regular_delay
            };
            tokio::time::sleep(delay).await;

            debug!(attempt, "attempting to re-establish underlying link");
            match this
                .manager
                .establish_underlying_link(&this.connection)
                .await
            {
                Ok(()) => return,
                Err(error) => {
                    warn!(%error, attempt, "reconnect attempt failed");
                }
            }
        }

        let original_error = {
            let mut state = this.state.lock().unwrap();
            state.reconnect_task = None;
            state.original_error.take()
        };
        warn!("reconnect attempts exhausted");
        this.delegate.connection_closed_unexpectedly(original_error);
        this.manager.remove_connection(&this.connection);
    }
}

impl PacketHandler for ReliabilityManager {
    fn handled_types(&self) -> &[PacketType] {
        &CLOSE_TYPES
    }

    fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::CloseRequest => {
                // a hosted peer wants the connection gone; announce for it
                self.connection.write(&Packet::CloseAnnounce);
            }
            Packet::CloseAnnounce => {
                self.state.lock().unwrap().expecting_close = true;
                self.connection
                    .write(&Packet::CloseAcknowledge(CloseAcknowledge {
                        source: self.local_identifier,
                    }));
            }
            Packet::CloseAcknowledge(acknowledge) => {
                self.handle_close_acknowledge(acknowledge.source);
            }
            other => warn!(packet_type = ?other.packet_type(), "unexpected packet"),
        }
    }

    fn underlying_link_connected(&self) {
        let task = {
            let mut state = self.state.lock().unwrap();
            state.original_error = None;
            state.reconnect_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.delegate.connection_connected();
    }

    fn underlying_link_closed(&self, error: Option<LinkError>) {
        let expecting_close = self.state.lock().unwrap().expecting_close;
        if expecting_close {
            debug!("connection closed expectedly");
            self.delegate.connection_closed_expectedly();
            self.manager.remove_connection(&self.connection);
        } else {
            self.state.lock().unwrap().original_error = error;
            self.schedule_reconnect();
        }
    }
}
