//! Routing core for the reto peer-to-peer substrate
//!
//! The [`Router`] turns a sparse graph of direct links into an overlay:
//! transport modules feed it discovered addresses, routing connections
//! exchange reachability metadata, and routed connections (unicast or
//! multicast) are established along deterministic next-hop trees with
//! per-destination confirmations.

pub mod connection;
pub mod error;
pub mod handshake;
pub mod multicast;
pub mod router;
pub mod spanning;
pub mod table;

pub use connection::RoutedConnection;
pub use error::{HandshakeError, RoutingError};
pub use router::{CloseReason, Router, RouterConfig, RouterEvent};
pub use spanning::{next_hop_tree, partial_next_hop_tree};
pub use table::{Route, RoutingTable, TableDelta};
