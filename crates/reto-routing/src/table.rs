//! Distance-vector routing table
//!
//! Each peer keeps one best next-hop route per known remote identifier.
//! Updates arrive from direct neighbors as add/remove deltas with hop
//! counts; applying an update returns the delta this peer must in turn
//! advertise to its other neighbors. Ties on hop count go to the lower
//! neighbor identifier, so all peers resolve ties the same way.

use std::collections::{BTreeMap, HashSet};

use reto_core::PeerIdentifier;

/// Best known route to one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Direct neighbor the destination is reached through
    pub next_hop: PeerIdentifier,
    /// Hops to the destination (1 for a direct neighbor)
    pub hop_count: u32,
}

/// Changes produced by a table operation, to be advertised onward
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDelta {
    /// Destinations that became reachable or changed hop count, with the
    /// hop count as seen from this peer
    pub added: Vec<(PeerIdentifier, u32)>,
    /// Destinations that became unreachable through this peer
    pub removed: Vec<PeerIdentifier>,
}

impl TableDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Routing table of one peer
#[derive(Debug)]
pub struct RoutingTable {
    local: PeerIdentifier,
    routes: BTreeMap<PeerIdentifier, Route>,
    neighbors: HashSet<PeerIdentifier>,
}

impl RoutingTable {
    pub fn new(local: PeerIdentifier) -> Self {
        Self {
            local,
            routes: BTreeMap::new(),
            neighbors: HashSet::new(),
        }
    }

    /// The peer this table belongs to
    pub fn local(&self) -> PeerIdentifier {
        self.local
    }

    /// Best next hop toward a destination
    pub fn next_hop(&self, destination: &PeerIdentifier) -> Option<PeerIdentifier> {
        self.routes.get(destination).map(|route| route.next_hop)
    }

    /// Full route entry toward a destination
    pub fn route(&self, destination: &PeerIdentifier) -> Option<Route> {
        self.routes.get(destination).copied()
    }

    /// Whether a peer is a direct neighbor
    pub fn is_neighbor(&self, peer: &PeerIdentifier) -> bool {
        self.neighbors.contains(peer)
    }

    /// All currently reachable destinations with hop counts, ordered by
    /// identifier
    pub fn reachable(&self) -> Vec<(PeerIdentifier, u32)> {
        self.routes
            .iter()
            .map(|(destination, route)| (*destination, route.hop_count))
            .collect()
    }

    /// Number of reachable destinations
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// A direct link to a neighbor came up
    pub fn neighbor_up(&mut self, neighbor: PeerIdentifier) -> TableDelta {
        self.neighbors.insert(neighbor);
        let candidate = Route {
            next_hop: neighbor,
            hop_count: 1,
        };
        let mut delta = TableDelta::default();
        if self.improves(&neighbor, candidate) {
            self.routes.insert(neighbor, candidate);
            delta.added.push((neighbor, 1));
        }
        delta
    }

    /// A direct link to a neighbor went down; every route through it is gone
    pub fn neighbor_down(&mut self, neighbor: PeerIdentifier) -> TableDelta {
        self.neighbors.remove(&neighbor);
        let mut delta = TableDelta::default();
        self.routes.retain(|destination, route| {
            if route.next_hop == neighbor {
                delta.removed.push(*destination);
                false
            } else {
                true
            }
        });
        delta
    }

    /// Apply a reachability update received from a direct neighbor
    ///
    /// Hop counts in `added` are as seen from the neighbor; one hop is added
    /// for the link to it. Returns the changes to advertise onward.
    pub fn apply_update(
        &mut self,
        from: PeerIdentifier,
        added: &[(PeerIdentifier, u32)],
        removed: &[PeerIdentifier],
    ) -> TableDelta {
        let mut delta = TableDelta::default();

        for (destination, hops) in added {
            if *destination == self.local {
                continue;
            }
            let candidate = Route {
                next_hop: from,
                hop_count: hops.saturating_add(1),
            };
            if self.improves(destination, candidate) {
                self.routes.insert(*destination, candidate);
                delta.added.push((*destination, candidate.hop_count));
            }
        }

        for destination in removed {
            if let Some(route) = self.routes.get(destination) {
                if route.next_hop == from {
                    self.routes.remove(destination);
                    delta.removed.push(*destination);
                }
            }
        }

        delta
    }

    /// The full-table advertisement for a freshly connected neighbor
    ///
    /// Split horizon: routes through the neighbor itself are withheld.
    pub fn full_update_for(&self, neighbor: &PeerIdentifier) -> Vec<(PeerIdentifier, u32)> {
        self.routes
            .iter()
            .filter(|&(destination, route)| {
                route.next_hop != *neighbor && *destination != *neighbor
            })
            .map(|(destination, route)| (*destination, route.hop_count))
            .collect()
    }

    fn improves(&self, destination: &PeerIdentifier, candidate: Route) -> bool {
        match self.routes.get(destination) {
            None => true,
            Some(current) => {
                candidate.hop_count < current.hop_count
                    || (candidate.hop_count == current.hop_count
                        && candidate.next_hop < current.next_hop)
            }
        }
    }
}
