//! Next-hop tree construction
//!
//! A routed connection to a destination set is described by a tree rooted at
//! the initiating peer: the root's children are the distinct next hops, and
//! each destination hangs as a leaf under its next hop. A destination that is
//! itself a next hop is just that child node. Children are ordered by
//! identifier, so two peers with the same routing table build identical
//! trees.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use reto_core::{PeerIdentifier, Tree};

use crate::error::RoutingError;
use crate::table::RoutingTable;

/// Build the next-hop tree for a destination set
///
/// Fails with [`RoutingError::NoRouteForDestination`] on the first
/// destination missing from the table.
pub fn next_hop_tree(
    table: &RoutingTable,
    destinations: &HashSet<PeerIdentifier>,
) -> Result<Tree<PeerIdentifier>, RoutingError> {
    let (tree, missing) = partial_next_hop_tree(table, destinations)?;
    match missing.first() {
        Some(destination) => Err(RoutingError::NoRouteForDestination(*destination)),
        None => Ok(tree),
    }
}

/// Build the next-hop tree for the routable subset of a destination set
///
/// Returns the tree plus the destinations with no route, ordered by
/// identifier. Fails only when the destination set is empty or nothing in
/// it is routable.
pub fn partial_next_hop_tree(
    table: &RoutingTable,
    destinations: &HashSet<PeerIdentifier>,
) -> Result<(Tree<PeerIdentifier>, Vec<PeerIdentifier>), RoutingError> {
    if destinations.is_empty() {
        return Err(RoutingError::EmptyDestinationSet);
    }

    let local = table.local();
    let mut by_hop: BTreeMap<PeerIdentifier, BTreeSet<PeerIdentifier>> = BTreeMap::new();
    let mut missing = Vec::new();

    let mut ordered: Vec<_> = destinations.iter().copied().collect();
    ordered.sort();
    for destination in ordered {
        if destination == local {
            continue;
        }
        match table.next_hop(&destination) {
            Some(hop) => {
                by_hop.entry(hop).or_default().insert(destination);
            }
            None => missing.push(destination),
        }
    }

    if by_hop.is_empty() {
        let first = missing
            .first()
            .copied()
            .ok_or(RoutingError::EmptyDestinationSet)?;
        return Err(RoutingError::Unreachable(first));
    }

    let subtrees = by_hop
        .into_iter()
        .map(|(hop, reached)| {
            let children = reached
                .into_iter()
                .filter(|destination| *destination != hop)
                .map(Tree::leaf)
                .collect();
            Tree::new(hop, children)
        })
        .collect();

    Ok((Tree::new(local, subtrees), missing))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(digit: u8) -> PeerIdentifier {
        PeerIdentifier::from_bytes([digit; 16])
    }

    /// Table of peer A with routes D,E via X and F via Y
    fn sample_table() -> RoutingTable {
        let a = peer(0xa);
        let x = peer(0x10);
        let y = peer(0x20);

        let mut table = RoutingTable::new(a);
        table.neighbor_up(x);
        table.neighbor_up(y);
        table.apply_update(x, &[(peer(0xd), 1), (peer(0xe), 1)], &[]);
        table.apply_update(y, &[(peer(0xf), 1)], &[]);
        table
    }

    #[test]
    fn test_tree_groups_destinations_by_next_hop() {
        let table = sample_table();
        let destinations = HashSet::from([peer(0xd), peer(0xe), peer(0xf)]);

        let tree = next_hop_tree(&table, &destinations).unwrap();

        let expected = Tree::new(
            peer(0xa),
            vec![
                Tree::new(peer(0x10), vec![Tree::leaf(peer(0xd)), Tree::leaf(peer(0xe))]),
                Tree::new(peer(0x20), vec![Tree::leaf(peer(0xf))]),
            ],
        );
        assert_eq!(tree, expected);
    }

    #[test]
    fn test_tree_is_deterministic_across_insertion_orders() {
        let a = peer(0xa);
        let x = peer(0x10);
        let y = peer(0x20);

        let mut other = RoutingTable::new(a);
        other.neighbor_up(y);
        other.neighbor_up(x);
        other.apply_update(y, &[(peer(0xf), 1)], &[]);
        other.apply_update(x, &[(peer(0xe), 1), (peer(0xd), 1)], &[]);

        let destinations = HashSet::from([peer(0xd), peer(0xe), peer(0xf)]);
        assert_eq!(
            next_hop_tree(&sample_table(), &destinations).unwrap(),
            next_hop_tree(&other, &destinations).unwrap()
        );
    }

    #[test]
    fn test_destination_that_is_a_next_hop_is_a_single_node() {
        let table = sample_table();
        let destinations = HashSet::from([peer(0x10), peer(0xd)]);

        let tree = next_hop_tree(&table, &destinations).unwrap();
        let expected = Tree::new(
            peer(0xa),
            vec![Tree::new(peer(0x10), vec![Tree::leaf(peer(0xd))])],
        );
        assert_eq!(tree, expected);
    }

    #[test]
    fn test_unicast_to_neighbor_is_a_leaf_child() {
        let table = sample_table();
        let tree = next_hop_tree(&table, &HashSet::from([peer(0x20)])).unwrap();
        assert_eq!(
            tree,
            Tree::new(peer(0xa), vec![Tree::leaf(peer(0x20))])
        );
    }

    #[test]
    fn test_missing_route_is_an_error() {
        let table = sample_table();
        let destinations = HashSet::from([peer(0xd), peer(0x77)]);
        assert_eq!(
            next_hop_tree(&table, &destinations),
            Err(RoutingError::NoRouteForDestination(peer(0x77)))
        );
    }

    #[test]
    fn test_partial_tree_reports_missing() {
        let table = sample_table();
        let destinations = HashSet::from([peer(0xd), peer(0x77)]);

        let (tree, missing) = partial_next_hop_tree(&table, &destinations).unwrap();
        assert_eq!(missing, vec![peer(0x77)]);
        assert!(tree.contains(&peer(0xd)));
        assert!(!tree.contains(&peer(0x77)));
    }

    #[test]
    fn test_empty_destination_set_is_an_error() {
        let table = sample_table();
        assert_eq!(
            next_hop_tree(&table, &HashSet::new()),
            Err(RoutingError::EmptyDestinationSet)
        );
    }

    #[test]
    fn test_fully_unreachable_set_is_an_error() {
        let table = RoutingTable::new(peer(0xa));
        assert_eq!(
            next_hop_tree(&table, &HashSet::from([peer(0x77)])),
            Err(RoutingError::Unreachable(peer(0x77)))
        );
    }
}
