//! End-to-end overlay tests over the in-memory transport
//!
//! Peers discover each other through a shared memory hub, exchange
//! reachability over routing connections, and open routed connections for
//! chunked transfers; the chain test covers relaying through an
//! intermediate that is itself a destination.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use reto_core::PeerIdentifier;
use reto_routing::{CloseReason, RoutedConnection, Router, RouterConfig, RouterEvent, RoutingError};
use reto_transport::MemoryHub;

fn test_config() -> RouterConfig {
    RouterConfig {
        handshake_timeout: Duration::from_secs(5),
        establish_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn spawn_peer(hub: &Arc<MemoryHub>) -> (Arc<Router>, Arc<Mutex<Vec<RouterEvent>>>, PeerIdentifier) {
    let identifier = PeerIdentifier::random();
    let (router, events) = Router::new(identifier, test_config());
    router.add_module(hub.create_module(identifier));
    router.start();
    (router, collect_events(events), identifier)
}

fn collect_events(mut events: mpsc::Receiver<RouterEvent>) -> Arc<Mutex<Vec<RouterEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            sink.lock().unwrap().push(event);
        }
    });
    log
}

fn accepted_connection(log: &Arc<Mutex<Vec<RouterEvent>>>) -> Option<Arc<RoutedConnection>> {
    log.lock().unwrap().iter().find_map(|event| match event {
        RouterEvent::ConnectionAccepted(connection) => Some(connection.clone()),
        _ => None,
    })
}

fn expected_closes(log: &Arc<Mutex<Vec<RouterEvent>>>) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|event| {
            matches!(
                event,
                RouterEvent::ConnectionClosed {
                    reason: CloseReason::Expected,
                    ..
                }
            )
        })
        .count()
}

fn can_reach(router: &Router, peer: PeerIdentifier) -> bool {
    router
        .reachable_peers()
        .iter()
        .any(|(destination, _)| *destination == peer)
}

/// Reachable over the overlay and dialable as a first hop
fn can_dial(router: &Router, peer: PeerIdentifier) -> bool {
    can_reach(router, peer) && router.addressed_peers().contains(&peer)
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|index| (index % 249) as u8).collect::<Vec<u8>>())
}

#[tokio::test]
async fn test_two_peers_exchange_a_transfer() {
    let hub = MemoryHub::new();
    let (router_a, events_a, id_a) = spawn_peer(&hub);
    let (router_b, events_b, id_b) = spawn_peer(&hub);

    wait_for(|| can_dial(&router_a, id_b), "a to reach b").await;
    wait_for(|| can_dial(&router_b, id_a), "b to reach a").await;

    let connection_a = router_a
        .connect(HashSet::from([id_b]))
        .await
        .expect("establish unicast connection");

    wait_for(|| accepted_connection(&events_b).is_some(), "b to accept").await;
    let connection_b = accepted_connection(&events_b).unwrap();
    assert_eq!(connection_b.destinations(), &HashSet::from([id_a]));

    // receive into a buffer on b
    let received: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
    {
        let received = received.clone();
        connection_b.on_transfer(move |transfer| {
            let received = received.clone();
            transfer.set_on_complete_data(move |data| {
                *received.lock().unwrap() = Some(data);
            });
        });
    }

    let data = payload(40_000);
    let transfer = connection_a.send_data(data.clone());
    wait_for(|| received.lock().unwrap().is_some(), "transfer to land").await;
    assert_eq!(received.lock().unwrap().as_ref().unwrap(), &data);
    assert_eq!(transfer.progress(), 40_000);

    // orderly close, seen as expected on both ends
    connection_a.close();
    wait_for(|| expected_closes(&events_a) == 1, "a to close expectedly").await;
    wait_for(|| expected_closes(&events_b) == 1, "b to close expectedly").await;
}

#[tokio::test]
async fn test_chain_multicast_through_intermediate_destination() {
    let hub = MemoryHub::new();
    let id_a = PeerIdentifier::random();
    let id_b = PeerIdentifier::random();
    let id_c = PeerIdentifier::random();
    // a and c only ever see each other through b
    hub.partition(id_a, id_c);

    let mut routers = Vec::new();
    let mut logs = Vec::new();
    for identifier in [id_a, id_b, id_c] {
        let (router, events) = Router::new(identifier, test_config());
        router.add_module(hub.create_module(identifier));
        router.start();
        routers.push(router);
        logs.push(collect_events(events));
    }
    let (router_a, _router_b, router_c) = (&routers[0], &routers[1], &routers[2]);
    let (events_b, events_c) = (&logs[1], &logs[2]);

    // reachability converges across the hop
    wait_for(|| can_reach(router_a, id_c), "a to learn about c").await;
    wait_for(|| can_dial(router_a, id_b), "a to be able to dial b").await;
    wait_for(|| can_dial(&routers[1], id_c), "b to be able to dial c").await;
    assert_eq!(
        router_a
            .reachable_peers()
            .iter()
            .find(|(peer, _)| *peer == id_c)
            .map(|(_, hops)| *hops),
        Some(2)
    );
    wait_for(|| can_reach(router_c, id_a), "c to learn about a").await;

    let connection_a = router_a
        .connect(HashSet::from([id_b, id_c]))
        .await
        .expect("establish multicast connection");

    wait_for(|| accepted_connection(events_b).is_some(), "b to accept").await;
    wait_for(|| accepted_connection(events_c).is_some(), "c to accept").await;
    let connection_b = accepted_connection(events_b).unwrap();
    let connection_c = accepted_connection(events_c).unwrap();

    let received_b: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
    let received_c: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
    for (connection, received) in [(&connection_b, &received_b), (&connection_c, &received_c)] {
        let received = received.clone();
        connection.on_transfer(move |transfer| {
            let received = received.clone();
            transfer.set_on_complete_data(move |data| {
                *received.lock().unwrap() = Some(data);
            });
        });
    }

    let data = payload(5_000);
    connection_a.send_data(data.clone());
    wait_for(|| received_b.lock().unwrap().is_some(), "b to receive").await;
    wait_for(|| received_c.lock().unwrap().is_some(), "c to receive").await;
    assert_eq!(received_b.lock().unwrap().as_ref().unwrap(), &data);
    assert_eq!(received_c.lock().unwrap().as_ref().unwrap(), &data);

    // the three-way close needs acknowledgements from both destinations
    connection_a.close();
    wait_for(|| expected_closes(&logs[0]) == 1, "a to close expectedly").await;
    wait_for(|| expected_closes(events_b) == 1, "b to close expectedly").await;
    wait_for(|| expected_closes(events_c) == 1, "c to close expectedly").await;
}

#[tokio::test]
async fn test_connect_to_unknown_peer_fails() {
    let hub = MemoryHub::new();
    let (router_a, _events_a, _id_a) = spawn_peer(&hub);

    let stranger = PeerIdentifier::random();
    let result = router_a.connect(HashSet::from([stranger])).await;
    assert_eq!(result.unwrap_err(), RoutingError::Unreachable(stranger));
}

#[tokio::test]
async fn test_empty_destination_set_is_rejected() {
    let hub = MemoryHub::new();
    let (router_a, _events_a, _id_a) = spawn_peer(&hub);

    let result = router_a.connect(HashSet::new()).await;
    assert_eq!(result.unwrap_err(), RoutingError::EmptyDestinationSet);
}
