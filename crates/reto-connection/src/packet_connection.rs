//! Packet multiplexing over a replaceable underlying link
//!
//! A [`PacketConnection`] owns at most one underlying link at a time and
//! multiplexes typed packets over it. Outbound packets queue in a FIFO
//! outbox that a drain task empties whenever a link is attached; inbound
//! frames are decoded and dispatched to exactly one registered handler per
//! packet type. The link can be swapped without losing the outbox.
//!
//! Handlers hold non-owning back-references to their owners, so the
//! connection stores them weakly and prunes slots whose owner is gone.
//!
//! Every attached link gets a generation number; tasks started for an old
//! link check it and go inert once the link is detached, so stale
//! completions cannot corrupt the state machine.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tracing::{debug, error, warn};

use reto_core::wire::{Packet, PacketType};
use reto_core::PeerIdentifier;
use reto_transport::link::{Link, LinkChannel, LinkError, LinkEvent};

/// Lifecycle states of a packet connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link has been attached yet
    Idle,
    /// A link is attached and the outbox is empty
    Connected,
    /// A link is attached and the outbox is being drained
    Draining,
    /// The link is gone
    Closed,
}

/// Receives packets and lifecycle notifications from a [`PacketConnection`]
///
/// Callbacks run on the connection's reader or drain task; they must not
/// block. Two handlers on one connection must not claim the same packet
/// type.
pub trait PacketHandler: Send + Sync {
    /// Packet types this handler consumes
    fn handled_types(&self) -> &[PacketType];

    /// One inbound packet of a claimed type
    fn handle_packet(&self, packet: Packet);

    /// The underlying link is about to be replaced
    fn will_swap_underlying_link(&self) {}

    /// A fresh underlying link was attached
    fn underlying_link_connected(&self) {}

    /// The underlying link is gone; `None` means an orderly close
    fn underlying_link_closed(&self, _error: Option<LinkError>) {}

    /// The outbox just became empty
    fn did_write_all_packets(&self) {}
}

struct HandlerSlot {
    types: Vec<PacketType>,
    handler: Weak<dyn PacketHandler>,
}

struct Inner {
    link: Option<Arc<dyn Link>>,
    generation: u64,
    outbox: VecDeque<Bytes>,
    state: ConnectionState,
    handlers: Vec<HandlerSlot>,
    consecutive_decode_errors: u32,
}

/// Multiplexes typed packets over a replaceable underlying link
pub struct PacketConnection {
    destinations: HashSet<PeerIdentifier>,
    decode_error_limit: Option<u32>,
    inner: Mutex<Inner>,
    // for handing the connection to its own reader and drain tasks
    self_ref: Weak<PacketConnection>,
}

impl PacketConnection {
    /// Create a connection with no underlying link
    pub fn new(destinations: HashSet<PeerIdentifier>) -> Arc<Self> {
        Self::build(destinations, None)
    }

    /// Create a connection that tears its link down after `limit`
    /// consecutive decode errors (used for routing links)
    pub fn with_decode_error_limit(
        destinations: HashSet<PeerIdentifier>,
        limit: u32,
    ) -> Arc<Self> {
        Self::build(destinations, Some(limit))
    }

    fn build(destinations: HashSet<PeerIdentifier>, decode_error_limit: Option<u32>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            destinations,
            decode_error_limit,
            inner: Mutex::new(Inner {
                link: None,
                generation: 0,
                outbox: VecDeque::new(),
                state: ConnectionState::Idle,
                handlers: Vec::new(),
                consecutive_decode_errors: 0,
            }),
            self_ref: self_ref.clone(),
        })
    }

    /// Peers this connection talks to
    pub fn destinations(&self) -> &HashSet<PeerIdentifier> {
        &self.destinations
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    /// Whether a link is currently attached
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Draining
        )
    }

    /// Register a handler for its declared packet types
    ///
    /// The handler is stored weakly; keep the `Arc` alive for as long as the
    /// handler should receive packets. Claiming a type another live handler
    /// already claims is a programming error; the registration is refused.
    pub fn add_handler<H: PacketHandler + 'static>(&self, handler: &Arc<H>) {
        let types = handler.handled_types().to_vec();
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.retain(|slot| slot.handler.strong_count() > 0);

        let overlapping = inner
            .handlers
            .iter()
            .any(|slot| slot.types.iter().any(|t| types.contains(t)));
        if overlapping {
            error!(?types, "refusing handler with overlapping packet types");
            debug_assert!(false, "two handlers claimed overlapping packet types");
            return;
        }

        let handler: Arc<dyn PacketHandler> = handler.clone();
        inner.handlers.push(HandlerSlot {
            types,
            handler: Arc::downgrade(&handler),
        });
    }

    /// Unregister a previously added handler
    pub fn remove_handler<H: PacketHandler + 'static>(&self, handler: &Arc<H>) {
        let target: Arc<dyn PacketHandler> = handler.clone();
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.retain(|slot| {
            slot.handler
                .upgrade()
                .map(|h| !Arc::ptr_eq(&h, &target))
                .unwrap_or(false)
        });
    }

    /// Queue a packet for transmission
    ///
    /// Returns immediately; packets written in sequence reach the peer in
    /// write order once a link is attached.
    pub fn write(&self, packet: &Packet) {
        let frame = packet.serialize();
        let start = {
            let mut inner = self.inner.lock().unwrap();
            inner.outbox.push_back(frame);
            if inner.state == ConnectionState::Connected {
                inner.state = ConnectionState::Draining;
                inner
                    .link
                    .clone()
                    .map(|link| (link, inner.generation))
            } else {
                None
            }
        };
        if let Some((link, generation)) = start {
            self.spawn_drain(link, generation);
        }
    }

    /// Attach a fresh underlying link
    ///
    /// Transitions to `Connected` and resumes draining any queued packets.
    pub fn attach(&self, channel: LinkChannel) {
        let LinkChannel { link, events } = channel;
        let (generation, resume, handlers) = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            inner.link = Some(link.clone());
            inner.state = ConnectionState::Connected;
            inner.consecutive_decode_errors = 0;
            let resume = !inner.outbox.is_empty();
            if resume {
                inner.state = ConnectionState::Draining;
            }
            (inner.generation, resume, live_handlers(&mut inner))
        };

        for handler in handlers {
            handler.underlying_link_connected();
        }
        self.spawn_reader(events, generation);
        if resume {
            self.spawn_drain(link, generation);
        }
    }

    /// Replace the underlying link, keeping the outbox
    ///
    /// The old link is detached without an orderly close; a frame that was
    /// partially sent on it counts as lost, and retransmission is the next
    /// layer's responsibility.
    pub fn swap_underlying_link(&self, channel: LinkChannel) {
        let handlers = {
            let mut inner = self.inner.lock().unwrap();
            live_handlers(&mut inner)
        };
        for handler in &handlers {
            handler.will_swap_underlying_link();
        }
        self.attach(channel);
    }

    /// Tear the underlying link down cleanly
    pub fn disconnect_underlying_link(&self) {
        let (link, handlers) = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            inner.state = ConnectionState::Closed;
            (inner.link.take(), live_handlers(&mut inner))
        };
        if let Some(link) = link {
            tokio::spawn(async move {
                link.close().await;
            });
        }
        for handler in handlers {
            handler.underlying_link_closed(None);
        }
    }

    fn spawn_reader(&self, mut events: tokio::sync::mpsc::Receiver<LinkEvent>, generation: u64) {
        let Some(connection) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Some(event) => event,
                    // sender dropped without a close event
                    None => LinkEvent::Closed(Some(LinkError::ClosedByPeer)),
                };
                if connection.inner.lock().unwrap().generation != generation {
                    return;
                }
                match event {
                    LinkEvent::Message(frame) => connection.dispatch_frame(&frame),
                    LinkEvent::Closed(error) => {
                        connection.link_went_down(generation, error);
                        return;
                    }
                }
            }
        });
    }

    fn spawn_drain(&self, link: Arc<dyn Link>, generation: u64) {
        let Some(connection) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                let frame = {
                    let mut inner = connection.inner.lock().unwrap();
                    if inner.generation != generation
                        || inner.state != ConnectionState::Draining
                    {
                        return;
                    }
                    match inner.outbox.pop_front() {
                        Some(frame) => frame,
                        None => {
                            inner.state = ConnectionState::Connected;
                            let handlers = live_handlers(&mut inner);
                            drop(inner);
                            for handler in handlers {
                                handler.did_write_all_packets();
                            }
                            return;
                        }
                    }
                };
                // the popped frame is not requeued on failure: a frame cut
                // off at a dying link is lost by contract
                if let Err(error) = link.send(frame).await {
                    connection.link_went_down(generation, Some(error));
                    return;
                }
            }
        });
    }

    fn link_went_down(&self, generation: u64, error: Option<LinkError>) {
        let handlers = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation {
                return;
            }
            inner.generation += 1;
            inner.link = None;
            inner.state = ConnectionState::Closed;
            live_handlers(&mut inner)
        };
        debug!(?error, "underlying link went down");
        for handler in handlers {
            handler.underlying_link_closed(error.clone());
        }
    }

    fn dispatch_frame(&self, frame: &[u8]) {
        let packet = match Packet::deserialize(frame) {
            Ok(packet) => {
                self.inner.lock().unwrap().consecutive_decode_errors = 0;
                packet
            }
            Err(decode_error) => {
                let failures = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.consecutive_decode_errors += 1;
                    inner.consecutive_decode_errors
                };
                error!(error = %decode_error, failures, "dropping undecodable frame");
                if let Some(limit) = self.decode_error_limit {
                    if failures >= limit {
                        warn!(limit, "tearing link down after repeated decode errors");
                        self.disconnect_underlying_link();
                    }
                }
                return;
            }
        };

        let packet_type = packet.packet_type();
        let handler = {
            let mut inner = self.inner.lock().unwrap();
            inner.handlers.retain(|slot| slot.handler.strong_count() > 0);
            inner
                .handlers
                .iter()
                .find(|slot| slot.types.contains(&packet_type))
                .and_then(|slot| slot.handler.upgrade())
        };
        match handler {
            Some(handler) => handler.handle_packet(packet),
            None => warn!(?packet_type, "no handler for inbound packet"),
        }
    }
}

fn live_handlers(inner: &mut Inner) -> Vec<Arc<dyn PacketHandler>> {
    inner.handlers.retain(|slot| slot.handler.strong_count() > 0);
    inner
        .handlers
        .iter()
        .filter_map(|slot| slot.handler.upgrade())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use reto_core::wire::{TransferCompleted, TransferStarted};
    use reto_transport::memory::memory_link_pair;

    /// Handler recording everything it sees
    #[derive(Default)]
    struct RecordingHandler {
        types: Vec<PacketType>,
        packets: Mutex<Vec<Packet>>,
        connects: AtomicU32,
        closes: AtomicU32,
        swaps: AtomicU32,
        drains: AtomicU32,
        last_error: Mutex<Option<Option<LinkError>>>,
    }

    impl RecordingHandler {
        fn new(types: Vec<PacketType>) -> Arc<Self> {
            Arc::new(Self {
                types,
                ..Default::default()
            })
        }
    }

    impl PacketHandler for RecordingHandler {
        fn handled_types(&self) -> &[PacketType] {
            &self.types
        }

        fn handle_packet(&self, packet: Packet) {
            self.packets.lock().unwrap().push(packet);
        }

        fn will_swap_underlying_link(&self) {
            self.swaps.fetch_add(1, Ordering::SeqCst);
        }

        fn underlying_link_connected(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn underlying_link_closed(&self, error: Option<LinkError>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            *self.last_error.lock().unwrap() = Some(error);
        }

        fn did_write_all_packets(&self) {
            self.drains.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn next_frame(channel: &mut LinkChannel) -> Bytes {
        match tokio::time::timeout(Duration::from_secs(5), channel.events.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("link closed")
        {
            LinkEvent::Message(frame) => frame,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn started(identifier: u32) -> Packet {
        Packet::TransferStarted(TransferStarted {
            transfer_identifier: identifier,
            length: 0,
        })
    }

    #[tokio::test]
    async fn test_writes_drain_in_fifo_order() {
        let (local, mut remote) = memory_link_pair();
        let connection = PacketConnection::new(HashSet::new());
        connection.attach(local);

        for identifier in 0..20 {
            connection.write(&started(identifier));
        }
        for identifier in 0..20 {
            let frame = next_frame(&mut remote).await;
            assert_eq!(Packet::deserialize(&frame).unwrap(), started(identifier));
        }
    }

    #[tokio::test]
    async fn test_writes_before_attach_are_queued() {
        let connection = PacketConnection::new(HashSet::new());
        connection.write(&started(1));
        connection.write(&started(2));
        assert_eq!(connection.state(), ConnectionState::Idle);

        let (local, mut remote) = memory_link_pair();
        connection.attach(local);

        assert_eq!(
            Packet::deserialize(&next_frame(&mut remote).await).unwrap(),
            started(1)
        );
        assert_eq!(
            Packet::deserialize(&next_frame(&mut remote).await).unwrap(),
            started(2)
        );
    }

    #[tokio::test]
    async fn test_dispatch_to_matching_handler_only() {
        let (local, remote) = memory_link_pair();
        let connection = PacketConnection::new(HashSet::new());

        let transfer_handler = RecordingHandler::new(vec![PacketType::TransferStarted]);
        let close_handler = RecordingHandler::new(vec![PacketType::CloseAnnounce]);
        connection.add_handler(&transfer_handler);
        connection.add_handler(&close_handler);
        connection.attach(local);

        remote.link.send(started(7).serialize()).await.unwrap();
        remote.link.send(Packet::CloseAnnounce.serialize()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            transfer_handler.packets.lock().unwrap().as_slice(),
            [started(7)].as_slice()
        );
        assert_eq!(
            close_handler.packets.lock().unwrap().as_slice(),
            [Packet::CloseAnnounce].as_slice()
        );
    }

    #[tokio::test]
    async fn test_overlapping_handler_registration_refused() {
        let connection = PacketConnection::new(HashSet::new());
        let first = RecordingHandler::new(vec![PacketType::CloseAnnounce]);
        connection.add_handler(&first);

        let second = RecordingHandler::new(vec![
            PacketType::CloseAnnounce,
            PacketType::CloseRequest,
        ]);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            connection.add_handler(&second);
        }));
        if cfg!(debug_assertions) {
            assert!(result.is_err());
        }
    }

    #[tokio::test]
    async fn test_swap_preserves_outbox() {
        let (local, remote) = memory_link_pair();
        let connection = PacketConnection::new(HashSet::new());
        let handler = RecordingHandler::new(vec![]);
        connection.add_handler(&handler);
        connection.attach(local);

        // stall the first link by dropping its remote end mid-stream
        drop(remote);
        connection.write(&started(1));
        connection.write(&started(2));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (fresh_local, mut fresh_remote) = memory_link_pair();
        connection.swap_underlying_link(fresh_local);
        assert!(handler.swaps.load(Ordering::SeqCst) >= 1);

        // everything still queued goes out on the new link
        let mut seen = Vec::new();
        while let Ok(Some(LinkEvent::Message(frame))) =
            tokio::time::timeout(Duration::from_millis(200), fresh_remote.events.recv()).await
        {
            seen.push(Packet::deserialize(&frame).unwrap());
        }
        assert!(!seen.is_empty());
        assert_eq!(*seen.last().unwrap(), started(2));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_clean_close() {
        let (local, _remote) = memory_link_pair();
        let connection = PacketConnection::new(HashSet::new());
        let handler = RecordingHandler::new(vec![]);
        connection.add_handler(&handler);
        connection.attach(local);

        connection.disconnect_underlying_link();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.last_error.lock().unwrap(), Some(None));
    }

    #[tokio::test]
    async fn test_remote_close_notifies_handlers() {
        let (local, remote) = memory_link_pair();
        let connection = PacketConnection::new(HashSet::new());
        let handler = RecordingHandler::new(vec![]);
        connection.add_handler(&handler);
        connection.attach(local);

        remote.link.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reattach_after_close() {
        let (local, remote) = memory_link_pair();
        let connection = PacketConnection::new(HashSet::new());
        let handler = RecordingHandler::new(vec![]);
        connection.add_handler(&handler);
        connection.attach(local);

        remote.link.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connection.state(), ConnectionState::Closed);

        let (fresh_local, mut fresh_remote) = memory_link_pair();
        connection.attach(fresh_local);
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(handler.connects.load(Ordering::SeqCst), 2);

        connection.write(&started(9));
        assert_eq!(
            Packet::deserialize(&next_frame(&mut fresh_remote).await).unwrap(),
            started(9)
        );
    }

    #[tokio::test]
    async fn test_decode_error_limit_tears_link_down() {
        let (local, remote) = memory_link_pair();
        let connection = PacketConnection::with_decode_error_limit(HashSet::new(), 3);
        let handler = RecordingHandler::new(vec![]);
        connection.add_handler(&handler);
        connection.attach(local);

        for _ in 0..3 {
            remote
                .link
                .send(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decode_errors_below_limit_keep_link() {
        let (local, remote) = memory_link_pair();
        let connection = PacketConnection::with_decode_error_limit(HashSet::new(), 3);
        connection.attach(local);

        for _ in 0..2 {
            remote
                .link
                .send(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]))
                .await
                .unwrap();
        }
        // a good frame resets the consecutive counter
        remote.link.send(started(1).serialize()).await.unwrap();
        for _ in 0..2 {
            remote
                .link
                .send(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_did_write_all_packets_fires() {
        let (local, mut remote) = memory_link_pair();
        let connection = PacketConnection::new(HashSet::new());
        let handler = RecordingHandler::new(vec![]);
        connection.add_handler(&handler);
        connection.attach(local);

        connection.write(&started(1));
        let _ = next_frame(&mut remote).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handler.drains.load(Ordering::SeqCst) >= 1);
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_removed_handler_no_longer_receives() {
        let (local, remote) = memory_link_pair();
        let connection = PacketConnection::new(HashSet::new());
        let handler = RecordingHandler::new(vec![PacketType::TransferStarted]);
        connection.add_handler(&handler);
        connection.attach(local);

        remote.link.send(started(1).serialize()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handler.packets.lock().unwrap().len(), 1);

        connection.remove_handler(&handler);
        remote.link.send(started(2).serialize()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handler.packets.lock().unwrap().len(), 1);

        // the freed types may be claimed again
        let replacement = RecordingHandler::new(vec![PacketType::TransferStarted]);
        connection.add_handler(&replacement);
        remote.link.send(started(3).serialize()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(replacement.packets.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_handler_is_pruned() {
        let (local, remote) = memory_link_pair();
        let connection = PacketConnection::new(HashSet::new());
        let handler = RecordingHandler::new(vec![PacketType::TransferCompleted]);
        connection.add_handler(&handler);
        connection.attach(local);
        drop(handler);

        // nothing panics and the frame is simply dropped
        remote
            .link
            .send(
                Packet::TransferCompleted(TransferCompleted {
                    transfer_identifier: 3,
                })
                .serialize(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(connection.is_connected());
    }
}
