//! Binary packet codec
//!
//! Every protocol frame starts with a 32-bit little-endian [`PacketType`]
//! discriminant followed by the packet body. Integers are fixed-width
//! little-endian, identifiers are 16 raw bytes, sequences are count-prefixed
//! and trees are encoded preorder. The layouts here are normative; changing
//! them breaks wire compatibility.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::identity::{ConnectionIdentifier, PeerIdentifier};
use crate::tree::Tree;

/// Closed set of packet type discriminants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    LinkHandshake = 1,
    MulticastHandshake = 2,
    RoutedConnectionEstablishedConfirmation = 3,
    CloseRequest = 4,
    CloseAnnounce = 5,
    CloseAcknowledge = 6,
    DataPacket = 7,
    TransferStarted = 8,
    TransferCancelled = 9,
    TransferCompleted = 10,
    ManagedConnectionHandshake = 11,
    RemoteP2PStartAdvertisement = 12,
    RemoteP2PStopAdvertisement = 13,
    RemoteP2PStartBrowsing = 14,
    RemoteP2PStopBrowsing = 15,
    RemoteP2PPeerAdded = 16,
    RemoteP2PPeerRemoved = 17,
    RemoteP2PConnectionRequest = 18,
    ReachabilityUpdate = 19,
}

impl PacketType {
    /// Map a raw discriminant back to the type
    pub fn from_raw(raw: u32) -> Option<Self> {
        use PacketType::*;
        Some(match raw {
            1 => LinkHandshake,
            2 => MulticastHandshake,
            3 => RoutedConnectionEstablishedConfirmation,
            4 => CloseRequest,
            5 => CloseAnnounce,
            6 => CloseAcknowledge,
            7 => DataPacket,
            8 => TransferStarted,
            9 => TransferCancelled,
            10 => TransferCompleted,
            11 => ManagedConnectionHandshake,
            12 => RemoteP2PStartAdvertisement,
            13 => RemoteP2PStopAdvertisement,
            14 => RemoteP2PStartBrowsing,
            15 => RemoteP2PStopBrowsing,
            16 => RemoteP2PPeerAdded,
            17 => RemoteP2PPeerRemoved,
            18 => RemoteP2PConnectionRequest,
            19 => ReachabilityUpdate,
            _ => return None,
        })
    }
}

/// What a freshly opened direct link is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ConnectionPurpose {
    Unknown = 0,
    RoutingConnection = 1,
    RoutedConnection = 2,
}

impl ConnectionPurpose {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Unknown),
            1 => Some(Self::RoutingConnection),
            2 => Some(Self::RoutedConnection),
            _ => None,
        }
    }
}

/// First frame on any direct link; names the sender and the link's purpose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandshake {
    pub peer_identifier: PeerIdentifier,
    pub purpose: ConnectionPurpose,
}

/// Asks the receiver to take part in a routed connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastHandshake {
    pub source: PeerIdentifier,
    pub destinations: Vec<PeerIdentifier>,
    pub next_hop_tree: Tree<PeerIdentifier>,
}

/// Sent upstream by each destination once its end is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutedConnectionEstablishedConfirmation {
    pub source: PeerIdentifier,
}

/// Acknowledges a close announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseAcknowledge {
    pub source: PeerIdentifier,
}

/// One chunk of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub transfer_identifier: u32,
    pub chunk: Bytes,
}

/// Announces an inbound transfer and its total length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStarted {
    pub transfer_identifier: u32,
    pub length: u32,
}

/// Aborts a transfer on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCancelled {
    pub transfer_identifier: u32,
}

/// Marks the last chunk of a transfer as sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCompleted {
    pub transfer_identifier: u32,
}

/// Names the user-facing connection a fresh link belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedConnectionHandshake {
    pub connection_identifier: ConnectionIdentifier,
}

/// Relay control packet kinds (WebSocket relay transport)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteP2PKind {
    StartAdvertisement,
    StopAdvertisement,
    StartBrowsing,
    StopBrowsing,
    PeerAdded,
    PeerRemoved,
    ConnectionRequest,
}

impl RemoteP2PKind {
    /// Packet type carrying this kind
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::StartAdvertisement => PacketType::RemoteP2PStartAdvertisement,
            Self::StopAdvertisement => PacketType::RemoteP2PStopAdvertisement,
            Self::StartBrowsing => PacketType::RemoteP2PStartBrowsing,
            Self::StopBrowsing => PacketType::RemoteP2PStopBrowsing,
            Self::PeerAdded => PacketType::RemoteP2PPeerAdded,
            Self::PeerRemoved => PacketType::RemoteP2PPeerRemoved,
            Self::ConnectionRequest => PacketType::RemoteP2PConnectionRequest,
        }
    }

    fn from_packet_type(packet_type: PacketType) -> Option<Self> {
        match packet_type {
            PacketType::RemoteP2PStartAdvertisement => Some(Self::StartAdvertisement),
            PacketType::RemoteP2PStopAdvertisement => Some(Self::StopAdvertisement),
            PacketType::RemoteP2PStartBrowsing => Some(Self::StartBrowsing),
            PacketType::RemoteP2PStopBrowsing => Some(Self::StopBrowsing),
            PacketType::RemoteP2PPeerAdded => Some(Self::PeerAdded),
            PacketType::RemoteP2PPeerRemoved => Some(Self::PeerRemoved),
            PacketType::RemoteP2PConnectionRequest => Some(Self::ConnectionRequest),
            _ => None,
        }
    }
}

/// Relay control packet: kind plus the peer it concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteP2PPacket {
    pub kind: RemoteP2PKind,
    pub peer: PeerIdentifier,
}

/// Reachability delta exchanged over routing connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityUpdate {
    pub source: PeerIdentifier,
    /// Destinations now reachable through the sender, with hop counts
    pub added: Vec<(PeerIdentifier, u32)>,
    /// Destinations no longer reachable through the sender
    pub removed: Vec<PeerIdentifier>,
}

/// A typed protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    LinkHandshake(LinkHandshake),
    MulticastHandshake(MulticastHandshake),
    RoutedConnectionEstablishedConfirmation(RoutedConnectionEstablishedConfirmation),
    CloseRequest,
    CloseAnnounce,
    CloseAcknowledge(CloseAcknowledge),
    DataPacket(DataPacket),
    TransferStarted(TransferStarted),
    TransferCancelled(TransferCancelled),
    TransferCompleted(TransferCompleted),
    ManagedConnectionHandshake(ManagedConnectionHandshake),
    RemoteP2P(RemoteP2PPacket),
    ReachabilityUpdate(ReachabilityUpdate),
}

impl Packet {
    /// Discriminant this packet serializes under
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::LinkHandshake(_) => PacketType::LinkHandshake,
            Self::MulticastHandshake(_) => PacketType::MulticastHandshake,
            Self::RoutedConnectionEstablishedConfirmation(_) => {
                PacketType::RoutedConnectionEstablishedConfirmation
            }
            Self::CloseRequest => PacketType::CloseRequest,
            Self::CloseAnnounce => PacketType::CloseAnnounce,
            Self::CloseAcknowledge(_) => PacketType::CloseAcknowledge,
            Self::DataPacket(_) => PacketType::DataPacket,
            Self::TransferStarted(_) => PacketType::TransferStarted,
            Self::TransferCancelled(_) => PacketType::TransferCancelled,
            Self::TransferCompleted(_) => PacketType::TransferCompleted,
            Self::ManagedConnectionHandshake(_) => PacketType::ManagedConnectionHandshake,
            Self::RemoteP2P(p) => p.kind.packet_type(),
            Self::ReachabilityUpdate(_) => PacketType::ReachabilityUpdate,
        }
    }

    /// Serialize into a wire frame
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.packet_type() as u32);
        match self {
            Self::LinkHandshake(p) => {
                put_peer(&mut buf, &p.peer_identifier);
                buf.put_u32_le(p.purpose as u32);
            }
            Self::MulticastHandshake(p) => {
                put_peer(&mut buf, &p.source);
                buf.put_u32_le(p.destinations.len() as u32);
                for dest in &p.destinations {
                    put_peer(&mut buf, dest);
                }
                put_tree(&mut buf, &p.next_hop_tree);
            }
            Self::RoutedConnectionEstablishedConfirmation(p) => put_peer(&mut buf, &p.source),
            Self::CloseRequest | Self::CloseAnnounce => {}
            Self::CloseAcknowledge(p) => put_peer(&mut buf, &p.source),
            Self::DataPacket(p) => {
                buf.put_u32_le(p.transfer_identifier);
                buf.put_slice(&p.chunk);
            }
            Self::TransferStarted(p) => {
                buf.put_u32_le(p.transfer_identifier);
                buf.put_u32_le(p.length);
            }
            Self::TransferCancelled(p) => buf.put_u32_le(p.transfer_identifier),
            Self::TransferCompleted(p) => buf.put_u32_le(p.transfer_identifier),
            Self::ManagedConnectionHandshake(p) => {
                buf.put_slice(p.connection_identifier.as_bytes());
            }
            Self::RemoteP2P(p) => put_peer(&mut buf, &p.peer),
            Self::ReachabilityUpdate(p) => {
                put_peer(&mut buf, &p.source);
                buf.put_u32_le(p.added.len() as u32);
                for (peer, hops) in &p.added {
                    put_peer(&mut buf, peer);
                    buf.put_u32_le(*hops);
                }
                buf.put_u32_le(p.removed.len() as u32);
                for peer in &p.removed {
                    put_peer(&mut buf, peer);
                }
            }
        }
        buf.freeze()
    }

    /// Decode one wire frame
    pub fn deserialize(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = frame;
        let raw = get_u32(&mut buf)?;
        let packet_type = PacketType::from_raw(raw).ok_or(DecodeError::UnexpectedType(raw))?;

        let packet = match packet_type {
            PacketType::LinkHandshake => {
                let peer_identifier = get_peer(&mut buf)?;
                let purpose = ConnectionPurpose::from_raw(get_u32(&mut buf)?)
                    .ok_or(DecodeError::InvalidField("connection purpose"))?;
                Self::LinkHandshake(LinkHandshake {
                    peer_identifier,
                    purpose,
                })
            }
            PacketType::MulticastHandshake => {
                let source = get_peer(&mut buf)?;
                let count = get_count(&mut buf, 16)?;
                if count == 0 {
                    return Err(DecodeError::InvalidField("empty destination set"));
                }
                let mut destinations = Vec::with_capacity(count);
                for _ in 0..count {
                    destinations.push(get_peer(&mut buf)?);
                }
                let next_hop_tree = get_tree(&mut buf)?;
                Self::MulticastHandshake(MulticastHandshake {
                    source,
                    destinations,
                    next_hop_tree,
                })
            }
            PacketType::RoutedConnectionEstablishedConfirmation => {
                Self::RoutedConnectionEstablishedConfirmation(
                    RoutedConnectionEstablishedConfirmation {
                        source: get_peer(&mut buf)?,
                    },
                )
            }
            PacketType::CloseRequest => Self::CloseRequest,
            PacketType::CloseAnnounce => Self::CloseAnnounce,
            PacketType::CloseAcknowledge => Self::CloseAcknowledge(CloseAcknowledge {
                source: get_peer(&mut buf)?,
            }),
            PacketType::DataPacket => {
                let transfer_identifier = get_u32(&mut buf)?;
                let chunk = Bytes::copy_from_slice(buf);
                buf = &[];
                Self::DataPacket(DataPacket {
                    transfer_identifier,
                    chunk,
                })
            }
            PacketType::TransferStarted => Self::TransferStarted(TransferStarted {
                transfer_identifier: get_u32(&mut buf)?,
                length: get_u32(&mut buf)?,
            }),
            PacketType::TransferCancelled => Self::TransferCancelled(TransferCancelled {
                transfer_identifier: get_u32(&mut buf)?,
            }),
            PacketType::TransferCompleted => Self::TransferCompleted(TransferCompleted {
                transfer_identifier: get_u32(&mut buf)?,
            }),
            PacketType::ManagedConnectionHandshake => {
                let mut bytes = [0u8; 16];
                get_exact(&mut buf, &mut bytes)?;
                Self::ManagedConnectionHandshake(ManagedConnectionHandshake {
                    connection_identifier: ConnectionIdentifier::from_bytes(bytes),
                })
            }
            PacketType::ReachabilityUpdate => {
                let source = get_peer(&mut buf)?;
                let added_count = get_count(&mut buf, 20)?;
                let mut added = Vec::with_capacity(added_count);
                for _ in 0..added_count {
                    let peer = get_peer(&mut buf)?;
                    let hops = get_u32(&mut buf)?;
                    added.push((peer, hops));
                }
                let removed_count = get_count(&mut buf, 16)?;
                let mut removed = Vec::with_capacity(removed_count);
                for _ in 0..removed_count {
                    removed.push(get_peer(&mut buf)?);
                }
                Self::ReachabilityUpdate(ReachabilityUpdate {
                    source,
                    added,
                    removed,
                })
            }
            other => {
                // remaining discriminants are the relay control packets
                let kind = RemoteP2PKind::from_packet_type(other)
                    .ok_or(DecodeError::UnexpectedType(raw))?;
                Self::RemoteP2P(RemoteP2PPacket {
                    kind,
                    peer: get_peer(&mut buf)?,
                })
            }
        };

        if !buf.is_empty() {
            return Err(DecodeError::InvalidField("trailing bytes"));
        }
        Ok(packet)
    }

    fn encoded_len(&self) -> usize {
        4 + match self {
            Self::LinkHandshake(_) => 20,
            Self::MulticastHandshake(p) => {
                20 + p.destinations.len() * 16 + p.next_hop_tree.size() * 20
            }
            Self::RoutedConnectionEstablishedConfirmation(_) => 16,
            Self::CloseRequest | Self::CloseAnnounce => 0,
            Self::CloseAcknowledge(_) => 16,
            Self::DataPacket(p) => 4 + p.chunk.len(),
            Self::TransferStarted(_) => 8,
            Self::TransferCancelled(_) | Self::TransferCompleted(_) => 4,
            Self::ManagedConnectionHandshake(_) => 16,
            Self::RemoteP2P(_) => 16,
            Self::ReachabilityUpdate(p) => 24 + p.added.len() * 20 + p.removed.len() * 16,
        }
    }
}

fn put_peer(buf: &mut BytesMut, peer: &PeerIdentifier) {
    buf.put_slice(peer.as_bytes());
}

fn put_tree(buf: &mut BytesMut, tree: &Tree<PeerIdentifier>) {
    put_peer(buf, &tree.value);
    buf.put_u32_le(tree.subtrees.len() as u32);
    for child in &tree.subtrees {
        put_tree(buf, child);
    }
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::TruncatedFrame);
    }
    Ok(buf.get_u32_le())
}

fn get_exact(buf: &mut &[u8], out: &mut [u8]) -> Result<(), DecodeError> {
    if buf.remaining() < out.len() {
        return Err(DecodeError::TruncatedFrame);
    }
    buf.copy_to_slice(out);
    Ok(())
}

fn get_peer(buf: &mut &[u8]) -> Result<PeerIdentifier, DecodeError> {
    let mut bytes = [0u8; 16];
    get_exact(buf, &mut bytes)?;
    Ok(PeerIdentifier::from_bytes(bytes))
}

/// Read a count prefix, rejecting counts the remaining frame cannot hold
fn get_count(buf: &mut &[u8], min_element_len: usize) -> Result<usize, DecodeError> {
    let count = get_u32(buf)? as usize;
    if count.saturating_mul(min_element_len) > buf.remaining() {
        return Err(DecodeError::TruncatedFrame);
    }
    Ok(count)
}

fn get_tree(buf: &mut &[u8]) -> Result<Tree<PeerIdentifier>, DecodeError> {
    let value = get_peer(buf)?;
    let count = get_count(buf, 20)?;
    let mut subtrees = Vec::with_capacity(count);
    for _ in 0..count {
        subtrees.push(get_tree(buf)?);
    }
    Ok(Tree { value, subtrees })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(digit: u8) -> PeerIdentifier {
        PeerIdentifier::from_bytes([digit; 16])
    }

    fn roundtrip(packet: Packet) {
        let frame = packet.serialize();
        assert_eq!(
            &frame[..4],
            (packet.packet_type() as u32).to_le_bytes().as_slice()
        );
        assert_eq!(Packet::deserialize(&frame).unwrap(), packet);
    }

    #[test]
    fn test_link_handshake_wire_layout() {
        let id: PeerIdentifier = "11112222-3333-4444-5555-666677778899".parse().unwrap();
        let packet = Packet::LinkHandshake(LinkHandshake {
            peer_identifier: id,
            purpose: ConnectionPurpose::RoutedConnection,
        });

        let frame = packet.serialize();
        assert_eq!(frame.len(), 24);
        assert_eq!(&frame[..4], [0x01, 0x00, 0x00, 0x00].as_slice());
        assert_eq!(&frame[4..20], id.as_bytes().as_slice());
        assert_eq!(&frame[20..24], [0x02, 0x00, 0x00, 0x00].as_slice());
        assert_eq!(Packet::deserialize(&frame).unwrap(), packet);
    }

    #[test]
    fn test_roundtrip_all_types() {
        roundtrip(Packet::LinkHandshake(LinkHandshake {
            peer_identifier: peer(1),
            purpose: ConnectionPurpose::RoutingConnection,
        }));
        roundtrip(Packet::MulticastHandshake(MulticastHandshake {
            source: peer(1),
            destinations: vec![peer(3), peer(4)],
            next_hop_tree: Tree::new(
                peer(2),
                vec![Tree::leaf(peer(3)), Tree::leaf(peer(4))],
            ),
        }));
        roundtrip(Packet::RoutedConnectionEstablishedConfirmation(
            RoutedConnectionEstablishedConfirmation { source: peer(3) },
        ));
        roundtrip(Packet::CloseRequest);
        roundtrip(Packet::CloseAnnounce);
        roundtrip(Packet::CloseAcknowledge(CloseAcknowledge { source: peer(5) }));
        roundtrip(Packet::DataPacket(DataPacket {
            transfer_identifier: 7,
            chunk: Bytes::from_static(b"chunk bytes"),
        }));
        roundtrip(Packet::TransferStarted(TransferStarted {
            transfer_identifier: 7,
            length: 40_000,
        }));
        roundtrip(Packet::TransferCancelled(TransferCancelled {
            transfer_identifier: 7,
        }));
        roundtrip(Packet::TransferCompleted(TransferCompleted {
            transfer_identifier: 7,
        }));
        roundtrip(Packet::ManagedConnectionHandshake(ManagedConnectionHandshake {
            connection_identifier: ConnectionIdentifier::from_bytes([9; 16]),
        }));
        roundtrip(Packet::RemoteP2P(RemoteP2PPacket {
            kind: RemoteP2PKind::PeerAdded,
            peer: peer(6),
        }));
        roundtrip(Packet::ReachabilityUpdate(ReachabilityUpdate {
            source: peer(1),
            added: vec![(peer(2), 1), (peer(3), 2)],
            removed: vec![peer(4)],
        }));
    }

    #[test]
    fn test_empty_data_packet_chunk() {
        roundtrip(Packet::DataPacket(DataPacket {
            transfer_identifier: 0,
            chunk: Bytes::new(),
        }));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let frame = 0xdead_beefu32.to_le_bytes();
        assert_eq!(
            Packet::deserialize(&frame),
            Err(DecodeError::UnexpectedType(0xdead_beef))
        );
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let frame = Packet::CloseAcknowledge(CloseAcknowledge { source: peer(5) }).serialize();
        for len in 0..frame.len() {
            assert_eq!(
                Packet::deserialize(&frame[..len]),
                Err(DecodeError::TruncatedFrame),
                "prefix of {len} bytes should be truncated"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = Packet::CloseRequest.serialize().to_vec();
        frame.push(0);
        assert_eq!(
            Packet::deserialize(&frame),
            Err(DecodeError::InvalidField("trailing bytes"))
        );
    }

    #[test]
    fn test_multicast_handshake_requires_destinations() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(PacketType::MulticastHandshake as u32);
        buf.put_slice(peer(1).as_bytes());
        buf.put_u32_le(0); // no destinations
        buf.put_slice(peer(2).as_bytes());
        buf.put_u32_le(0);
        assert_eq!(
            Packet::deserialize(&buf),
            Err(DecodeError::InvalidField("empty destination set"))
        );
    }

    #[test]
    fn test_oversized_count_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(PacketType::MulticastHandshake as u32);
        buf.put_slice(peer(1).as_bytes());
        buf.put_u32_le(u32::MAX); // count the frame cannot possibly hold
        assert_eq!(Packet::deserialize(&buf), Err(DecodeError::TruncatedFrame));
    }

    #[test]
    fn test_invalid_purpose_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(PacketType::LinkHandshake as u32);
        buf.put_slice(peer(1).as_bytes());
        buf.put_u32_le(9);
        assert_eq!(
            Packet::deserialize(&buf),
            Err(DecodeError::InvalidField("connection purpose"))
        );
    }
}
