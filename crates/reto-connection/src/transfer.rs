//! Chunked, cancellable byte transfers over a packet connection
//!
//! An outbound payload becomes `TransferStarted`, a run of `DataPacket`
//! chunks and a final `TransferCompleted`. Chunks are queued one at a time:
//! the next chunk goes out when the connection reports its outbox empty, so
//! a large transfer never floods the outbox and progress tracks actual
//! draining.
//!
//! Inbound chunks are handed to `on_partial_data` when set, otherwise
//! buffered and delivered whole through `on_complete_data`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, error, warn};

use reto_core::wire::{
    DataPacket, Packet, PacketType, TransferCancelled, TransferCompleted, TransferStarted,
};

use crate::packet_connection::{PacketConnection, PacketHandler};

/// Default chunk size: 16 KiB
pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;

/// Terminal and non-terminal transfer states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Completed,
    Cancelled,
    Failed,
}

/// Errors a transfer can end with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer was cancelled")]
    Cancelled,

    #[error("underlying link was lost")]
    LinkLost,
}

type ProgressHook = Box<dyn Fn(u32, u32) + Send + Sync>;
type DataHook = Box<dyn Fn(Bytes) + Send + Sync>;
type EndHook = Box<dyn Fn(TransferState) + Send + Sync>;
type TransferHook = Box<dyn Fn(Arc<InTransfer>) + Send + Sync>;

struct OutState {
    progress: u32,
    state: TransferState,
}

/// An outbound transfer
pub struct OutTransfer {
    identifier: u32,
    length: u32,
    data: Bytes,
    state: Mutex<OutState>,
    on_progress: Mutex<Option<ProgressHook>>,
    on_end: Mutex<Option<EndHook>>,
    connection: Weak<PacketConnection>,
}

impl OutTransfer {
    fn new(identifier: u32, data: Bytes, connection: Weak<PacketConnection>) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            length: data.len() as u32,
            data,
            state: Mutex::new(OutState {
                progress: 0,
                state: TransferState::Active,
            }),
            on_progress: Mutex::new(None),
            on_end: Mutex::new(None),
            connection,
        })
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// Bytes handed to the connection so far
    pub fn progress(&self) -> u32 {
        self.state.lock().unwrap().progress
    }

    pub fn state(&self) -> TransferState {
        self.state.lock().unwrap().state
    }

    /// Called after every chunk with (progress, length)
    pub fn set_on_progress(&self, hook: impl Fn(u32, u32) + Send + Sync + 'static) {
        *self.on_progress.lock().unwrap() = Some(Box::new(hook));
    }

    /// Called once with the terminal state
    pub fn set_on_end(&self, hook: impl Fn(TransferState) + Send + Sync + 'static) {
        *self.on_end.lock().unwrap() = Some(Box::new(hook));
    }

    /// Abort the transfer; the receiver drops its buffered bytes
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.state != TransferState::Active {
                return;
            }
            state.state = TransferState::Cancelled;
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.write(&Packet::TransferCancelled(TransferCancelled {
                transfer_identifier: self.identifier,
            }));
        }
        self.finish(TransferState::Cancelled);
    }

    fn next_chunk(&self, chunk_size: u32) -> Option<DataPacket> {
        let mut state = self.state.lock().unwrap();
        if state.state != TransferState::Active || state.progress >= self.length {
            return None;
        }
        let start = state.progress;
        let end = (start + chunk_size).min(self.length);
        state.progress = end;
        Some(DataPacket {
            transfer_identifier: self.identifier,
            chunk: self.data.slice(start as usize..end as usize),
        })
    }

    fn report_progress(&self) {
        let progress = self.progress();
        if let Some(hook) = self.on_progress.lock().unwrap().as_ref() {
            hook(progress, self.length);
        }
    }

    fn mark(&self, terminal: TransferState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.state != TransferState::Active {
            return false;
        }
        state.state = terminal;
        true
    }

    fn finish(&self, terminal: TransferState) {
        if let Some(hook) = self.on_end.lock().unwrap().as_ref() {
            hook(terminal);
        }
    }
}

struct InState {
    progress: u32,
    state: TransferState,
    buffer: BytesMut,
    warned_both_hooks: bool,
}

/// An inbound transfer
///
/// Set `on_partial_data` to stream chunks as they arrive, or
/// `on_complete_data` to receive the reassembled payload at the end. With
/// both set, partial delivery wins.
pub struct InTransfer {
    identifier: u32,
    length: u32,
    state: Mutex<InState>,
    on_partial_data: Mutex<Option<DataHook>>,
    on_complete_data: Mutex<Option<DataHook>>,
    on_progress: Mutex<Option<ProgressHook>>,
    on_end: Mutex<Option<EndHook>>,
    connection: Weak<PacketConnection>,
}

impl InTransfer {
    fn new(identifier: u32, length: u32, connection: Weak<PacketConnection>) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            length,
            state: Mutex::new(InState {
                progress: 0,
                state: TransferState::Active,
                buffer: BytesMut::new(),
                warned_both_hooks: false,
            }),
            on_partial_data: Mutex::new(None),
            on_complete_data: Mutex::new(None),
            on_progress: Mutex::new(None),
            on_end: Mutex::new(None),
            connection,
        })
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    /// Total payload length announced by the sender
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn progress(&self) -> u32 {
        self.state.lock().unwrap().progress
    }

    pub fn state(&self) -> TransferState {
        self.state.lock().unwrap().state
    }

    /// Stream chunks as they arrive instead of buffering
    pub fn set_on_partial_data(&self, hook: impl Fn(Bytes) + Send + Sync + 'static) {
        *self.on_partial_data.lock().unwrap() = Some(Box::new(hook));
    }

    /// Receive the whole reassembled payload on completion
    pub fn set_on_complete_data(&self, hook: impl Fn(Bytes) + Send + Sync + 'static) {
        *self.on_complete_data.lock().unwrap() = Some(Box::new(hook));
    }

    /// Called after every chunk with (progress, length)
    pub fn set_on_progress(&self, hook: impl Fn(u32, u32) + Send + Sync + 'static) {
        *self.on_progress.lock().unwrap() = Some(Box::new(hook));
    }

    /// Called once with the terminal state
    pub fn set_on_end(&self, hook: impl Fn(TransferState) + Send + Sync + 'static) {
        *self.on_end.lock().unwrap() = Some(Box::new(hook));
    }

    /// Abort the transfer from the receiving side
    pub fn cancel(&self) {
        let newly = {
            let mut state = self.state.lock().unwrap();
            if state.state != TransferState::Active {
                false
            } else {
                state.state = TransferState::Cancelled;
                state.buffer = BytesMut::new();
                true
            }
        };
        if !newly {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.write(&Packet::TransferCancelled(TransferCancelled {
                transfer_identifier: self.identifier,
            }));
        }
        self.finish(TransferState::Cancelled);
    }

    fn receive_chunk(&self, chunk: Bytes) {
        let partial = self.on_partial_data.lock().unwrap();
        let complete_is_set = self.on_complete_data.lock().unwrap().is_some();

        if let Some(hook) = partial.as_ref() {
            if complete_is_set {
                let mut state = self.state.lock().unwrap();
                if !state.warned_both_hooks {
                    state.warned_both_hooks = true;
                    warn!(
                        transfer = self.identifier,
                        "both data hooks set; delivering partial data only"
                    );
                }
            }
            self.state.lock().unwrap().progress += chunk.len() as u32;
            hook(chunk);
        } else if complete_is_set {
            let mut state = self.state.lock().unwrap();
            state.buffer.extend_from_slice(&chunk);
            state.progress += chunk.len() as u32;
        } else {
            error!(
                transfer = self.identifier,
                bytes = chunk.len(),
                "no data hook set; dropping payload"
            );
            self.state.lock().unwrap().progress += chunk.len() as u32;
        }
        drop(partial);

        let progress = self.progress();
        if let Some(hook) = self.on_progress.lock().unwrap().as_ref() {
            hook(progress, self.length);
        }
    }

    fn complete(&self) {
        let buffered = {
            let mut state = self.state.lock().unwrap();
            if state.state != TransferState::Active {
                return;
            }
            state.state = TransferState::Completed;
            std::mem::take(&mut state.buffer)
        };
        let partial_is_set = self.on_partial_data.lock().unwrap().is_some();
        if !partial_is_set {
            if let Some(hook) = self.on_complete_data.lock().unwrap().as_ref() {
                hook(buffered.freeze());
            }
        }
        self.finish(TransferState::Completed);
    }

    fn cancelled_by_peer(&self) {
        let newly = {
            let mut state = self.state.lock().unwrap();
            if state.state != TransferState::Active {
                false
            } else {
                state.state = TransferState::Cancelled;
                state.buffer = BytesMut::new();
                true
            }
        };
        if newly {
            self.finish(TransferState::Cancelled);
        }
    }

    fn fail(&self) {
        let newly = {
            let mut state = self.state.lock().unwrap();
            if state.state != TransferState::Active {
                false
            } else {
                state.state = TransferState::Failed;
                state.buffer = BytesMut::new();
                true
            }
        };
        if newly {
            self.finish(TransferState::Failed);
        }
    }

    fn finish(&self, terminal: TransferState) {
        if let Some(hook) = self.on_end.lock().unwrap().as_ref() {
            hook(terminal);
        }
    }
}

struct ManagerState {
    next_identifier: u32,
    outgoing: VecDeque<Arc<OutTransfer>>,
    incoming: HashMap<u32, Arc<InTransfer>>,
}

/// Runs every transfer on one packet connection
///
/// Registers as the packet handler for the four transfer packet types; keep
/// the returned `Arc` alive for as long as the connection transfers data.
pub struct TransferManager {
    connection: Weak<PacketConnection>,
    chunk_size: u32,
    state: Mutex<ManagerState>,
    on_transfer: Mutex<Option<TransferHook>>,
}

const TRANSFER_TYPES: [PacketType; 4] = [
    PacketType::DataPacket,
    PacketType::TransferStarted,
    PacketType::TransferCancelled,
    PacketType::TransferCompleted,
];

impl TransferManager {
    /// Create the manager and register it on the connection
    pub fn new(connection: &Arc<PacketConnection>, chunk_size: u32) -> Arc<Self> {
        let this = Arc::new(Self {
            connection: Arc::downgrade(connection),
            chunk_size: chunk_size.max(1),
            state: Mutex::new(ManagerState {
                next_identifier: 0,
                outgoing: VecDeque::new(),
                incoming: HashMap::new(),
            }),
            on_transfer: Mutex::new(None),
        });
        connection.add_handler(&this);
        this
    }

    /// Observe inbound transfers as they are announced
    pub fn set_on_transfer(&self, hook: impl Fn(Arc<InTransfer>) + Send + Sync + 'static) {
        *self.on_transfer.lock().unwrap() = Some(Box::new(hook));
    }

    /// Start sending a payload; chunks flow as the connection drains
    pub fn send(&self, data: Bytes) -> Arc<OutTransfer> {
        let transfer = {
            let mut state = self.state.lock().unwrap();
            let identifier = state.next_identifier;
            state.next_identifier = state.next_identifier.wrapping_add(1);
            let transfer = OutTransfer::new(identifier, data, self.connection.clone());
            state.outgoing.push_back(transfer.clone());
            transfer
        };

        if let Some(connection) = self.connection.upgrade() {
            debug!(
                transfer = transfer.identifier(),
                length = transfer.length(),
                "starting outbound transfer"
            );
            connection.write(&Packet::TransferStarted(TransferStarted {
                transfer_identifier: transfer.identifier(),
                length: transfer.length(),
            }));
        }
        transfer
    }

    /// Queue the next pending chunk; called when the outbox empties
    fn pump(&self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        loop {
            let front = self.state.lock().unwrap().outgoing.front().cloned();
            let Some(transfer) = front else {
                return;
            };
            match transfer.next_chunk(self.chunk_size) {
                Some(chunk) => {
                    connection.write(&Packet::DataPacket(chunk));
                    transfer.report_progress();
                    return;
                }
                None => {
                    self.state.lock().unwrap().outgoing.pop_front();
                    if transfer.mark(TransferState::Completed) {
                        connection.write(&Packet::TransferCompleted(TransferCompleted {
                            transfer_identifier: transfer.identifier(),
                        }));
                        transfer.finish(TransferState::Completed);
                    }
                    // a cancelled transfer already announced itself
                }
            }
        }
    }

    fn handle_started(&self, started: TransferStarted) {
        let transfer = InTransfer::new(
            started.transfer_identifier,
            started.length,
            self.connection.clone(),
        );
        self.state
            .lock()
            .unwrap()
            .incoming
            .insert(started.transfer_identifier, transfer.clone());
        debug!(
            transfer = started.transfer_identifier,
            length = started.length,
            "inbound transfer announced"
        );
        if let Some(hook) = self.on_transfer.lock().unwrap().as_ref() {
            hook(transfer);
        } else {
            warn!(
                transfer = started.transfer_identifier,
                "inbound transfer has no observer"
            );
        }
    }

    fn handle_data(&self, data: DataPacket) {
        let transfer = self
            .state
            .lock()
            .unwrap()
            .incoming
            .get(&data.transfer_identifier)
            .cloned();
        match transfer {
            Some(transfer) => transfer.receive_chunk(data.chunk),
            None => warn!(
                transfer = data.transfer_identifier,
                "chunk for unknown transfer"
            ),
        }
    }

    fn handle_completed(&self, identifier: u32) {
        let transfer = self.state.lock().unwrap().incoming.remove(&identifier);
        if let Some(transfer) = transfer {
            transfer.complete();
        }
    }

    fn handle_cancelled(&self, identifier: u32) {
        // either direction can cancel; check both sides
        let incoming = self.state.lock().unwrap().incoming.remove(&identifier);
        if let Some(transfer) = incoming {
            debug!(transfer = identifier, "inbound transfer cancelled by peer");
            transfer.cancelled_by_peer();
            return;
        }

        let outgoing = {
            let mut state = self.state.lock().unwrap();
            let position = state
                .outgoing
                .iter()
                .position(|t| t.identifier() == identifier);
            position.and_then(|index| state.outgoing.remove(index))
        };
        if let Some(transfer) = outgoing {
            debug!(transfer = identifier, "outbound transfer cancelled by peer");
            if transfer.mark(TransferState::Cancelled) {
                transfer.finish(TransferState::Cancelled);
            }
        }
    }

    fn link_lost(&self) {
        let (outgoing, incoming) = {
            let mut state = self.state.lock().unwrap();
            (
                std::mem::take(&mut state.outgoing),
                std::mem::take(&mut state.incoming),
            )
        };
        if !outgoing.is_empty() || !incoming.is_empty() {
            warn!(error = %TransferError::LinkLost, "failing active transfers");
        }
        for transfer in outgoing {
            if transfer.mark(TransferState::Failed) {
                transfer.finish(TransferState::Failed);
            }
        }
        for (_, transfer) in incoming {
            transfer.fail();
        }
    }
}

impl PacketHandler for TransferManager {
    fn handled_types(&self) -> &[PacketType] {
        &TRANSFER_TYPES
    }

    fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::TransferStarted(started) => self.handle_started(started),
            Packet::DataPacket(data) => self.handle_data(data),
            Packet::TransferCompleted(completed) => {
                self.handle_completed(completed.transfer_identifier)
            }
            Packet::TransferCancelled(cancelled) => {
                self.handle_cancelled(cancelled.transfer_identifier)
            }
            other => warn!(packet_type = ?other.packet_type(), "unexpected packet"),
        }
    }

    fn did_write_all_packets(&self) {
        self.pump();
    }

    fn underlying_link_closed(&self, error: Option<reto_transport::link::LinkError>) {
        if error.is_some() {
            self.link_lost();
        }
    }
}
