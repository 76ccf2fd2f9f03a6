//! Packet connections, reliability, and transfers
//!
//! The layers here sit between a transport link and the router:
//!
//! - [`PacketConnection`]: multiplexes typed packets over a replaceable
//!   underlying link with a FIFO outbox and weakly held handlers
//! - [`ReliabilityManager`]: the three-packet orderly close and the bounded
//!   reconnect loop for one connection
//! - [`TransferManager`]: chunked, cancellable byte transfers with progress

pub mod packet_connection;
pub mod reliability;
pub mod transfer;

pub use packet_connection::{ConnectionState, PacketConnection, PacketHandler};
pub use reliability::{
    ConnectionManager, ReliabilityDelegate, ReliabilityManager, ReliabilitySettings,
};
pub use transfer::{
    InTransfer, OutTransfer, TransferError, TransferManager, TransferState, DEFAULT_CHUNK_SIZE,
};
