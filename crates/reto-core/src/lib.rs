//! Core types for the reto peer-to-peer substrate
//!
//! This crate holds everything the higher layers share:
//!
//! - [`PeerIdentifier`] / [`ConnectionIdentifier`]: 16-byte identifiers with
//!   byte-lexicographic ordering for deterministic tie-breaks
//! - [`wire`]: the binary packet codec for the closed protocol packet set
//! - [`Tree`]: the next-hop tree value used by routed connections
//! - [`timer`] and [`executor`]: backoff timers, retryable actions and the
//!   start/stop intent helper

pub mod error;
pub mod executor;
pub mod identity;
pub mod timer;
pub mod tree;
pub mod wire;

pub use error::DecodeError;
pub use executor::{DesiredState, RetryAction, RetryableActionExecutor, StartStopHelper};
pub use identity::{ConnectionIdentifier, PeerIdentifier};
pub use timer::{BackoffSettings, RepeatingTimer, TimerAction};
pub use tree::Tree;
pub use wire::{ConnectionPurpose, Packet, PacketType};
