//! Transport contracts for the reto peer-to-peer substrate
//!
//! Concrete transports (local link, WebSocket relay, ...) implement the
//! [`module::Module`] contract: an advertiser accepting incoming links and a
//! browser discovering remote [`module::Address`]es. An opened address yields
//! a [`link::LinkChannel`] — the framed bidirectional pipe everything above
//! is built on.
//!
//! The [`memory`] module is a complete in-process transport used by tests
//! and local demos.

pub mod link;
pub mod memory;
pub mod module;
pub mod relay;

pub use link::{Link, LinkChannel, LinkError, LinkEvent};
pub use memory::{memory_link_pair, MemoryHub, MemoryModule};
pub use module::{
    Address, Advertiser, AdvertiserEvent, Browser, BrowserEvent, Module, ModuleEvents,
};
pub use relay::RelayUrls;
