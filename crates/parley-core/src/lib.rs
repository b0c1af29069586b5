//! parley-core — wire format, protocol messages, peer addresses and config.
//! All other Parley crates depend on this one.

pub mod addr;
pub mod config;
pub mod message;
pub mod wire;

pub use addr::{AddrError, PeerAddress};
pub use message::{MessageId, MessageTag, ProtocolMessage};
pub use wire::{DatagramKind, DiscoveryDatagram, WireError};
