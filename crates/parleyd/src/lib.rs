//! parleyd — the Parley chat node: connections, peer exchange, relay and
//! LAN discovery. The `parleyd` binary wraps this with a console.

pub mod connection;
pub mod console;
pub mod discovery;
pub mod netif;
pub mod node;

pub use connection::{Connection, Origin};
pub use discovery::{DiscoveryError, DiscoveryService};
pub use node::{Node, NodeError, NodeOptions};
