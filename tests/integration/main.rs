//! Parley integration test harness.
//!
//! Tests run real nodes in-process over loopback TCP. Every node binds an
//! OS-assigned port, so tests do not interfere with each other and need no
//! special environment. Discovery is not exercised here; multicast is not
//! reliably available on CI hosts.

mod infra;

mod chat;
mod mesh;
mod peer_exchange;
mod shutdown;

pub use infra::*;
