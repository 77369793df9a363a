//! Connection plumbing for Arclink.
//!
//! The logic thread is single-threaded and synchronous; sockets live on a
//! pool of I/O threads. This crate is the boundary between the two:
//!
//! - [`Network`] is what the logic thread calls (connect, send, close).
//!   Every call is non-blocking.
//! - [`NetEvent`]s are what the I/O threads report back, through bounded
//!   [`handoff`] queues ([`lanes`]) the logic thread drains once per tick.
//!
//! [`TcpNetwork`] is the real implementation. [`memory::MemoryNetwork`]
//! records commands instead of sending them, for deterministic tests.

mod error;
mod event;
mod handoff;
pub mod memory;
mod network;
mod tcp;

pub use error::TransportError;
pub use event::{ConnectTicket, Lane, LaneReceivers, LaneSenders, NetEvent, lanes};
pub use handoff::{Drain, HandoffError, HandoffReceiver, HandoffSender, handoff};
pub use network::Network;
pub use tcp::{TcpNetwork, TransportConfig};

use std::fmt;

/// Opaque identifier for a connection.
///
/// Assigned by the transport and never reused while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
