//! An in-memory [`Network`] that records what the logic thread asked for.
//!
//! Nothing is actually sent. A test (or a deterministic simulation) drains
//! the recorded [`Command`]s and decides what the "wire" does with them:
//! deliver, drop, reorder, or cut the connection. This keeps session tests
//! free of sockets and timing.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use arclink_protocol::{PeerId, WireMessage};

use crate::{ConnectTicket, ConnectionId, Lane, Network};

/// One recorded outbound operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        ticket: ConnectTicket,
        peer: PeerId,
        host: String,
        port: u16,
        lane: Lane,
    },
    Send {
        conn: ConnectionId,
        msg: WireMessage,
    },
    Close {
        conn: ConnectionId,
    },
}

/// See the module docs.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    commands: Mutex<Vec<Command>>,
    closed: Mutex<HashSet<ConnectionId>>,
    next_ticket: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything recorded so far.
    pub fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut *lock(&self.commands))
    }

    /// Removes everything recorded so far and returns only the messages
    /// sent on `conn`, in order.
    pub fn take_sent(&self, conn: ConnectionId) -> Vec<WireMessage> {
        self.take_commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::Send { conn: c, msg } if c == conn => Some(msg),
                _ => None,
            })
            .collect()
    }

    /// Whether `close` was ever called for `conn`.
    pub fn is_closed(&self, conn: ConnectionId) -> bool {
        lock(&self.closed).contains(&conn)
    }
}

impl Network for MemoryNetwork {
    fn connect(&self, peer: PeerId, host: &str, port: u16, lane: Lane) -> ConnectTicket {
        let ticket = ConnectTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.commands).push(Command::Connect {
            ticket,
            peer,
            host: host.to_string(),
            port,
            lane,
        });
        ticket
    }

    fn send(&self, conn: ConnectionId, msg: WireMessage) -> bool {
        if self.is_closed(conn) {
            return false;
        }
        lock(&self.commands).push(Command::Send { conn, msg });
        true
    }

    fn close(&self, conn: ConnectionId) {
        lock(&self.closed).insert(conn);
        lock(&self.commands).push(Command::Close { conn });
    }
}

/// A poisoned lock only means another test thread panicked mid-push;
/// the recorded data is still usable.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
