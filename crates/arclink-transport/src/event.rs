//! Events flowing from the I/O threads to the logic thread.

use std::fmt;

use arclink_protocol::{PeerId, WireMessage};

use crate::{ConnectionId, HandoffReceiver, HandoffSender, handoff};

/// Identifies one outbound connect attempt.
///
/// A session that times out and dials again gets a new ticket, so a late
/// completion of the old attempt can be recognized and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectTicket(pub u64);

impl fmt::Display for ConnectTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket-{}", self.0)
    }
}

/// Which hand-off queue a connection reports into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Reliable sessions, both directions. Drained once per logic tick.
    Main,
    /// Connections dialed by the sync RPC client. Consumed only by a
    /// blocking request.
    Sync,
    /// Connections accepted by the sync RPC listener. Drained once per
    /// logic tick.
    SyncServe,
}

/// Producer halves of every lane. Owned by the network.
#[derive(Debug, Clone)]
pub struct LaneSenders {
    pub main: HandoffSender<NetEvent>,
    pub sync: HandoffSender<NetEvent>,
    pub sync_serve: HandoffSender<NetEvent>,
}

impl LaneSenders {
    pub fn get(&self, lane: Lane) -> &HandoffSender<NetEvent> {
        match lane {
            Lane::Main => &self.main,
            Lane::Sync => &self.sync,
            Lane::SyncServe => &self.sync_serve,
        }
    }
}

/// Consumer halves of every lane. Owned by the logic thread.
#[derive(Debug)]
pub struct LaneReceivers {
    pub main: HandoffReceiver<NetEvent>,
    pub sync: HandoffReceiver<NetEvent>,
    pub sync_serve: HandoffReceiver<NetEvent>,
}

/// Creates all three lanes with the same capacity.
pub fn lanes(capacity: usize) -> (LaneSenders, LaneReceivers) {
    let (main_tx, main_rx) = handoff(capacity);
    let (sync_tx, sync_rx) = handoff(capacity);
    let (serve_tx, serve_rx) = handoff(capacity);
    (
        LaneSenders {
            main: main_tx,
            sync: sync_tx,
            sync_serve: serve_tx,
        },
        LaneReceivers {
            main: main_rx,
            sync: sync_rx,
            sync_serve: serve_rx,
        },
    )
}

/// Something an I/O thread observed.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// An outbound connect completed.
    Connected {
        ticket: ConnectTicket,
        peer: PeerId,
        conn: ConnectionId,
    },

    /// An outbound connect failed or timed out.
    ConnectFailed {
        ticket: ConnectTicket,
        peer: PeerId,
        reason: String,
    },

    /// A message passed the frame codec and the handshake gate.
    /// `peer` is the principal the gate attributes the connection to.
    Inbound {
        conn: ConnectionId,
        peer: PeerId,
        message: WireMessage,
    },

    /// The connection is gone, for whatever reason.
    Closed {
        conn: ConnectionId,
        peer: Option<PeerId>,
    },
}
