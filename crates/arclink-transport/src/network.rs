//! The seam between session logic and sockets.

use std::sync::Arc;

use arclink_protocol::{PeerId, WireMessage};

use crate::{ConnectTicket, ConnectionId, Lane};

/// Outbound operations the logic thread can request.
///
/// Every method is non-blocking: it queues work for an I/O thread and
/// returns. Results come back later as [`NetEvent`](crate::NetEvent)s
/// through the hand-off queue.
///
/// Connections are named by [`ConnectionId`] only. Closing goes through
/// [`close`](Self::close) keyed by that identity, so a session holding a
/// stale id can never close somebody else's live connection.
pub trait Network: Send + Sync + 'static {
    /// Starts dialing `host:port`. Completion is reported on `lane` as
    /// `Connected` or `ConnectFailed` carrying the returned ticket.
    fn connect(&self, peer: PeerId, host: &str, port: u16, lane: Lane) -> ConnectTicket;

    /// Queues `msg` for `conn`. Returns `false` if the connection is gone.
    fn send(&self, conn: ConnectionId, msg: WireMessage) -> bool;

    /// Closes `conn` after anything already queued for it has been written.
    fn close(&self, conn: ConnectionId);

    /// Queues `msg` and closes `conn` once it has been flushed.
    fn send_and_close(&self, conn: ConnectionId, msg: WireMessage) {
        self.send(conn, msg);
        self.close(conn);
    }
}

impl<N: Network + ?Sized> Network for Arc<N> {
    fn connect(&self, peer: PeerId, host: &str, port: u16, lane: Lane) -> ConnectTicket {
        (**self).connect(peer, host, port, lane)
    }

    fn send(&self, conn: ConnectionId, msg: WireMessage) -> bool {
        (**self).send(conn, msg)
    }

    fn close(&self, conn: ConnectionId) {
        (**self).close(conn)
    }

    fn send_and_close(&self, conn: ConnectionId, msg: WireMessage) {
        (**self).send_and_close(conn, msg)
    }
}
