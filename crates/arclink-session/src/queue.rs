//! The per-session reliable-delivery queue.
//!
//! `MessageQueue` is the *only* owner of sequence and ack state. The state
//! machines in [`client`](crate::client) and [`server`](crate::server) call
//! its methods; they never touch a counter directly.
//!
//! ## Two directions, one struct
//!
//! - **Outbound**: every message we send gets the next sequence number
//!   (starting at 1) when it moves from the *unsent* FIFO to the *sent*
//!   FIFO. It stays in *sent* until the peer's ack covers it, so a
//!   reconnect can replay it.
//! - **Inbound**: `ack` is the highest sequence number we have received
//!   in order. It rides on everything we send.
//!
//! ## The ack window
//!
//! The peer can only legitimately claim to have received up to somewhere
//! between "just before our oldest unacked message" and "our newest sent
//! message":
//!
//! ```text
//!   sent FIFO:      [ 7 ][ 8 ][ 9 ]
//!   valid acks:   6    7    8    9
//! ```
//!
//! With nothing outstanding the window collapses to the last allocated
//! sequence. Anything outside is a desync: the peer either lost messages
//! we already dropped, or acked messages we never sent.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use arclink_protocol::{AckHeartbeat, LogicMessage, WireMessage};
use bytes::Bytes;

/// A message waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Application payload, already encoded by the payload codec.
    Logic { tag: u32, body: Bytes },
    /// Keep-alive. Consumes a sequence number and must be acked like
    /// anything else, which is what keeps the ack window moving.
    Heartbeat,
}

#[derive(Debug, Clone)]
struct Sent {
    sequence: u64,
    item: Outbound,
    deadline: Instant,
}

/// How an incoming sequence number relates to what we have received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    /// Exactly the next one. `ack` has advanced.
    Deliver,
    /// Already received (a replay after reconnect). Drop it.
    Duplicate,
    /// Something in between went missing.
    Gap,
}

/// The peer's view of the stream no longer matches ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("ack {ack} outside window {lower}..={upper}")]
    AckOutOfWindow { ack: u64, lower: u64, upper: u64 },

    #[error("sequence gap: expected {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
}

/// See the module docs.
#[derive(Debug)]
pub struct MessageQueue {
    last_sequence: u64,
    ack: u64,
    /// The ack stamped on the last message we handed out.
    reported_ack: u64,
    sent: VecDeque<Sent>,
    unsent: VecDeque<Outbound>,
    ack_timeout: Duration,
}

impl MessageQueue {
    /// An empty queue. Sent messages must be acked within `ack_timeout`.
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            last_sequence: 0,
            ack: 0,
            reported_ack: 0,
            sent: VecDeque::new(),
            unsent: VecDeque::new(),
            ack_timeout,
        }
    }

    // -- outbound ---------------------------------------------------------

    /// Allocates the next outbound sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.last_sequence += 1;
        self.last_sequence
    }

    /// The range of acks the peer may legitimately report.
    pub fn ack_window(&self) -> (u64, u64) {
        match (self.sent.front(), self.sent.back()) {
            (Some(oldest), Some(newest)) => (oldest.sequence - 1, newest.sequence),
            _ => (self.last_sequence, self.last_sequence),
        }
    }

    pub fn is_ack_valid(&self, ack: u64) -> bool {
        let (lower, upper) = self.ack_window();
        (lower..=upper).contains(&ack)
    }

    /// Drops every sent message covered by `ack`.
    ///
    /// Callers must check [`is_ack_valid`](Self::is_ack_valid) first; an
    /// out-of-window ack here is a bug in the caller.
    pub fn advance(&mut self, ack: u64) {
        debug_assert!(self.is_ack_valid(ack), "advance with invalid ack {ack}");
        while self.sent.front().is_some_and(|s| s.sequence <= ack) {
            self.sent.pop_front();
        }
    }

    pub fn enqueue_logic(&mut self, tag: u32, body: Bytes) {
        self.unsent.push_back(Outbound::Logic { tag, body });
    }

    pub fn enqueue_heartbeat(&mut self) {
        self.unsent.push_back(Outbound::Heartbeat);
    }

    /// Moves everything unsent to the sent FIFO, allocating sequence
    /// numbers and ack deadlines, and returns the wire messages to send.
    pub fn take_unsent(&mut self, now: Instant) -> Vec<WireMessage> {
        let deadline = now + self.ack_timeout;
        let mut out = Vec::with_capacity(self.unsent.len());
        while let Some(item) = self.unsent.pop_front() {
            let sequence = self.next_sequence();
            out.push(to_wire(&item, sequence, self.ack));
            self.sent.push_back(Sent {
                sequence,
                item,
                deadline,
            });
        }
        if !out.is_empty() {
            self.reported_ack = self.ack;
        }
        out
    }

    /// Every sent-unacked message, in order, with the current ack and
    /// fresh deadlines. Used right after a reconnect.
    pub fn replay(&mut self, now: Instant) -> Vec<WireMessage> {
        let deadline = now + self.ack_timeout;
        let ack = self.ack;
        if !self.sent.is_empty() {
            self.reported_ack = ack;
        }
        self.sent
            .iter_mut()
            .map(|s| {
                s.deadline = deadline;
                to_wire(&s.item, s.sequence, ack)
            })
            .collect()
    }

    /// Sent-unacked plus not-yet-sent.
    pub fn cached_len(&self) -> usize {
        self.sent.len() + self.unsent.len()
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent.is_empty()
    }

    /// Ack deadline of the oldest unacked message.
    pub fn oldest_deadline(&self) -> Option<Instant> {
        self.sent.front().map(|s| s.deadline)
    }

    /// Whether a heartbeat is queued or awaiting its ack.
    pub fn heartbeat_outstanding(&self) -> bool {
        self.unsent.iter().any(|o| *o == Outbound::Heartbeat)
            || self.sent.iter().any(|s| s.item == Outbound::Heartbeat)
    }

    /// Whether an idle session should send a heartbeat.
    ///
    /// Not while one is still outstanding, unless we have received
    /// something the peer hasn't seen acked yet. Without that exception two
    /// idle peers would each wait forever for the other to ack.
    pub fn wants_heartbeat(&self) -> bool {
        !self.heartbeat_outstanding() || self.ack > self.reported_ack
    }

    // -- inbound ----------------------------------------------------------

    /// Highest in-order sequence received from the peer.
    pub fn ack(&self) -> u64 {
        self.ack
    }

    /// Classifies an incoming sequence number, advancing `ack` on
    /// [`Incoming::Deliver`].
    pub fn accept_incoming(&mut self, sequence: u64) -> Incoming {
        if sequence <= self.ack {
            Incoming::Duplicate
        } else if sequence == self.ack + 1 {
            self.ack = sequence;
            Incoming::Deliver
        } else {
            Incoming::Gap
        }
    }

    /// Processes the `(ack, sequence)` pair carried by a LOGIC_MESSAGE or
    /// ACK_HEARTBEAT.
    ///
    /// # Errors
    /// [`QueueError`] if the ack is outside the window or a sequence number
    /// was skipped. Either way the session is beyond repair.
    pub fn receive(&mut self, ack: u64, sequence: u64) -> Result<Incoming, QueueError> {
        let (lower, upper) = self.ack_window();
        if !(lower..=upper).contains(&ack) {
            return Err(QueueError::AckOutOfWindow { ack, lower, upper });
        }
        self.advance(ack);
        match self.accept_incoming(sequence) {
            Incoming::Gap => Err(QueueError::Gap {
                expected: self.ack + 1,
                got: sequence,
            }),
            other => Ok(other),
        }
    }
}

fn to_wire(item: &Outbound, sequence: u64, ack: u64) -> WireMessage {
    match item {
        Outbound::Logic { tag, body } => WireMessage::Logic(LogicMessage {
            ack,
            sequence,
            tag: *tag,
            body: body.clone(),
        }),
        Outbound::Heartbeat => WireMessage::Heartbeat(AckHeartbeat { ack, sequence }),
    }
}

// =========================================================================
// Tests
// =========================================================================
