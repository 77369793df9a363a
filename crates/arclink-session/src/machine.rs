//! Session state machines as data.
//!
//! The client's transitions live in one table, [`CLIENT_TRANSITIONS`],
//! instead of being scattered across match arms in the manager. The
//! manager reports what happened ([`ClientEvent`]) and asks
//! [`next_state`] where to go; anything not in the table is a bug.
//!
//! ```text
//!                ConnectFailed / ConnectTimedOut
//!                     ┌──────┐
//!                     ▼      │
//!   register ──▶ Connecting ─┘
//!                  ▲    │ ConnectSucceeded
//!                  │    ▼
//!   VerifyTimedOut │  Verifying
//!   Unexpected...  │    │ Verified
//!   TransportClosed│    ▼
//!   AckTimedOut ───┴─ Verified
//! ```
//!
//! Fatal outcomes (desync, too many connect attempts, a rotated token
//! rejected) are not transitions: the session is removed.

use std::fmt;

/// Where a client session is in its connect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Waiting for a TCP connect to complete.
    Connecting,
    /// CONNECT_REQUEST sent, waiting for the matching response.
    Verifying,
    /// Handshake done; messages flow.
    Verified,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
        };
        f.write_str(name)
    }
}

/// Something that happened to a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    ConnectSucceeded,
    ConnectFailed,
    ConnectTimedOut,
    /// A successful CONNECT_RESPONSE with a valid ack.
    Verified,
    VerifyTimedOut,
    /// Traffic that makes no sense in the current state.
    UnexpectedMessage,
    /// The server refused our login token; try again with a fresh one.
    LoginRejected,
    /// The oldest unacked message passed its deadline.
    AckTimedOut,
    TransportClosed,
}

/// One row of a transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ClientState,
    pub event: ClientEvent,
    pub to: ClientState,
}

const fn row(from: ClientState, event: ClientEvent, to: ClientState) -> Transition {
    Transition { from, event, to }
}

use ClientEvent as E;
use ClientState as S;

/// Every legal client transition.
pub const CLIENT_TRANSITIONS: &[Transition] = &[
    row(S::Connecting, E::ConnectSucceeded, S::Verifying),
    row(S::Connecting, E::ConnectFailed, S::Connecting),
    row(S::Connecting, E::ConnectTimedOut, S::Connecting),
    row(S::Verifying, E::Verified, S::Verified),
    row(S::Verifying, E::VerifyTimedOut, S::Connecting),
    row(S::Verifying, E::UnexpectedMessage, S::Connecting),
    row(S::Verifying, E::LoginRejected, S::Connecting),
    row(S::Verifying, E::TransportClosed, S::Connecting),
    row(S::Verified, E::AckTimedOut, S::Connecting),
    row(S::Verified, E::TransportClosed, S::Connecting),
];

/// Looks up the target state, or `None` if `event` is illegal in `from`.
pub fn next_state(from: ClientState, event: ClientEvent) -> Option<ClientState> {
    CLIENT_TRANSITIONS
        .iter()
        .find(|t| t.from == from && t.event == event)
        .map(|t| t.to)
}

/// Server-side sub-state of a bound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerPhase {
    /// A freshly rotated token was sent; the previous token is still
    /// honored for one more reconnect.
    Pending,
    /// The peer has sent ordinary traffic on the bound connection, so it
    /// must hold the new token.
    Active,
}
