//! Server-side handshake: validating a CONNECT_REQUEST and deciding
//! between LOGIN, RECONNECT, and reject.
//!
//! Shared by [`ServerManager`](crate::ServerManager) and
//! [`SyncServer`](crate::SyncServer), which differ only in what they keep
//! per session besides the credentials.
//!
//! # Classification
//!
//! After the token decodes, is addressed to us, and isn't forbidden:
//!
//! | Token vs. existing session              | Outcome                      |
//! |-----------------------------------------|------------------------------|
//! | no session, or newer than `current`     | LOGIN (if a valid login)     |
//! | equal to `current` or `previous`        | RECONNECT (if attempt > last)|
//! | anything else                           | reject                       |
//!
//! A reject never mutates anything. Only a fully validated handshake may
//! touch a session, so a forged request can't evict a legitimate peer.

use std::time::{Duration, Instant};

use arclink_protocol::{ConnectRequest, ConnectResponse, PeerId, WireMessage};
use arclink_tick::TickClock;
use arclink_transport::ConnectionId;
use bytes::Bytes;
use tracing::debug;

use crate::{ForbiddenTable, Identity, ServerPhase, SessionConfig, SessionError, Token, TokenService};

/// Why a CONNECT_REQUEST was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("token does not decode")]
    Undecodable,
    #[error("token was issued to another client")]
    ClientMismatch,
    #[error("token is addressed to another server")]
    WrongServer,
    #[error("token is forbidden")]
    Forbidden,
    #[error("newer token is not a login token")]
    NotLogin,
    #[error("login token expired")]
    LoginExpired,
    #[error("login token is dated in the future")]
    FromFuture,
    #[error("login carries a non-zero ack")]
    LoginWithHistory,
    #[error("attempt counter is not newer than the last one")]
    StaleAttempt,
    #[error("ack outside the valid window")]
    AckOutOfWindow,
    #[error("token is neither current nor previous")]
    UnknownToken,
}

/// Outcome of [`Authority::classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Login(Token),
    /// Carries the token the client presented.
    Reconnect(Token),
    Reject(RejectReason),
}

/// The credential half of a server session.
#[derive(Debug, Clone)]
pub struct Binding {
    pub conn: ConnectionId,
    pub current: Token,
    pub previous: Option<Token>,
    pub last_attempt: u32,
    pub phase: ServerPhase,
    pub deadline: Instant,
}

impl Binding {
    /// Pushes the timeout deadline out from `now`.
    pub fn touch(&mut self, now: Instant, timeout: Duration) {
        self.deadline = now + timeout;
    }
}

/// Token service plus forbidden table, from the server's point of view.
#[derive(Debug)]
pub struct Authority {
    identity: Identity,
    tokens: TokenService,
    forbidden: ForbiddenTable,
    session_timeout: Duration,
}

impl Authority {
    pub fn new(identity: Identity, tokens: TokenService, config: &SessionConfig) -> Self {
        Self {
            identity,
            tokens,
            forbidden: ForbiddenTable::new(config.forbid_window, config.forbid_sweep_interval),
            session_timeout: config.session_timeout,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn forbidden(&self) -> &ForbiddenTable {
        &self.forbidden
    }

    /// Classifies `req` against the existing binding for its client.
    ///
    /// `ack_valid` answers whether the claimed ack fits the session's
    /// queue; it is only consulted for a RECONNECT.
    pub fn classify(
        &self,
        req: &ConnectRequest,
        existing: Option<&Binding>,
        ack_valid: impl FnOnce(u64) -> bool,
        now_sec: u64,
    ) -> Verdict {
        let Some(token) = self.tokens.decrypt(&req.token) else {
            return Verdict::Reject(RejectReason::Undecodable);
        };
        if token.client_id != req.client_id {
            return Verdict::Reject(RejectReason::ClientMismatch);
        }
        if req.server_id != self.identity.id
            || token.server_id != self.identity.id
            || token.server_role != self.identity.role
        {
            return Verdict::Reject(RejectReason::WrongServer);
        }
        if self
            .forbidden
            .is_forbidden(token.client_id, token.created_at_sec, now_sec)
        {
            return Verdict::Reject(RejectReason::Forbidden);
        }

        let is_newer = existing.is_none_or(|b| token.created_at_sec > b.current.created_at_sec);
        if is_newer {
            if !token.is_login() {
                return Verdict::Reject(RejectReason::NotLogin);
            }
            if self.tokens.is_from_future(&token, now_sec) {
                return Verdict::Reject(RejectReason::FromFuture);
            }
            if self.tokens.is_login_expired(&token, now_sec) {
                return Verdict::Reject(RejectReason::LoginExpired);
            }
            if req.ack != 0 {
                return Verdict::Reject(RejectReason::LoginWithHistory);
            }
            return Verdict::Login(token);
        }

        let Some(binding) = existing else {
            return Verdict::Reject(RejectReason::UnknownToken);
        };
        let known = token.same_token(&binding.current)
            || binding.previous.as_ref().is_some_and(|p| token.same_token(p));
        if !known {
            return Verdict::Reject(RejectReason::UnknownToken);
        }
        if req.attempt <= binding.last_attempt {
            return Verdict::Reject(RejectReason::StaleAttempt);
        }
        if !ack_valid(req.ack) {
            return Verdict::Reject(RejectReason::AckOutOfWindow);
        }
        Verdict::Reconnect(token)
    }

    /// Binds a new session for an accepted LOGIN.
    ///
    /// Forbids everything strictly older than the login token and returns
    /// the binding (holding the rotated token) plus its sealed form.
    pub fn login(
        &mut self,
        login: Token,
        conn: ConnectionId,
        attempt: u32,
        clock: &TickClock,
    ) -> Result<(Binding, Bytes), SessionError> {
        let now_sec = clock.unix_secs();
        self.forbidden
            .forbid_before(login.client_id, login.created_at_sec, now_sec);
        let current = self.tokens.rotate(&login, now_sec);
        let sealed = self.tokens.encrypt(&current)?;
        let binding = Binding {
            conn,
            current,
            previous: Some(login),
            last_attempt: attempt,
            phase: ServerPhase::Pending,
            deadline: clock.instant() + self.session_timeout,
        };
        Ok((binding, sealed))
    }

    /// Rebinds an existing session for an accepted RECONNECT and rotates
    /// its token. Returns the old connection if it differs from `conn`.
    pub fn reconnect(
        &mut self,
        binding: &mut Binding,
        presented: Token,
        conn: ConnectionId,
        attempt: u32,
        clock: &TickClock,
    ) -> Result<(Option<ConnectionId>, Bytes), SessionError> {
        let next = self.tokens.rotate(&binding.current, clock.unix_secs());
        let sealed = self.tokens.encrypt(&next)?;
        let old = (binding.conn != conn).then_some(binding.conn);
        binding.conn = conn;
        binding.current = next;
        binding.previous = Some(presented);
        binding.last_attempt = attempt;
        binding.phase = ServerPhase::Pending;
        binding.touch(clock.instant(), self.session_timeout);
        Ok((old, sealed))
    }

    /// First ordinary traffic on the bound connection: the peer holds the
    /// new token, so the previous one is retired.
    pub fn confirm(&mut self, peer: PeerId, binding: &mut Binding, now_sec: u64) {
        if binding.phase == ServerPhase::Active {
            return;
        }
        binding.phase = ServerPhase::Active;
        if let Some(prev) = binding.previous.take() {
            self.forbidden
                .forbid_through(peer, prev.created_at_sec, now_sec);
        }
        debug!(%peer, "session active");
    }

    /// A session is going away: none of its tokens may come back.
    pub fn retire(&mut self, peer: PeerId, binding: &Binding, now_sec: u64) {
        self.forbidden
            .forbid_through(peer, binding.current.created_at_sec, now_sec);
    }

    /// Runs the forbidden-table sweep if it's due.
    pub fn sweep(&mut self, now_sec: u64) {
        self.forbidden.maybe_sweep(now_sec);
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }
}

/// A CONNECT_RESPONSE.
pub fn response(attempt: u32, success: bool, ack: u64, token: Bytes) -> WireMessage {
    WireMessage::ConnectResponse(ConnectResponse {
        attempt,
        success,
        ack,
        token,
    })
}

// =========================================================================
// Tests
// =========================================================================
