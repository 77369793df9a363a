//! The dialing side of reliable sessions.
//!
//! The application [`register`](ClientManager::register)s every peer it
//! wants a session with; the manager then owns reaching it. It dials,
//! handshakes, reconnects after any transient failure, and replays whatever
//! the peer never acknowledged. The application only ever sees one
//! `on_connected` and, eventually, one `on_disconnected`.
//!
//! State changes go through [`next_state`]; see
//! [`machine`](crate::machine) for the diagram.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Instant;

use arclink_protocol::{ConnectRequest, ConnectResponse, PayloadCodec, PeerId, Role, WireMessage};
use arclink_tick::TickClock;
use arclink_transport::{ConnectTicket, ConnectionId, Lane, NetEvent, Network};
use bytes::Bytes;

use crate::machine::{ClientEvent, ClientState, next_state};
use crate::queue::{Incoming, MessageQueue};
use crate::{DisconnectReason, Identity, SessionConfig, SessionError, SessionListener, Token, TokenService};

/// Where and how to reach a peer.
#[derive(Debug, Clone)]
pub struct Registration {
    pub peer: PeerId,
    pub role: Role,
    pub host: String,
    pub port: u16,
    /// Start from this token instead of minting a login token.
    pub token: Option<Token>,
}

impl Registration {
    pub fn new(peer: PeerId, role: Role, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer,
            role,
            host: host.into(),
            port,
            token: None,
        }
    }
}

/// What a session handler asks the manager to do next.
enum Step {
    Continue,
    Remove(DisconnectReason),
}

/// Everything a session needs from its manager besides itself.
struct Context {
    identity: Identity,
    config: SessionConfig,
    tokens: TokenService,
    network: Arc<dyn Network>,
}

impl Context {
    fn mint_login(&self, peer: PeerId, role: Role, clock: &TickClock) -> Result<Bytes, SessionError> {
        let token = self.tokens.new_login(
            (self.identity.id, self.identity.role),
            (peer, role),
            clock.unix_secs(),
        );
        self.tokens.encrypt(&token)
    }
}

/// One peer this process keeps a session with.
pub struct ClientSession<M> {
    peer: PeerId,
    role: Role,
    host: String,
    port: u16,
    codec: Arc<dyn PayloadCodec<Message = M>>,
    listener: Box<dyn SessionListener<M>>,

    state: ClientState,
    queue: MessageQueue,
    token: Bytes,
    holds_login: bool,
    attempt: u32,
    connect_attempts: u32,
    verified_count: u32,
    notified: bool,

    ticket: Option<ConnectTicket>,
    conn: Option<ConnectionId>,
    deadline: Instant,
    last_send: Instant,
}

impl<M: 'static> ClientSession<M> {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Connection currently carrying the session, if any.
    pub fn conn(&self) -> Option<ConnectionId> {
        self.conn
    }

    /// Attempt counter of the last CONNECT_REQUEST sent.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// How many handshakes have succeeded over the session's life.
    pub fn verified_count(&self) -> u32 {
        self.verified_count
    }

    pub fn cached_len(&self) -> usize {
        self.queue.cached_len()
    }

    fn transition(&mut self, event: ClientEvent) {
        match next_state(self.state, event) {
            Some(to) => {
                tracing::trace!(peer = %self.peer, from = %self.state, %to, ?event, "client transition");
                self.state = to;
            }
            None => {
                tracing::warn!(peer = %self.peer, state = %self.state, ?event, "illegal client transition ignored");
            }
        }
    }

    fn dial(&mut self, ctx: &Context, clock: &TickClock) -> Step {
        self.connect_attempts += 1;
        if self.connect_attempts > ctx.config.max_connect_attempts.max(1) {
            tracing::warn!(peer = %self.peer, attempts = self.connect_attempts - 1, "giving up on peer");
            return Step::Remove(DisconnectReason::ConnectFailed);
        }
        self.dial_unchecked(ctx, clock);
        Step::Continue
    }

    fn dial_unchecked(&mut self, ctx: &Context, clock: &TickClock) {
        let ticket = ctx
            .network
            .connect(self.peer, &self.host, self.port, Lane::Main);
        tracing::debug!(peer = %self.peer, host = %self.host, port = self.port, %ticket, "dialing");
        self.ticket = Some(ticket);
        self.deadline = clock.instant() + ctx.config.connect_timeout;
    }

    /// Drops the current transport and dials again.
    fn reconnect(&mut self, ctx: &Context, cause: ClientEvent, clock: &TickClock) -> Step {
        if let Some(conn) = self.conn.take() {
            ctx.network.close(conn);
        }
        self.ticket = None;
        tracing::info!(peer = %self.peer, from = %self.state, ?cause, "reconnecting");
        self.transition(cause);
        self.dial(ctx, clock)
    }

    fn send_connect_request(&mut self, ctx: &Context, conn: ConnectionId, clock: &TickClock) {
        self.attempt += 1;
        let req = ConnectRequest {
            client_id: ctx.identity.id,
            server_id: self.peer,
            attempt: self.attempt,
            ack: self.queue.ack(),
            token: self.token.clone(),
        };
        ctx.network.send(conn, WireMessage::ConnectRequest(req));
        self.deadline = clock.instant() + ctx.config.verify_timeout;
    }

    fn flush(&mut self, ctx: &Context, now: Instant) {
        let Some(conn) = self.conn else {
            return;
        };
        let out = self.queue.take_unsent(now);
        if out.is_empty() {
            return;
        }
        for msg in out {
            ctx.network.send(conn, msg);
        }
        self.last_send = now;
    }

    // -- transport events ---------------------------------------------------

    fn on_connected(&mut self, ctx: &Context, ticket: ConnectTicket, conn: ConnectionId, clock: &TickClock) -> Step {
        if self.state != ClientState::Connecting || self.ticket != Some(ticket) {
            tracing::debug!(peer = %self.peer, %conn, %ticket, "stale connect completion, closing");
            ctx.network.close(conn);
            return Step::Continue;
        }
        self.ticket = None;
        self.conn = Some(conn);
        self.transition(ClientEvent::ConnectSucceeded);
        self.send_connect_request(ctx, conn, clock);
        Step::Continue
    }

    /// The failed dial is retried once its connect deadline passes.
    fn on_connect_failed(&mut self, ticket: ConnectTicket, reason: &str) -> Step {
        if self.state == ClientState::Connecting && self.ticket == Some(ticket) {
            tracing::debug!(peer = %self.peer, %ticket, reason, "connect failed");
            self.ticket = None;
            self.transition(ClientEvent::ConnectFailed);
        }
        Step::Continue
    }

    fn on_closed(&mut self, ctx: &Context, conn: ConnectionId, clock: &TickClock) -> Step {
        if self.conn != Some(conn) {
            return Step::Continue;
        }
        self.conn = None;
        self.reconnect(ctx, ClientEvent::TransportClosed, clock)
    }

    fn on_inbound(&mut self, ctx: &Context, conn: ConnectionId, message: WireMessage, clock: &TickClock) -> Step {
        if self.conn != Some(conn) {
            return Step::Continue;
        }
        match self.state {
            ClientState::Connecting => Step::Continue,
            ClientState::Verifying => match message {
                WireMessage::ConnectResponse(resp) => self.on_connect_response(ctx, resp, clock),
                other => {
                    tracing::warn!(peer = %self.peer, kind = ?other.wire_type(), "unexpected message while verifying");
                    self.reconnect(ctx, ClientEvent::UnexpectedMessage, clock)
                }
            },
            ClientState::Verified => self.on_traffic(message),
        }
    }

    fn on_connect_response(&mut self, ctx: &Context, resp: ConnectResponse, clock: &TickClock) -> Step {
        if resp.attempt != self.attempt {
            tracing::debug!(peer = %self.peer, got = resp.attempt, want = self.attempt, "stale connect response ignored");
            return Step::Continue;
        }

        if !resp.success {
            if !self.holds_login {
                tracing::warn!(peer = %self.peer, "session token rejected");
                return Step::Remove(DisconnectReason::Rejected);
            }
            tracing::info!(peer = %self.peer, "login rejected, retrying with a fresh login token");
            match ctx.mint_login(self.peer, self.role, clock) {
                Ok(token) => self.token = token,
                Err(e) => {
                    tracing::error!(peer = %self.peer, error = %e, "failed to mint login token");
                    return Step::Remove(DisconnectReason::Rejected);
                }
            }
            return self.reconnect(ctx, ClientEvent::LoginRejected, clock);
        }

        if !self.queue.is_ack_valid(resp.ack) {
            let (lower, upper) = self.queue.ack_window();
            tracing::warn!(peer = %self.peer, ack = resp.ack, lower, upper, "connect response ack out of window");
            return Step::Remove(DisconnectReason::ProtocolDesync);
        }

        let now = clock.instant();
        self.queue.advance(resp.ack);
        self.token = resp.token;
        self.holds_login = false;
        self.verified_count += 1;
        self.connect_attempts = 0;
        self.last_send = now;
        self.transition(ClientEvent::Verified);

        if self.notified {
            let replay = self.queue.replay(now);
            let replayed = replay.len();
            if let Some(conn) = self.conn {
                for msg in replay {
                    ctx.network.send(conn, msg);
                }
            }
            tracing::info!(peer = %self.peer, replayed, "session resumed");
        } else {
            self.notified = true;
            tracing::info!(peer = %self.peer, role = %self.role, "session connected");
            self.listener.on_connected(self.peer);
        }
        self.flush(ctx, now);
        Step::Continue
    }

    fn on_traffic(&mut self, message: WireMessage) -> Step {
        let (ack, sequence, logic) = match message {
            WireMessage::Logic(m) => (m.ack, m.sequence, Some((m.tag, m.body))),
            WireMessage::Heartbeat(h) => (h.ack, h.sequence, None),
            other => {
                tracing::warn!(peer = %self.peer, kind = ?other.wire_type(), "unexpected message on verified session");
                return Step::Remove(DisconnectReason::ProtocolDesync);
            }
        };
        match self.queue.receive(ack, sequence) {
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "session desynchronized");
                Step::Remove(DisconnectReason::ProtocolDesync)
            }
            Ok(Incoming::Deliver) => {
                if let Some((tag, body)) = logic {
                    match self.codec.decode(tag, &body) {
                        Ok(message) => self.listener.on_message(self.peer, message),
                        Err(e) => tracing::warn!(peer = %self.peer, tag, error = %e, "dropping undecodable message"),
                    }
                }
                Step::Continue
            }
            Ok(Incoming::Duplicate | Incoming::Gap) => Step::Continue,
        }
    }

    fn on_tick(&mut self, ctx: &Context, clock: &TickClock) -> Step {
        let now = clock.instant();
        match self.state {
            ClientState::Connecting => {
                if now < self.deadline {
                    return Step::Continue;
                }
                if self.ticket.is_some() {
                    self.ticket = None;
                    self.transition(ClientEvent::ConnectTimedOut);
                }
                self.dial(ctx, clock)
            }
            ClientState::Verifying => {
                if now < self.deadline {
                    return Step::Continue;
                }
                self.reconnect(ctx, ClientEvent::VerifyTimedOut, clock)
            }
            ClientState::Verified => {
                if self.queue.oldest_deadline().is_some_and(|d| now >= d) {
                    return self.reconnect(ctx, ClientEvent::AckTimedOut, clock);
                }
                let idle = now.saturating_duration_since(self.last_send);
                if idle >= ctx.config.heartbeat_interval && self.queue.wants_heartbeat() {
                    self.queue.enqueue_heartbeat();
                }
                self.flush(ctx, now);
                Step::Continue
            }
        }
    }
}

impl<M> std::fmt::Debug for ClientSession<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("conn", &self.conn)
            .field("attempt", &self.attempt)
            .field("cached", &self.queue.cached_len())
            .finish()
    }
}

/// See the module docs.
pub struct ClientManager<M> {
    ctx: Context,
    sessions: HashMap<PeerId, ClientSession<M>>,
    /// Connections this manager dialed that haven't reported `Closed`.
    dialed: HashMap<ConnectionId, PeerId>,
}

impl<M: 'static> ClientManager<M> {
    pub fn new(
        identity: Identity,
        tokens: TokenService,
        config: SessionConfig,
        network: Arc<dyn Network>,
    ) -> Self {
        Self {
            ctx: Context {
                identity,
                config,
                tokens,
                network,
            },
            sessions: HashMap::new(),
            dialed: HashMap::new(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.ctx.identity
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session(&self, peer: PeerId) -> Option<&ClientSession<M>> {
        self.sessions.get(&peer)
    }

    pub fn state_of(&self, peer: PeerId) -> Option<ClientState> {
        self.sessions.get(&peer).map(|s| s.state)
    }

    /// Starts a session with a peer and begins dialing it.
    ///
    /// # Errors
    /// [`SessionError::AlreadyRegistered`] if the peer already has a
    /// session, or [`SessionError::TokenEncoding`] if the starting token
    /// can't be sealed.
    pub fn register(
        &mut self,
        registration: Registration,
        codec: Arc<dyn PayloadCodec<Message = M>>,
        listener: Box<dyn SessionListener<M>>,
        clock: &TickClock,
    ) -> Result<&ClientSession<M>, SessionError> {
        let Registration {
            peer,
            role,
            host,
            port,
            token,
        } = registration;
        let vacant = match self.sessions.entry(peer) {
            Entry::Occupied(_) => return Err(SessionError::AlreadyRegistered(peer)),
            Entry::Vacant(v) => v,
        };

        let (sealed, holds_login) = match token {
            Some(t) => (self.ctx.tokens.encrypt(&t)?, t.is_login()),
            None => (self.ctx.mint_login(peer, role, clock)?, true),
        };
        let now = clock.instant();
        let session = vacant.insert(ClientSession {
            peer,
            role,
            host,
            port,
            codec,
            listener,
            state: ClientState::Connecting,
            queue: MessageQueue::new(self.ctx.config.ack_timeout),
            token: sealed,
            holds_login,
            attempt: 0,
            connect_attempts: 1,
            verified_count: 0,
            notified: false,
            ticket: None,
            conn: None,
            deadline: now,
            last_send: now,
        });
        tracing::info!(%peer, %role, "client session registered");
        session.dial_unchecked(&self.ctx, clock);
        Ok(session)
    }

    /// Whether `event` belongs to a connection this manager dialed.
    ///
    /// Dial completions always do. Traffic and closes do if they arrived on
    /// a connection this manager was handed by a completion.
    pub fn owns(&self, event: &NetEvent) -> bool {
        match event {
            NetEvent::Connected { .. } | NetEvent::ConnectFailed { .. } => true,
            NetEvent::Inbound { conn, .. } | NetEvent::Closed { conn, .. } => {
                self.dialed.contains_key(conn)
            }
        }
    }

    /// Feeds one transport event into the manager.
    pub fn handle_event(&mut self, event: NetEvent, clock: &TickClock) {
        let (peer, step) = match event {
            NetEvent::Connected { ticket, peer, conn } => {
                self.dialed.insert(conn, peer);
                let Some(session) = self.sessions.get_mut(&peer) else {
                    self.ctx.network.close(conn);
                    return;
                };
                (peer, session.on_connected(&self.ctx, ticket, conn, clock))
            }
            NetEvent::ConnectFailed {
                ticket,
                peer,
                reason,
            } => {
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return;
                };
                (peer, session.on_connect_failed(ticket, &reason))
            }
            NetEvent::Inbound {
                conn,
                peer: _,
                message,
            } => {
                let Some(&peer) = self.dialed.get(&conn) else {
                    return;
                };
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return;
                };
                (peer, session.on_inbound(&self.ctx, conn, message, clock))
            }
            NetEvent::Closed { conn, peer: _ } => {
                let Some(peer) = self.dialed.remove(&conn) else {
                    return;
                };
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return;
                };
                (peer, session.on_closed(&self.ctx, conn, clock))
            }
        };
        if let Step::Remove(reason) = step {
            self.remove(peer, reason);
        }
    }

    /// Queues `message` for `peer`. It goes out once the session is
    /// verified, on the next tick.
    ///
    /// # Errors
    /// [`SessionError::UnknownPeer`] without a session,
    /// [`SessionError::Codec`] if the message can't be encoded, and
    /// [`SessionError::CacheOverflow`] if this message filled the cache, in
    /// which case the session has been removed.
    pub fn send(&mut self, peer: PeerId, message: &M) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&peer)
            .ok_or(SessionError::UnknownPeer(peer))?;
        let (tag, body) = session.codec.encode(message)?;
        session.queue.enqueue_logic(tag, Bytes::from(body));
        if session.queue.cached_len() >= self.ctx.config.max_cached_messages {
            tracing::warn!(%peer, cached = session.queue.cached_len(), "message cache full");
            self.remove(peer, DisconnectReason::CacheOverflow);
            return Err(SessionError::CacheOverflow(peer));
        }
        Ok(())
    }

    /// Drops the session for `peer`. Returns whether there was one.
    pub fn remove_session(&mut self, peer: PeerId) -> bool {
        self.remove(peer, DisconnectReason::Removed)
    }

    /// Per-tick housekeeping: timeouts, heartbeats, and flushing.
    pub fn tick(&mut self, clock: &TickClock) {
        let mut removals = Vec::new();
        for (peer, session) in &mut self.sessions {
            if let Step::Remove(reason) = session.on_tick(&self.ctx, clock) {
                removals.push((*peer, reason));
            }
        }
        for (peer, reason) in removals {
            self.remove(peer, reason);
        }
    }

    fn remove(&mut self, peer: PeerId, reason: DisconnectReason) -> bool {
        let Some(mut session) = self.sessions.remove(&peer) else {
            return false;
        };
        if let Some(conn) = session.conn.take() {
            self.ctx.network.close(conn);
        }
        tracing::info!(%peer, %reason, "client session removed");
        if session.notified {
            session.listener.on_disconnected(peer, reason);
        }
        true
    }
}

impl<M> std::fmt::Debug for ClientManager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("identity", &self.ctx.identity)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use arclink_protocol::{AckHeartbeat, LogicMessage};
    use arclink_transport::memory::{Command, MemoryNetwork};

    use super::*;
    use crate::testing::{Recorder, Seen, T0, clock, codec, inbound, network, tokens};

    const ME: PeerId = PeerId(7);
    const SERVER: PeerId = PeerId(1);

    fn manager_with(config: SessionConfig) -> (ClientManager<String>, Arc<MemoryNetwork>) {
        let (mem, net) = network();
        let mgr = ClientManager::new(Identity::new(ME, Role::Scene), tokens(), config, net);
        (mgr, mem)
    }

    fn register(mgr: &mut ClientManager<String>, clock: &TickClock) -> Recorder {
        let rec = Recorder::default();
        mgr.register(
            Registration::new(SERVER, Role::Center, "10.0.0.1", 7000),
            codec(),
            Box::new(rec.clone()),
            clock,
        )
        .unwrap();
        rec
    }

    fn last_ticket(mem: &MemoryNetwork) -> ConnectTicket {
        mem.take_commands()
            .into_iter()
            .rev()
            .find_map(|c| match c {
                Command::Connect { ticket, .. } => Some(ticket),
                _ => None,
            })
            .expect("no connect recorded")
    }

    fn connected(mgr: &mut ClientManager<String>, ticket: ConnectTicket, conn: u64, clock: &TickClock) {
        mgr.handle_event(
            NetEvent::Connected {
                ticket,
                peer: SERVER,
                conn: ConnectionId::new(conn),
            },
            clock,
        );
    }

    fn sent_request(mem: &MemoryNetwork, conn: u64) -> ConnectRequest {
        mem.take_sent(ConnectionId::new(conn))
            .into_iter()
            .find_map(|m| match m {
                WireMessage::ConnectRequest(r) => Some(r),
                _ => None,
            })
            .expect("no connect request sent")
    }

    fn reply(attempt: u32, success: bool, ack: u64, token: &Token) -> WireMessage {
        WireMessage::ConnectResponse(ConnectResponse {
            attempt,
            success,
            ack,
            token: tokens().encrypt(token).unwrap(),
        })
    }

    fn issued(verified: u32) -> Token {
        let mut t = tokens().new_login((ME, Role::Scene), (SERVER, Role::Center), T0);
        t.verified_count = verified;
        t.created_at_sec = T0 + u64::from(verified);
        t
    }

    /// Registers and drives the session to Verified on conn 1.
    fn verified() -> (ClientManager<String>, Arc<MemoryNetwork>, Recorder) {
        let (mut mgr, mem) = manager_with(SessionConfig::default());
        let c = clock();
        let rec = register(&mut mgr, &c);
        let ticket = last_ticket(&mem);
        connected(&mut mgr, ticket, 1, &c);
        let req = sent_request(&mem, 1);
        mgr.handle_event(inbound(1, SERVER, reply(req.attempt, true, 0, &issued(1))), &c);
        assert_eq!(mgr.state_of(SERVER), Some(ClientState::Verified));
        (mgr, mem, rec)
    }

    // =====================================================================
    // Registration and connecting
    // =====================================================================

    #[test]
    fn test_register_dials_on_main_lane() {
        let (mut mgr, mem) = manager_with(SessionConfig::default());
        register(&mut mgr, &clock());

        let cmds = mem.take_commands();
        assert!(matches!(
            &cmds[..],
            [Command::Connect { peer, host, port: 7000, lane: Lane::Main, .. }]
                if *peer == SERVER && host == "10.0.0.1"
        ));
        assert_eq!(mgr.state_of(SERVER), Some(ClientState::Connecting));
    }

    #[test]
    fn test_register_twice_fails() {
        let (mut mgr, _mem) = manager_with(SessionConfig::default());
        register(&mut mgr, &clock());
        let err = mgr
            .register(
                Registration::new(SERVER, Role::Center, "10.0.0.1", 7000),
                codec(),
                Box::new(Recorder::default()),
                &clock(),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRegistered(p) if p == SERVER));
    }

    #[test]
    fn test_connected_sends_login_request() {
        let (mut mgr, mem) = manager_with(SessionConfig::default());
        let c = clock();
        register(&mut mgr, &c);
        let ticket = last_ticket(&mem);
        connected(&mut mgr, ticket, 1, &c);

        let req = sent_request(&mem, 1);
        assert_eq!(req.client_id, ME);
        assert_eq!(req.server_id, SERVER);
        assert_eq!(req.attempt, 1);
        assert_eq!(req.ack, 0);
        let token = tokens().decrypt(&req.token).unwrap();
        assert!(token.is_login());
        assert_eq!(token.server_role, Role::Center);
        assert_eq!(mgr.state_of(SERVER), Some(ClientState::Verifying));
    }

    #[test]
    fn test_stale_ticket_completion_is_closed() {
        let (mut mgr, mem) = manager_with(SessionConfig::default());
        let c = clock();
        register(&mut mgr, &c);
        let stale = last_ticket(&mem);

        // The first dial times out and a second one starts.
        mgr.tick(&c.advance(Duration::from_secs(4)));
        let fresh = last_ticket(&mem);
        assert_ne!(stale, fresh);

        connected(&mut mgr, stale, 5, &c);
        assert!(mem.is_closed(ConnectionId::new(5)));
        assert_eq!(mgr.state_of(SERVER), Some(ClientState::Connecting));
    }

    #[test]
    fn test_connect_failures_past_limit_remove_session() {
        let config = SessionConfig {
            max_connect_attempts: 3,
            ..SessionConfig::default()
        };
        let (mut mgr, mem) = manager_with(config);
        let mut c = clock();
        let rec = register(&mut mgr, &c);

        for _ in 0..3 {
            let ticket = last_ticket(&mem);
            mgr.handle_event(
                NetEvent::ConnectFailed {
                    ticket,
                    peer: SERVER,
                    reason: "refused".into(),
                },
                &c,
            );
            c = c.advance(Duration::from_secs(4));
            mgr.tick(&c);
        }

        assert!(mgr.is_empty());
        // Never connected, so nothing to report.
        assert!(rec.take().is_empty());
    }

    // =====================================================================
    // Verifying
    // =====================================================================

    #[test]
    fn test_first_verification_fires_connected_once() {
        let (_mgr, _mem, rec) = verified();
        assert_eq!(rec.take(), vec![Seen::Connected(SERVER)]);
    }

    #[test]
    fn test_response_for_old_attempt_is_ignored() {
        let (mut mgr, mem) = manager_with(SessionConfig::default());
        let c = clock();
        let rec = register(&mut mgr, &c);

        // Attempt 1 times out unanswered; attempt 2 goes out on conn 2.
        connected(&mut mgr, last_ticket(&mem), 1, &c);
        let later = c.advance(Duration::from_secs(4));
        mgr.tick(&later);
        connected(&mut mgr, last_ticket(&mem), 2, &later);
        assert_eq!(sent_request(&mem, 2).attempt, 2);

        mgr.handle_event(inbound(2, SERVER, reply(1, true, 0, &issued(1))), &later);
        assert_eq!(mgr.state_of(SERVER), Some(ClientState::Verifying));

        mgr.handle_event(inbound(2, SERVER, reply(2, true, 0, &issued(1))), &later);
        assert_eq!(mgr.state_of(SERVER), Some(ClientState::Verified));
        assert_eq!(rec.take(), vec![Seen::Connected(SERVER)]);
    }

    #[test]
    fn test_rejected_login_retries_with_fresh_login() {
        let (mut mgr, mem) = manager_with(SessionConfig::default());
        let c = clock();
        register(&mut mgr, &c);
        connected(&mut mgr, last_ticket(&mem), 1, &c);
        let first = sent_request(&mem, 1);

        mgr.handle_event(inbound(1, SERVER, reply(1, false, 0, &issued(0))), &c);

        assert_eq!(mgr.state_of(SERVER), Some(ClientState::Connecting));
        assert!(mem.is_closed(ConnectionId::new(1)));
        connected(&mut mgr, last_ticket(&mem), 2, &c);
        let second = sent_request(&mem, 2);
        assert_eq!(second.attempt, 2);
        assert!(tokens().decrypt(&first.token).unwrap().is_login());
        assert!(tokens().decrypt(&second.token).unwrap().is_login());
    }

    #[test]
    fn test_rejected_rotated_token_removes_session() {
        let (mut mgr, mem, rec) = verified();
        rec.take();

        // Lose the transport, then get refused on the next handshake.
        mgr.handle_event(
            NetEvent::Closed {
                conn: ConnectionId::new(1),
                peer: Some(SERVER),
            },
            &clock(),
        );
        connected(&mut mgr, last_ticket(&mem), 2, &clock());
        let req = sent_request(&mem, 2);
        mgr.handle_event(inbound(2, SERVER, reply(req.attempt, false, 0, &issued(0))), &clock());

        assert!(mgr.is_empty());
        assert_eq!(rec.take(), vec![Seen::Disconnected(SERVER, DisconnectReason::Rejected)]);
    }

    #[test]
    fn test_response_with_bad_ack_is_desync() {
        let (mut mgr, mem) = manager_with(SessionConfig::default());
        let c = clock();
        register(&mut mgr, &c);
        connected(&mut mgr, last_ticket(&mem), 1, &c);
        mgr.handle_event(inbound(1, SERVER, reply(1, true, 4, &issued(1))), &c);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_verify_timeout_reconnects() {
        let (mut mgr, mem) = manager_with(SessionConfig::default());
        let c = clock();
        register(&mut mgr, &c);
        connected(&mut mgr, last_ticket(&mem), 1, &c);
        mem.take_commands();

        mgr.tick(&c.advance(Duration::from_secs(4)));

        assert!(mem.is_closed(ConnectionId::new(1)));
        assert_eq!(mgr.state_of(SERVER), Some(ClientState::Connecting));
    }

    // =====================================================================
    // Verified
    // =====================================================================

    #[test]
    fn test_messages_flow_after_verification() {
        let (mut mgr, mem, rec) = verified();
        rec.take();
        let c = clock();

        mgr.send(SERVER, &"ping".into()).unwrap();
        mgr.tick(&c);
        assert_eq!(
            mem.take_sent(ConnectionId::new(1)),
            vec![WireMessage::Logic(LogicMessage {
                ack: 0,
                sequence: 1,
                tag: 1,
                body: Bytes::from_static(b"ping"),
            })]
        );

        let pong = WireMessage::Logic(LogicMessage {
            ack: 1,
            sequence: 1,
            tag: 1,
            body: Bytes::from_static(b"pong"),
        });
        mgr.handle_event(inbound(1, SERVER, pong.clone()), &c);
        mgr.handle_event(inbound(1, SERVER, pong), &c);
        assert_eq!(rec.take(), vec![Seen::Message(SERVER, "pong".into())]);
        assert_eq!(mgr.session(SERVER).unwrap().cached_len(), 0);
    }

    #[test]
    fn test_messages_sent_before_verification_wait() {
        let (mut mgr, mem) = manager_with(SessionConfig::default());
        let c = clock();
        register(&mut mgr, &c);
        mgr.send(SERVER, &"early".into()).unwrap();
        mgr.tick(&c);
        connected(&mut mgr, last_ticket(&mem), 1, &c);
        let req = sent_request(&mem, 1);

        mgr.handle_event(inbound(1, SERVER, reply(req.attempt, true, 0, &issued(1))), &c);

        let sent = mem.take_sent(ConnectionId::new(1));
        assert!(matches!(&sent[..], [WireMessage::Logic(m)] if m.sequence == 1));
    }

    #[test]
    fn test_reconnect_replays_and_does_not_refire_connected() {
        let (mut mgr, mem, rec) = verified();
        rec.take();
        let c = clock();
        mgr.send(SERVER, &"a".into()).unwrap();
        mgr.tick(&c);
        mem.take_commands();

        mgr.handle_event(
            NetEvent::Closed {
                conn: ConnectionId::new(1),
                peer: Some(SERVER),
            },
            &c,
        );
        connected(&mut mgr, last_ticket(&mem), 2, &c);
        let req = sent_request(&mem, 2);
        assert_eq!(req.attempt, 2);
        assert_eq!(tokens().decrypt(&req.token).unwrap(), issued(1));

        mgr.handle_event(inbound(2, SERVER, reply(2, true, 0, &issued(2))), &c);

        let sent = mem.take_sent(ConnectionId::new(2));
        assert!(matches!(&sent[..], [WireMessage::Logic(m)] if m.sequence == 1));
        assert!(rec.take().is_empty());
        assert_eq!(mgr.session(SERVER).unwrap().verified_count(), 2);
    }

    #[test]
    fn test_ack_timeout_reconnects() {
        let (mut mgr, mem, _rec) = verified();
        let c = clock();
        mgr.send(SERVER, &"lost".into()).unwrap();
        mgr.tick(&c);

        mgr.tick(&c.advance(Duration::from_secs(16)));

        assert!(mem.is_closed(ConnectionId::new(1)));
        assert_eq!(mgr.state_of(SERVER), Some(ClientState::Connecting));
    }

    #[test]
    fn test_idle_session_sends_heartbeat() {
        let (mut mgr, mem, _rec) = verified();
        mem.take_commands();

        mgr.tick(&clock().advance(Duration::from_secs(6)));

        assert_eq!(
            mem.take_sent(ConnectionId::new(1)),
            vec![WireMessage::Heartbeat(AckHeartbeat { ack: 0, sequence: 1 })]
        );
    }

    #[test]
    fn test_ack_beyond_sent_is_desync() {
        let (mut mgr, _mem, rec) = verified();
        rec.take();
        mgr.handle_event(
            inbound(1, SERVER, WireMessage::Heartbeat(AckHeartbeat { ack: 3, sequence: 1 })),
            &clock(),
        );
        assert!(mgr.is_empty());
        assert_eq!(
            rec.take(),
            vec![Seen::Disconnected(SERVER, DisconnectReason::ProtocolDesync)]
        );
    }

    #[test]
    fn test_send_reaching_cache_cap_removes_session() {
        let config = SessionConfig {
            max_cached_messages: 100,
            ..SessionConfig::default()
        };
        let (mut mgr, mem) = manager_with(config);
        let c = clock();
        let rec = register(&mut mgr, &c);
        connected(&mut mgr, last_ticket(&mem), 1, &c);
        let req = sent_request(&mem, 1);
        mgr.handle_event(inbound(1, SERVER, reply(req.attempt, true, 0, &issued(1))), &c);
        rec.take();

        for i in 0..99 {
            mgr.send(SERVER, &format!("m{i}")).unwrap();
        }
        let err = mgr.send(SERVER, &"m99".into()).unwrap_err();

        assert!(matches!(err, SessionError::CacheOverflow(_)));
        assert!(mgr.is_empty());
        assert_eq!(
            rec.take(),
            vec![Seen::Disconnected(SERVER, DisconnectReason::CacheOverflow)]
        );
    }

    #[test]
    fn test_remove_session_reports_removed() {
        let (mut mgr, mem, rec) = verified();
        rec.take();
        assert!(mgr.remove_session(SERVER));
        assert!(!mgr.remove_session(SERVER));
        assert!(mem.is_closed(ConnectionId::new(1)));
        assert_eq!(rec.take(), vec![Seen::Disconnected(SERVER, DisconnectReason::Removed)]);
    }

    #[test]
    fn test_owns_only_dialed_connections() {
        let (mgr, _mem, _rec) = verified();
        assert!(mgr.owns(&inbound(1, SERVER, WireMessage::SyncHeartbeat)));
        assert!(!mgr.owns(&inbound(2, SERVER, WireMessage::SyncHeartbeat)));
    }
}
