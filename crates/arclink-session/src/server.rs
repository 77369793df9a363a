//! The accepting side of reliable sessions.
//!
//! A [`ServerManager`] owns every session some client has established with
//! this process. Sessions are created by a successful handshake, never by
//! the application. The manager answers handshakes, delivers messages in
//! order, replays unacked traffic after a reconnect, and sweeps sessions
//! that fall silent.
//!
//! ```text
//!   CONNECT_REQUEST ──▶ classify ──▶ LOGIN ──────▶ new session (Pending)
//!                          │    └──▶ RECONNECT ──▶ rebind + replay (Pending)
//!                          └──────▶ reject (nothing changes)
//!
//!   first LOGIC / HEARTBEAT on the bound conn ──▶ Active
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use arclink_protocol::{ConnectRequest, PayloadCodec, PeerId, Role, WireMessage};
use arclink_tick::TickClock;
use arclink_transport::{ConnectionId, NetEvent, Network};
use bytes::Bytes;

use crate::handshake::{Authority, Binding, Verdict, response};
use crate::queue::{Incoming, MessageQueue};
use crate::{
    DisconnectReason, ForbiddenTable, Identity, ServerPhase, SessionConfig, SessionError,
    SessionListener, Token, TokenService,
};

/// One client's session on this server.
#[derive(Debug)]
struct ServerSession {
    binding: Binding,
    role: Role,
    queue: MessageQueue,
    last_send: Instant,
}

/// See the module docs.
pub struct ServerManager<M> {
    authority: Authority,
    config: SessionConfig,
    network: Arc<dyn Network>,
    codec: Arc<dyn PayloadCodec<Message = M>>,
    listener: Box<dyn SessionListener<M>>,
    sessions: HashMap<PeerId, ServerSession>,
}

impl<M: 'static> ServerManager<M> {
    pub fn new(
        identity: Identity,
        tokens: TokenService,
        config: SessionConfig,
        network: Arc<dyn Network>,
        codec: Arc<dyn PayloadCodec<Message = M>>,
        listener: Box<dyn SessionListener<M>>,
    ) -> Self {
        Self {
            authority: Authority::new(identity, tokens, &config),
            config,
            network,
            codec,
            listener,
            sessions: HashMap::new(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.authority.identity()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.sessions.contains_key(&peer)
    }

    pub fn phase_of(&self, peer: PeerId) -> Option<ServerPhase> {
        self.sessions.get(&peer).map(|s| s.binding.phase)
    }

    pub fn role_of(&self, peer: PeerId) -> Option<Role> {
        self.sessions.get(&peer).map(|s| s.role)
    }

    /// The token the peer should be holding right now.
    pub fn current_token(&self, peer: PeerId) -> Option<&Token> {
        self.sessions.get(&peer).map(|s| &s.binding.current)
    }

    pub fn cached_len(&self, peer: PeerId) -> Option<usize> {
        self.sessions.get(&peer).map(|s| s.queue.cached_len())
    }

    pub fn forbidden(&self) -> &ForbiddenTable {
        self.authority.forbidden()
    }

    // -- events -------------------------------------------------------------

    /// Feeds one transport event into the manager.
    pub fn handle_event(&mut self, event: NetEvent, clock: &TickClock) {
        match event {
            NetEvent::Inbound {
                conn,
                peer,
                message,
            } => match message {
                WireMessage::ConnectRequest(req) => self.handshake(conn, req, clock),
                WireMessage::Logic(msg) => {
                    self.traffic(conn, peer, msg.ack, msg.sequence, Some((msg.tag, msg.body)), clock)
                }
                WireMessage::Heartbeat(hb) => {
                    self.traffic(conn, peer, hb.ack, hb.sequence, None, clock)
                }
                other => {
                    tracing::warn!(%conn, %peer, kind = ?other.wire_type(), "unexpected message on server connection");
                    self.network.close(conn);
                }
            },
            NetEvent::Closed { conn, peer } => {
                let bound = peer
                    .and_then(|p| self.sessions.get(&p))
                    .is_some_and(|s| s.binding.conn == conn);
                if bound {
                    tracing::debug!(%conn, ?peer, "bound connection lost, awaiting reconnect");
                }
            }
            NetEvent::Connected { .. } | NetEvent::ConnectFailed { .. } => {
                tracing::debug!("dial completion routed to server manager, ignored");
            }
        }
    }

    fn handshake(&mut self, conn: ConnectionId, req: ConnectRequest, clock: &TickClock) {
        let existing = self.sessions.get(&req.client_id);
        let verdict = self.authority.classify(
            &req,
            existing.map(|s| &s.binding),
            |ack| existing.is_some_and(|s| s.queue.is_ack_valid(ack)),
            clock.unix_secs(),
        );
        match verdict {
            Verdict::Login(token) => self.accept_login(conn, &req, token, clock),
            Verdict::Reconnect(token) => self.accept_reconnect(conn, &req, token, clock),
            Verdict::Reject(reason) => {
                tracing::warn!(%conn, client = %req.client_id, attempt = req.attempt, %reason, "connect request rejected");
                self.reject(conn, &req);
            }
        }
    }

    /// Replies failure. A connection still bound to the client's live
    /// session is left open; anything else is closed after the reply.
    fn reject(&self, conn: ConnectionId, req: &ConnectRequest) {
        let reply = response(req.attempt, false, 0, Bytes::new());
        let bound = self
            .sessions
            .get(&req.client_id)
            .is_some_and(|s| s.binding.conn == conn);
        if bound {
            self.network.send(conn, reply);
        } else {
            self.network.send_and_close(conn, reply);
        }
    }

    fn accept_login(&mut self, conn: ConnectionId, req: &ConnectRequest, token: Token, clock: &TickClock) {
        let peer = req.client_id;
        let role = token.client_role;
        let (binding, sealed) = match self.authority.login(token, conn, req.attempt, clock) {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(%peer, error = %e, "failed to issue session token");
                self.reject(conn, req);
                return;
            }
        };

        if let Some(old) = self.sessions.remove(&peer) {
            if old.binding.conn != conn {
                self.network.close(old.binding.conn);
            }
            self.authority.retire(peer, &old.binding, clock.unix_secs());
            tracing::info!(%peer, "session superseded by a new login");
            self.listener.on_disconnected(peer, DisconnectReason::Superseded);
        }

        self.network.send(conn, response(req.attempt, true, 0, sealed));
        self.sessions.insert(
            peer,
            ServerSession {
                binding,
                role,
                queue: MessageQueue::new(self.config.ack_timeout),
                last_send: clock.instant(),
            },
        );
        tracing::info!(%peer, %role, %conn, "session logged in");
        self.listener.on_connected(peer);
    }

    fn accept_reconnect(
        &mut self,
        conn: ConnectionId,
        req: &ConnectRequest,
        presented: Token,
        clock: &TickClock,
    ) {
        let peer = req.client_id;
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        let (old_conn, sealed) =
            match self
                .authority
                .reconnect(&mut session.binding, presented, conn, req.attempt, clock)
            {
                Ok(rebound) => rebound,
                Err(e) => {
                    tracing::error!(%peer, error = %e, "failed to issue session token");
                    self.network
                        .send_and_close(conn, response(req.attempt, false, 0, Bytes::new()));
                    return;
                }
            };
        if let Some(old) = old_conn {
            self.network.close(old);
        }

        session.queue.advance(req.ack);
        self.network
            .send(conn, response(req.attempt, true, session.queue.ack(), sealed));
        let replay = session.queue.replay(clock.instant());
        let replayed = replay.len();
        for msg in replay {
            self.network.send(conn, msg);
        }
        session.last_send = clock.instant();
        tracing::info!(%peer, %conn, attempt = req.attempt, replayed, "session reconnected");
    }

    fn traffic(
        &mut self,
        conn: ConnectionId,
        peer: PeerId,
        ack: u64,
        sequence: u64,
        logic: Option<(u32, Bytes)>,
        clock: &TickClock,
    ) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            tracing::debug!(%conn, %peer, "traffic for unknown session, closing");
            self.network.close(conn);
            return;
        };
        if session.binding.conn != conn {
            tracing::debug!(%conn, %peer, "traffic on unbound connection, closing");
            self.network.close(conn);
            return;
        }

        self.authority
            .confirm(peer, &mut session.binding, clock.unix_secs());
        session
            .binding
            .touch(clock.instant(), self.authority.session_timeout());

        match session.queue.receive(ack, sequence) {
            Err(e) => {
                tracing::warn!(%peer, error = %e, "session desynchronized");
                self.remove(peer, DisconnectReason::ProtocolDesync, clock.unix_secs());
            }
            Ok(Incoming::Deliver) => {
                if let Some((tag, body)) = logic {
                    match self.codec.decode(tag, &body) {
                        Ok(message) => self.listener.on_message(peer, message),
                        Err(e) => tracing::warn!(%peer, tag, error = %e, "dropping undecodable message"),
                    }
                }
            }
            Ok(Incoming::Duplicate | Incoming::Gap) => {
                tracing::trace!(%peer, sequence, "duplicate dropped");
            }
        }
    }

    // -- application calls --------------------------------------------------

    /// Queues `message` for `peer`. It goes out on the next tick.
    ///
    /// # Errors
    /// [`SessionError::UnknownPeer`] without a session,
    /// [`SessionError::Codec`] if the message can't be encoded, and
    /// [`SessionError::CacheOverflow`] if this message filled the cache, in
    /// which case the session has been removed.
    pub fn send(&mut self, peer: PeerId, message: &M, clock: &TickClock) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&peer)
            .ok_or(SessionError::UnknownPeer(peer))?;
        let (tag, body) = self.codec.encode(message)?;
        session.queue.enqueue_logic(tag, Bytes::from(body));
        if session.queue.cached_len() >= self.config.max_cached_messages {
            tracing::warn!(%peer, cached = session.queue.cached_len(), "message cache full");
            self.remove(peer, DisconnectReason::CacheOverflow, clock.unix_secs());
            return Err(SessionError::CacheOverflow(peer));
        }
        Ok(())
    }

    /// Drops the session for `peer`. Returns whether there was one.
    pub fn remove_session(&mut self, peer: PeerId, clock: &TickClock) -> bool {
        self.remove(peer, DisconnectReason::Removed, clock.unix_secs())
    }

    /// Per-tick housekeeping: timeouts, heartbeats, and flushing.
    pub fn tick(&mut self, clock: &TickClock) {
        let now = clock.instant();
        self.authority.sweep(clock.unix_secs());

        let mut expired = Vec::new();
        for (peer, session) in &mut self.sessions {
            if now >= session.binding.deadline {
                expired.push(*peer);
                continue;
            }
            let idle = now.saturating_duration_since(session.last_send);
            if idle >= self.config.heartbeat_interval && session.queue.wants_heartbeat() {
                session.queue.enqueue_heartbeat();
            }
            let out = session.queue.take_unsent(now);
            if !out.is_empty() {
                for msg in out {
                    self.network.send(session.binding.conn, msg);
                }
                session.last_send = now;
            }
        }

        for peer in expired {
            tracing::info!(%peer, "session timed out");
            self.remove(peer, DisconnectReason::Timeout, clock.unix_secs());
        }
    }

    fn remove(&mut self, peer: PeerId, reason: DisconnectReason, now_sec: u64) -> bool {
        let Some(session) = self.sessions.remove(&peer) else {
            return false;
        };
        self.network.close(session.binding.conn);
        self.authority.retire(peer, &session.binding, now_sec);
        tracing::info!(%peer, %reason, "server session removed");
        self.listener.on_disconnected(peer, reason);
        true
    }
}

impl<M> std::fmt::Debug for ServerManager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerManager")
            .field("identity", &self.authority.identity())
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

    use arclink_protocol::{AckHeartbeat, ConnectResponse, LogicMessage};
    use arclink_transport::memory::MemoryNetwork;

    use super::*;
    use crate::testing::{Recorder, Seen, T0, clock, codec, inbound, network, tokens};

    const SERVER: PeerId = PeerId(1);
    const CLIENT: PeerId = PeerId(7);

    fn conn(id: u64) -> ConnectionId {
        ConnectionId::new(id)
    }

    fn server() -> (ServerManager<String>, Arc<MemoryNetwork>, Recorder) {
        let (mem, net) = network();
        let rec = Recorder::default();
        let mgr = ServerManager::new(
            Identity::new(SERVER, Role::Center),
            tokens(),
            SessionConfig::default(),
            net,
            codec(),
            Box::new(rec.clone()),
        );
        (mgr, mem, rec)
    }

    fn connect_request(token: &Token, attempt: u32, ack: u64) -> WireMessage {
        WireMessage::ConnectRequest(ConnectRequest {
            client_id: CLIENT,
            server_id: SERVER,
            attempt,
            ack,
            token: tokens().encrypt(token).unwrap(),
        })
    }

    fn login_token(at: u64) -> Token {
        tokens().new_login((CLIENT, Role::Scene), (SERVER, Role::Center), at)
    }

    fn logic(ack: u64, sequence: u64, text: &str) -> WireMessage {
        WireMessage::Logic(LogicMessage {
            ack,
            sequence,
            tag: 1,
            body: Bytes::copy_from_slice(text.as_bytes()),
        })
    }

    fn only_response(mem: &MemoryNetwork, c: ConnectionId) -> ConnectResponse {
        match mem.take_sent(c).into_iter().next() {
            Some(WireMessage::ConnectResponse(r)) => r,
            other => panic!("expected a connect response, got {other:?}"),
        }
    }

    /// Logs CLIENT in on conn 1 and returns the login token.
    fn logged_in(mgr: &mut ServerManager<String>, mem: &MemoryNetwork) -> Token {
        let l = login_token(T0);
        mgr.handle_event(inbound(1, CLIENT, connect_request(&l, 1, 0)), &clock());
        let resp = only_response(mem, conn(1));
        assert!(resp.success);
        l
    }

    // =====================================================================
    // LOGIN
    // =====================================================================

    #[test]
    fn test_login_replies_with_rotated_token_and_fires_connected() {
        let (mut mgr, mem, rec) = server();
        let l = login_token(T0);
        mgr.handle_event(inbound(1, CLIENT, connect_request(&l, 1, 0)), &clock());

        let resp = only_response(&mem, conn(1));
        assert!(resp.success);
        assert_eq!(resp.attempt, 1);
        assert_eq!(resp.ack, 0);
        let issued = tokens().decrypt(&resp.token).unwrap();
        assert_eq!(issued.verified_count, 1);
        assert_eq!(mgr.current_token(CLIENT), Some(&issued));
        assert_eq!(mgr.phase_of(CLIENT), Some(ServerPhase::Pending));
        assert_eq!(mgr.role_of(CLIENT), Some(Role::Scene));
        assert_eq!(rec.take(), vec![Seen::Connected(CLIENT)]);
    }

    #[test]
    fn test_login_newer_token_supersedes_old_session() {
        let (mut mgr, mem, rec) = server();
        logged_in(&mut mgr, &mem);
        rec.take();

        let newer = login_token(T0 + 5);
        mgr.handle_event(
            inbound(2, CLIENT, connect_request(&newer, 1, 0)),
            &clock().advance(Duration::from_secs(5)),
        );

        assert!(mem.is_closed(conn(1)));
        assert_eq!(
            rec.take(),
            vec![
                Seen::Disconnected(CLIENT, DisconnectReason::Superseded),
                Seen::Connected(CLIENT),
            ]
        );
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_forged_request_is_rejected_without_touching_session() {
        let (mut mgr, mem, rec) = server();
        logged_in(&mut mgr, &mem);
        rec.take();
        let before = mgr.current_token(CLIENT).cloned();

        let mut forged = connect_request(&login_token(T0), 9, 0);
        if let WireMessage::ConnectRequest(req) = &mut forged {
            req.token = Bytes::from_static(b"not a token");
        }
        mgr.handle_event(inbound(3, CLIENT, forged), &clock());

        let resp = only_response(&mem, conn(3));
        assert!(!resp.success);
        assert!(resp.token.is_empty());
        assert!(mem.is_closed(conn(3)));
        assert!(!mem.is_closed(conn(1)));
        assert_eq!(mgr.current_token(CLIENT).cloned(), before);
        assert!(rec.take().is_empty());
    }

    #[test]
    fn test_login_dated_at_max_timestamp_is_rejected_without_session() {
        let (mut mgr, mem, rec) = server();
        let future = login_token(u64::MAX);
        mgr.handle_event(inbound(4, CLIENT, connect_request(&future, 1, 0)), &clock());

        let resp = only_response(&mem, conn(4));
        assert!(!resp.success);
        assert!(mem.is_closed(conn(4)));
        assert!(mgr.is_empty());
        assert!(mgr.forbidden().is_empty());
        assert!(rec.take().is_empty());

        // The real login afterwards is unaffected.
        logged_in(&mut mgr, &mem);
        assert!(mgr.contains(CLIENT));
    }

    // =====================================================================
    // RECONNECT
    // =====================================================================

    #[test]
    fn test_reconnect_with_login_token_while_pending_succeeds() {
        // The login response was lost: the client still holds the login
        // token and retries on a new connection.
        let (mut mgr, mem, rec) = server();
        let l = logged_in(&mut mgr, &mem);
        rec.take();

        mgr.handle_event(inbound(2, CLIENT, connect_request(&l, 2, 0)), &clock());

        let resp = only_response(&mem, conn(2));
        assert!(resp.success);
        assert_eq!(resp.attempt, 2);
        assert!(mem.is_closed(conn(1)));
        assert_eq!(tokens().decrypt(&resp.token).unwrap().verified_count, 2);
        assert!(rec.take().is_empty());
    }

    #[test]
    fn test_reconnect_same_attempt_twice_is_rejected_but_keeps_bound_conn() {
        let (mut mgr, mem, _rec) = server();
        logged_in(&mut mgr, &mem);
        let cur = mgr.current_token(CLIENT).cloned().unwrap();

        mgr.handle_event(inbound(2, CLIENT, connect_request(&cur, 2, 0)), &clock());
        assert!(only_response(&mem, conn(2)).success);
        let after_first = mgr.current_token(CLIENT).cloned();

        mgr.handle_event(inbound(2, CLIENT, connect_request(&cur, 2, 0)), &clock());
        let resp = only_response(&mem, conn(2));
        assert!(!resp.success);
        assert!(!mem.is_closed(conn(2)));
        assert_eq!(mgr.current_token(CLIENT).cloned(), after_first);
    }

    #[test]
    fn test_reconnect_replays_unacked_messages() {
        let (mut mgr, mem, _rec) = server();
        logged_in(&mut mgr, &mem);
        let cur = mgr.current_token(CLIENT).cloned().unwrap();

        mgr.send(CLIENT, &"one".to_string(), &clock()).unwrap();
        mgr.send(CLIENT, &"two".to_string(), &clock()).unwrap();
        mgr.tick(&clock());
        assert_eq!(mem.take_sent(conn(1)).len(), 2);

        // The client only saw the first one.
        mgr.handle_event(inbound(2, CLIENT, connect_request(&cur, 2, 1)), &clock());
        let sent = mem.take_sent(conn(2));
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], WireMessage::ConnectResponse(r) if r.success && r.ack == 0));
        assert_eq!(sent[1], logic(0, 2, "two"));
        assert_eq!(mgr.cached_len(CLIENT), Some(1));
    }

    #[test]
    fn test_reconnect_with_ack_outside_window_is_rejected() {
        let (mut mgr, mem, _rec) = server();
        logged_in(&mut mgr, &mem);
        let cur = mgr.current_token(CLIENT).cloned().unwrap();

        mgr.handle_event(inbound(2, CLIENT, connect_request(&cur, 2, 5)), &clock());
        assert!(!only_response(&mem, conn(2)).success);
        assert!(mem.is_closed(conn(2)));
    }

    // =====================================================================
    // Traffic
    // =====================================================================

    #[test]
    fn test_logic_delivers_in_order_and_activates_session() {
        let (mut mgr, mem, rec) = server();
        let l = logged_in(&mut mgr, &mem);
        rec.take();

        mgr.handle_event(inbound(1, CLIENT, logic(0, 1, "hello")), &clock());
        mgr.handle_event(inbound(1, CLIENT, logic(0, 1, "hello")), &clock());
        mgr.handle_event(inbound(1, CLIENT, logic(0, 2, "world")), &clock());

        assert_eq!(
            rec.take(),
            vec![
                Seen::Message(CLIENT, "hello".into()),
                Seen::Message(CLIENT, "world".into()),
            ]
        );
        assert_eq!(mgr.phase_of(CLIENT), Some(ServerPhase::Active));
        // Once active, the login token is dead.
        assert!(mgr.forbidden().is_forbidden(CLIENT, l.created_at_sec, T0));
    }

    #[test]
    fn test_heartbeat_activates_session() {
        let (mut mgr, mem, _rec) = server();
        logged_in(&mut mgr, &mem);
        mgr.handle_event(
            inbound(1, CLIENT, WireMessage::Heartbeat(AckHeartbeat { ack: 0, sequence: 1 })),
            &clock(),
        );
        assert_eq!(mgr.phase_of(CLIENT), Some(ServerPhase::Active));
    }

    #[test]
    fn test_sequence_gap_removes_session_as_desync() {
        let (mut mgr, mem, rec) = server();
        logged_in(&mut mgr, &mem);
        rec.take();

        mgr.handle_event(inbound(1, CLIENT, logic(0, 3, "skipped ahead")), &clock());

        assert!(mgr.is_empty());
        assert!(mem.is_closed(conn(1)));
        assert_eq!(
            rec.take(),
            vec![Seen::Disconnected(CLIENT, DisconnectReason::ProtocolDesync)]
        );
    }

    #[test]
    fn test_traffic_on_unbound_conn_is_closed() {
        let (mut mgr, mem, rec) = server();
        logged_in(&mut mgr, &mem);
        rec.take();

        mgr.handle_event(inbound(9, CLIENT, logic(0, 1, "stray")), &clock());

        assert!(mem.is_closed(conn(9)));
        assert!(rec.take().is_empty());
        assert_eq!(mgr.phase_of(CLIENT), Some(ServerPhase::Pending));
    }

    // =====================================================================
    // Tick
    // =====================================================================

    #[test]
    fn test_tick_sends_heartbeat_when_idle() {
        let (mut mgr, mem, _rec) = server();
        logged_in(&mut mgr, &mem);
        mgr.handle_event(inbound(1, CLIENT, logic(0, 1, "x")), &clock());

        let later = clock().advance(Duration::from_secs(6));
        mgr.tick(&later);
        assert_eq!(
            mem.take_sent(conn(1)),
            vec![WireMessage::Heartbeat(AckHeartbeat { ack: 1, sequence: 1 })]
        );

        // Still unacked: no second heartbeat.
        mgr.tick(&later.advance(Duration::from_secs(6)));
        assert!(mem.take_sent(conn(1)).is_empty());
    }

    #[test]
    fn test_tick_removes_silent_session_and_forbids_its_token() {
        let (mut mgr, mem, rec) = server();
        logged_in(&mut mgr, &mem);
        let cur = mgr.current_token(CLIENT).cloned().unwrap();
        rec.take();

        let later = clock().advance(Duration::from_secs(16));
        mgr.tick(&later);

        assert!(mgr.is_empty());
        assert_eq!(rec.take(), vec![Seen::Disconnected(CLIENT, DisconnectReason::Timeout)]);
        assert!(mgr
            .forbidden()
            .is_forbidden(CLIENT, cur.created_at_sec, later.unix_secs()));
    }

    #[test]
    fn test_send_reaching_cache_cap_removes_session() {
        let (mem, net) = network();
        let rec = Recorder::default();
        let config = SessionConfig {
            max_cached_messages: 3,
            ..SessionConfig::default()
        };
        let mut mgr = ServerManager::new(
            Identity::new(SERVER, Role::Center),
            tokens(),
            config,
            net,
            codec(),
            Box::new(rec.clone()),
        );
        logged_in(&mut mgr, &mem);
        rec.take();

        assert!(mgr.send(CLIENT, &"a".into(), &clock()).is_ok());
        assert!(mgr.send(CLIENT, &"b".into(), &clock()).is_ok());
        let err = mgr.send(CLIENT, &"c".into(), &clock()).unwrap_err();

        assert!(matches!(err, SessionError::CacheOverflow(p) if p == CLIENT));
        assert!(mgr.is_empty());
        assert_eq!(
            rec.take(),
            vec![Seen::Disconnected(CLIENT, DisconnectReason::CacheOverflow)]
        );
    }

    #[test]
    fn test_send_to_unknown_peer_fails() {
        let (mut mgr, _mem, _rec) = server();
        assert!(matches!(
            mgr.send(CLIENT, &"x".into(), &clock()),
            Err(SessionError::UnknownPeer(_))
        ));
    }
}
