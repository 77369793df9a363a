//! The answering side of sync RPC.
//!
//! Handshakes go through the same [`Authority`] as reliable sessions, so
//! LOGIN, RECONNECT, token rotation and forbidding behave identically. What
//! differs is the payload: instead of a sequenced stream, each session
//! remembers the last request it answered. A retried request (same id)
//! gets that answer again without rerunning the handler, and an older id
//! is dropped.
//!
//! Events are handled in batches, one per tick. Within a batch only the
//! newest request per peer is served.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use arclink_protocol::{
    ConnectRequest, Dispatcher, PayloadCodec, PeerId, ProtocolError, SyncRequest, SyncResponse,
    Tagged, WireMessage,
};
use arclink_tick::TickClock;
use arclink_transport::{ConnectionId, NetEvent, Network};
use bytes::Bytes;

use crate::handshake::{Authority, Binding, Verdict, response};
use crate::{ForbiddenTable, Identity, ServerPhase, SessionConfig, TokenService};

#[derive(Debug)]
struct SyncSession {
    binding: Binding,
    last_answered: Option<SyncResponse>,
}

/// See the module docs.
pub struct SyncServer<M> {
    authority: Authority,
    network: Arc<dyn Network>,
    codec: Arc<dyn PayloadCodec<Message = M>>,
    handlers: Dispatcher<M, M>,
    sessions: HashMap<PeerId, SyncSession>,
}

impl<M: Tagged + 'static> SyncServer<M> {
    pub fn new(
        identity: Identity,
        tokens: TokenService,
        config: &SessionConfig,
        network: Arc<dyn Network>,
        codec: Arc<dyn PayloadCodec<Message = M>>,
    ) -> Self {
        Self {
            authority: Authority::new(identity, tokens, config),
            network,
            codec,
            handlers: Dispatcher::new(),
            sessions: HashMap::new(),
        }
    }

    /// Registers the handler answering requests tagged `tag`.
    ///
    /// # Errors
    /// [`ProtocolError::DuplicateHandler`] if `tag` already has one.
    pub fn register_handler<F>(&mut self, tag: u32, handler: F) -> Result<(), ProtocolError>
    where
        F: FnMut(PeerId, M) -> M + 'static,
    {
        self.handlers.register(tag, handler)
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

    /// Id of the last request answered for `peer`.
    pub fn last_answered(&self, peer: PeerId) -> Option<u64> {
        self.sessions
            .get(&peer)
            .and_then(|s| s.last_answered.as_ref())
            .map(|r| r.request_id)
    }

    pub fn forbidden(&self) -> &ForbiddenTable {
        self.authority.forbidden()
    }

    /// Processes one tick's worth of sync-lane events.
    pub fn handle_events(&mut self, events: impl IntoIterator<Item = NetEvent>, clock: &TickClock) {
        let mut newest: HashMap<PeerId, (ConnectionId, SyncRequest)> = HashMap::new();
        for event in events {
            match event {
                NetEvent::Inbound {
                    conn,
                    peer,
                    message,
                } => match message {
                    WireMessage::ConnectRequest(req) => self.handshake(conn, req, clock),
                    WireMessage::SyncHeartbeat => self.keepalive(conn, peer, clock),
                    WireMessage::SyncRequest(req) => match newest.entry(peer) {
                        Entry::Occupied(mut slot) => {
                            if req.request_id > slot.get().1.request_id {
                                slot.insert((conn, req));
                            }
                        }
                        Entry::Vacant(slot) => {
                            slot.insert((conn, req));
                        }
                    },
                    other => {
                        tracing::warn!(%conn, %peer, kind = ?other.wire_type(), "unexpected message on sync connection");
                        self.network.close(conn);
                    }
                },
                NetEvent::Closed { conn, peer } => {
                    tracing::debug!(%conn, ?peer, "sync connection closed");
                }
                NetEvent::Connected { .. } | NetEvent::ConnectFailed { .. } => {}
            }
        }
        for (peer, (conn, req)) in newest {
            self.serve(peer, conn, req, clock);
        }
    }

    /// Expires silent sessions.
    pub fn tick(&mut self, clock: &TickClock) {
        let now = clock.instant();
        let now_sec = clock.unix_secs();
        self.authority.sweep(now_sec);
        let expired: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now >= s.binding.deadline)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired {
            if let Some(session) = self.sessions.remove(&peer) {
                self.network.close(session.binding.conn);
                self.authority.retire(peer, &session.binding, now_sec);
                tracing::info!(%peer, "sync session timed out");
            }
        }
    }

    fn handshake(&mut self, conn: ConnectionId, req: ConnectRequest, clock: &TickClock) {
        let peer = req.client_id;
        let existing = self.sessions.get(&peer).map(|s| &s.binding);
        // Sync sessions carry no stream, so the only valid ack is zero.
        let verdict = self
            .authority
            .classify(&req, existing, |ack| ack == 0, clock.unix_secs());
        match verdict {
            Verdict::Login(token) => {
                let (binding, sealed) = match self.authority.login(token, conn, req.attempt, clock) {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!(%peer, error = %e, "failed to issue sync token");
                        self.reject(conn, &req);
                        return;
                    }
                };
                if let Some(old) = self.sessions.remove(&peer) {
                    if old.binding.conn != conn {
                        self.network.close(old.binding.conn);
                    }
                    self.authority.retire(peer, &old.binding, clock.unix_secs());
                }
                self.network.send(conn, response(req.attempt, true, 0, sealed));
                self.sessions.insert(
                    peer,
                    SyncSession {
                        binding,
                        last_answered: None,
                    },
                );
                tracing::info!(%peer, %conn, "sync session logged in");
            }
            Verdict::Reconnect(presented) => {
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return;
                };
                match self
                    .authority
                    .reconnect(&mut session.binding, presented, conn, req.attempt, clock)
                {
                    Ok((old, sealed)) => {
                        if let Some(old) = old {
                            self.network.close(old);
                        }
                        self.network.send(conn, response(req.attempt, true, 0, sealed));
                        tracing::debug!(%peer, %conn, "sync session reconnected");
                    }
                    Err(e) => {
                        tracing::error!(%peer, error = %e, "failed to issue sync token");
                        self.network
                            .send_and_close(conn, response(req.attempt, false, 0, Bytes::new()));
                    }
                }
            }
            Verdict::Reject(reason) => {
                tracing::warn!(%conn, client = %peer, attempt = req.attempt, %reason, "sync connect request rejected");
                self.reject(conn, &req);
            }
        }
    }

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

    /// Looks up the session bound to `conn`, refreshing it. Closes `conn`
    /// if it isn't bound.
    fn bound(&mut self, conn: ConnectionId, peer: PeerId, clock: &TickClock) -> Option<&mut SyncSession> {
        let timeout = self.authority.session_timeout();
        match self.sessions.get_mut(&peer) {
            Some(session) if session.binding.conn == conn => {
                self.authority
                    .confirm(peer, &mut session.binding, clock.unix_secs());
                session.binding.touch(clock.instant(), timeout);
                Some(session)
            }
            _ => {
                tracing::debug!(%conn, %peer, "sync traffic on unbound connection, closing");
                self.network.close(conn);
                None
            }
        }
    }

    fn keepalive(&mut self, conn: ConnectionId, peer: PeerId, clock: &TickClock) {
        self.bound(conn, peer, clock);
    }

    fn serve(&mut self, peer: PeerId, conn: ConnectionId, req: SyncRequest, clock: &TickClock) {
        let Some(session) = self.bound(conn, peer, clock) else {
            return;
        };
        if let Some(last) = session.last_answered.clone() {
            if req.request_id == last.request_id {
                tracing::debug!(%peer, request_id = req.request_id, "repeated sync request, resending answer");
                self.network.send(conn, WireMessage::SyncResponse(last));
                return;
            }
            if req.request_id < last.request_id {
                tracing::debug!(%peer, request_id = req.request_id, "stale sync request dropped");
                return;
            }
        }

        let message = match self.codec.decode(req.tag, &req.body) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%peer, tag = req.tag, error = %e, "undecodable sync request");
                return;
            }
        };
        let answer = match self.handlers.dispatch(peer, message) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(%peer, tag = req.tag, error = %e, "no handler for sync request");
                return;
            }
        };
        let (tag, body) = match self.codec.encode(&answer) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(%peer, error = %e, "failed to encode sync response");
                return;
            }
        };
        let resp = SyncResponse {
            request_id: req.request_id,
            tag,
            body: Bytes::from(body),
        };
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.last_answered = Some(resp.clone());
        }
        self.network.send(conn, WireMessage::SyncResponse(resp));
    }
}

impl<M> std::fmt::Debug for SyncServer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
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
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    use arclink_protocol::Role;
    use arclink_transport::memory::MemoryNetwork;

    use super::*;
    use crate::Token;
    use crate::testing::{Rpc, T0, clock, inbound, network, rpc_codec, tokens};

    const SERVER: PeerId = PeerId(1);
    const CLIENT: PeerId = PeerId(7);

    fn conn(id: u64) -> ConnectionId {
        ConnectionId::new(id)
    }

    /// A server whose echo handler counts its invocations.
    fn server() -> (SyncServer<Rpc>, Arc<MemoryNetwork>, Rc<Cell<u32>>) {
        let (mem, net) = network();
        let mut srv = SyncServer::new(
            Identity::new(SERVER, Role::Center),
            tokens(),
            &SessionConfig::default(),
            net,
            rpc_codec(),
        );
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        srv.register_handler(10, move |_, msg| {
            counter.set(counter.get() + 1);
            match msg {
                Rpc::Ask(q) => Rpc::Answer(format!("re: {q}")),
                other => other,
            }
        })
        .unwrap();
        (srv, mem, calls)
    }

    fn login_request(attempt: u32, ack: u64) -> WireMessage {
        let token: Token = tokens().new_login((CLIENT, Role::Scene), (SERVER, Role::Center), T0);
        WireMessage::ConnectRequest(ConnectRequest {
            client_id: CLIENT,
            server_id: SERVER,
            attempt,
            ack,
            token: tokens().encrypt(&token).unwrap(),
        })
    }

    fn ask(request_id: u64, text: &str) -> WireMessage {
        let (tag, body) = rpc_codec().encode(&Rpc::Ask(text.into())).unwrap();
        WireMessage::SyncRequest(SyncRequest {
            request_id,
            tag,
            body: Bytes::from(body),
        })
    }

    fn answers(mem: &MemoryNetwork, c: ConnectionId) -> Vec<(u64, Rpc)> {
        mem.take_sent(c)
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::SyncResponse(r) => {
                    Some((r.request_id, rpc_codec().decode(r.tag, &r.body).unwrap()))
                }
                _ => None,
            })
            .collect()
    }

    fn logged_in() -> (SyncServer<Rpc>, Arc<MemoryNetwork>, Rc<Cell<u32>>) {
        let (mut srv, mem, calls) = server();
        srv.handle_events([inbound(1, CLIENT, login_request(1, 0))], &clock());
        match mem.take_sent(conn(1)).as_slice() {
            [WireMessage::ConnectResponse(r)] => assert!(r.success),
            other => panic!("expected a connect response, got {other:?}"),
        }
        (srv, mem, calls)
    }

    // =====================================================================
    // Handshake
    // =====================================================================

    #[test]
    fn test_login_creates_session() {
        let (srv, _mem, _calls) = logged_in();
        assert!(srv.contains(CLIENT));
        assert_eq!(srv.phase_of(CLIENT), Some(ServerPhase::Pending));
    }

    #[test]
    fn test_login_with_nonzero_ack_is_rejected() {
        let (mut srv, mem, _calls) = server();
        srv.handle_events([inbound(1, CLIENT, login_request(1, 3))], &clock());
        assert!(srv.is_empty());
        assert!(mem.is_closed(conn(1)));
    }

    // =====================================================================
    // Requests
    // =====================================================================

    #[test]
    fn test_request_is_answered_and_activates_session() {
        let (mut srv, mem, calls) = logged_in();
        srv.handle_events([inbound(1, CLIENT, ask(1, "hi"))], &clock());

        assert_eq!(answers(&mem, conn(1)), vec![(1, Rpc::Answer("re: hi".into()))]);
        assert_eq!(calls.get(), 1);
        assert_eq!(srv.phase_of(CLIENT), Some(ServerPhase::Active));
        assert_eq!(srv.last_answered(CLIENT), Some(1));
    }

    #[test]
    fn test_repeated_request_is_answered_from_cache() {
        let (mut srv, mem, calls) = logged_in();
        srv.handle_events([inbound(1, CLIENT, ask(1, "once"))], &clock());
        srv.handle_events([inbound(1, CLIENT, ask(1, "once"))], &clock());

        assert_eq!(
            answers(&mem, conn(1)),
            vec![
                (1, Rpc::Answer("re: once".into())),
                (1, Rpc::Answer("re: once".into())),
            ]
        );
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_older_request_is_dropped() {
        let (mut srv, mem, calls) = logged_in();
        srv.handle_events([inbound(1, CLIENT, ask(2, "new"))], &clock());
        srv.handle_events([inbound(1, CLIENT, ask(1, "old"))], &clock());

        assert_eq!(answers(&mem, conn(1)), vec![(2, Rpc::Answer("re: new".into()))]);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_batch_serves_only_newest_request() {
        let (mut srv, mem, calls) = logged_in();
        srv.handle_events(
            [
                inbound(1, CLIENT, ask(1, "a")),
                inbound(1, CLIENT, ask(3, "c")),
                inbound(1, CLIENT, ask(2, "b")),
            ],
            &clock(),
        );
        assert_eq!(answers(&mem, conn(1)), vec![(3, Rpc::Answer("re: c".into()))]);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_request_on_unbound_connection_is_closed() {
        let (mut srv, mem, calls) = logged_in();
        srv.handle_events([inbound(4, CLIENT, ask(1, "sneaky"))], &clock());
        assert!(mem.is_closed(conn(4)));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_request_without_handler_gets_no_answer() {
        let (mut srv, mem, _calls) = logged_in();
        let (tag, body) = rpc_codec().encode(&Rpc::Answer("?".into())).unwrap();
        let stray = WireMessage::SyncRequest(SyncRequest {
            request_id: 1,
            tag,
            body: Bytes::from(body),
        });
        srv.handle_events([inbound(1, CLIENT, stray)], &clock());
        assert!(answers(&mem, conn(1)).is_empty());
        assert_eq!(srv.last_answered(CLIENT), None);
    }

    // =====================================================================
    // Keepalive and expiry
    // =====================================================================

    #[test]
    fn test_heartbeat_keeps_session_alive() {
        let (mut srv, _mem, _calls) = logged_in();
        let c = clock();
        srv.handle_events([inbound(1, CLIENT, WireMessage::SyncHeartbeat)], &c.advance(Duration::from_secs(10)));
        srv.tick(&c.advance(Duration::from_secs(20)));
        assert!(srv.contains(CLIENT));
        assert_eq!(srv.phase_of(CLIENT), Some(ServerPhase::Active));
    }

    #[test]
    fn test_silent_session_expires() {
        let (mut srv, mem, _calls) = logged_in();
        srv.tick(&clock().advance(Duration::from_secs(16)));
        assert!(srv.is_empty());
        assert!(mem.is_closed(conn(1)));
    }
}
