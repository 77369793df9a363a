//! Blocking request/response client.
//!
//! Unlike [`ClientManager`](crate::ClientManager), a [`SyncClient`] has no
//! queue, no ack, and no replay. [`request`](SyncClient::request) dials if
//! needed, performs a LOGIN or RECONNECT handshake, sends one SYNC_REQUEST,
//! and blocks the calling thread until the matching SYNC_RESPONSE arrives or
//! every attempt has timed out.
//!
//! Its connections report on their own [`Lane::Sync`], which nothing else
//! drains, so waiting here never swallows events meant for the reliable
//! sessions. Between requests, [`tick`](SyncClient::tick) absorbs whatever
//! arrived and keeps idle connections alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arclink_protocol::{ConnectRequest, PayloadCodec, PeerId, Role, SyncRequest, SyncResponse, WireMessage};
use arclink_tick::TickClock;
use arclink_transport::{ConnectionId, HandoffReceiver, Lane, NetEvent, Network};
use bytes::Bytes;

use crate::{Identity, Registration, SessionConfig, SessionError, TokenService};

#[derive(Debug)]
struct SyncPeer {
    role: Role,
    host: String,
    port: u16,
    token: Bytes,
    holds_login: bool,
    attempt: u32,
    conn: Option<ConnectionId>,
    next_request_id: u64,
    last_send: Instant,
}

/// See the module docs.
pub struct SyncClient<M> {
    identity: Identity,
    config: SessionConfig,
    tokens: TokenService,
    network: Arc<dyn Network>,
    codec: Arc<dyn PayloadCodec<Message = M>>,
    lane: HandoffReceiver<NetEvent>,
    peers: HashMap<PeerId, SyncPeer>,
}

impl<M: 'static> SyncClient<M> {
    /// `lane` must be the receiving half of [`Lane::Sync`].
    pub fn new(
        identity: Identity,
        tokens: TokenService,
        config: SessionConfig,
        network: Arc<dyn Network>,
        codec: Arc<dyn PayloadCodec<Message = M>>,
        lane: HandoffReceiver<NetEvent>,
    ) -> Self {
        Self {
            identity,
            config,
            tokens,
            network,
            codec,
            lane,
            peers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Whether a verified connection to `peer` is open.
    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).is_some_and(|p| p.conn.is_some())
    }

    /// Makes `peer` reachable by [`request`](Self::request). Nothing is
    /// dialed until the first request.
    ///
    /// # Errors
    /// [`SessionError::AlreadyRegistered`] for a known peer, or
    /// [`SessionError::TokenEncoding`] if the token can't be sealed.
    pub fn register(&mut self, registration: Registration, clock: &TickClock) -> Result<(), SessionError> {
        let Registration {
            peer,
            role,
            host,
            port,
            token,
        } = registration;
        if self.peers.contains_key(&peer) {
            return Err(SessionError::AlreadyRegistered(peer));
        }
        let (token, holds_login) = match token {
            Some(t) => (self.tokens.encrypt(&t)?, t.is_login()),
            None => (self.mint_login(peer, role, clock)?, true),
        };
        self.peers.insert(
            peer,
            SyncPeer {
                role,
                host,
                port,
                token,
                holds_login,
                attempt: 0,
                conn: None,
                next_request_id: 0,
                last_send: clock.instant(),
            },
        );
        tracing::debug!(%peer, %role, "sync peer registered");
        Ok(())
    }

    /// Forgets `peer` and closes its connection.
    pub fn remove(&mut self, peer: PeerId) -> bool {
        let Some(state) = self.peers.remove(&peer) else {
            return false;
        };
        if let Some(conn) = state.conn {
            self.network.close(conn);
        }
        true
    }

    fn mint_login(&self, peer: PeerId, role: Role, clock: &TickClock) -> Result<Bytes, SessionError> {
        let token = self.tokens.new_login(
            (self.identity.id, self.identity.role),
            (peer, role),
            clock.unix_secs(),
        );
        self.tokens.encrypt(&token)
    }

    /// Sends `message` to `peer` and blocks for the answer.
    ///
    /// Returns `Ok(None)` when every attempt timed out, or when the answer
    /// couldn't be decoded. A retry reuses the request id, so a server that
    /// already handled it answers from its cache instead of running the
    /// handler twice.
    ///
    /// # Errors
    /// [`SessionError::UnknownPeer`] for an unregistered peer, or
    /// [`SessionError::Codec`] if `message` can't be encoded.
    pub fn request(&mut self, peer: PeerId, message: &M, clock: &TickClock) -> Result<Option<M>, SessionError> {
        let (tag, body) = self.codec.encode(message)?;
        let body = Bytes::from(body);
        let state = self
            .peers
            .get_mut(&peer)
            .ok_or(SessionError::UnknownPeer(peer))?;
        state.next_request_id += 1;
        let request_id = state.next_request_id;

        for attempt in 1..=self.config.request_retries.max(1) {
            let conn = match self.peers.get(&peer).and_then(|p| p.conn) {
                Some(conn) => conn,
                None => match self.establish(peer, clock)? {
                    Some(conn) => conn,
                    None => continue,
                },
            };

            let req = WireMessage::SyncRequest(SyncRequest {
                request_id,
                tag,
                body: body.clone(),
            });
            if !self.network.send(conn, req) {
                self.drop_conn(peer, conn);
                continue;
            }
            if let Some(state) = self.peers.get_mut(&peer) {
                state.last_send = clock.instant();
            }

            match self.await_response(peer, conn, request_id) {
                Some(resp) => {
                    return match self.codec.decode(resp.tag, &resp.body) {
                        Ok(answer) => Ok(Some(answer)),
                        Err(e) => {
                            tracing::warn!(%peer, request_id, tag = resp.tag, error = %e, "undecodable sync response");
                            Ok(None)
                        }
                    };
                }
                None => {
                    tracing::debug!(%peer, request_id, attempt, "sync request timed out");
                    self.drop_conn(peer, conn);
                }
            }
        }

        tracing::warn!(%peer, request_id, "sync request gave up");
        Ok(None)
    }

    /// Per-tick housekeeping: absorbs lane events that arrived between
    /// requests and heartbeats idle connections.
    pub fn tick(&mut self, clock: &TickClock) {
        while let Some(event) = self.lane.try_recv() {
            self.absorb(event);
        }
        let now = clock.instant();
        for (peer, state) in &mut self.peers {
            let Some(conn) = state.conn else {
                continue;
            };
            if now.saturating_duration_since(state.last_send) < self.config.heartbeat_interval {
                continue;
            }
            if self.network.send(conn, WireMessage::SyncHeartbeat) {
                state.last_send = now;
            } else {
                tracing::debug!(%peer, %conn, "sync connection gone");
                state.conn = None;
            }
        }
    }

    /// Dials `peer` and runs the handshake. `Ok(None)` means this attempt
    /// failed and the caller may retry.
    fn establish(&mut self, peer: PeerId, clock: &TickClock) -> Result<Option<ConnectionId>, SessionError> {
        let Some(state) = self.peers.get(&peer) else {
            return Err(SessionError::UnknownPeer(peer));
        };
        let ticket = self
            .network
            .connect(peer, &state.host, state.port, Lane::Sync);

        let deadline = Instant::now() + self.config.connect_timeout;
        let conn = loop {
            let Some(event) = self.next_event(deadline) else {
                tracing::debug!(%peer, %ticket, "sync connect timed out");
                return Ok(None);
            };
            match event {
                NetEvent::Connected { ticket: t, conn, .. } if t == ticket => break conn,
                NetEvent::ConnectFailed { ticket: t, reason, .. } if t == ticket => {
                    tracing::debug!(%peer, %ticket, reason, "sync connect failed");
                    return Ok(None);
                }
                other => self.absorb(other),
            }
        };

        let Some(state) = self.peers.get_mut(&peer) else {
            self.network.close(conn);
            return Err(SessionError::UnknownPeer(peer));
        };
        state.attempt += 1;
        let attempt = state.attempt;
        let req = ConnectRequest {
            client_id: self.identity.id,
            server_id: peer,
            attempt,
            ack: 0,
            token: state.token.clone(),
        };
        self.network.send(conn, WireMessage::ConnectRequest(req));

        let deadline = Instant::now() + self.config.verify_timeout;
        loop {
            let Some(event) = self.next_event(deadline) else {
                tracing::debug!(%peer, %conn, attempt, "sync handshake timed out");
                self.network.close(conn);
                return Ok(None);
            };
            match event {
                NetEvent::Inbound {
                    conn: c,
                    message: WireMessage::ConnectResponse(resp),
                    ..
                } if c == conn => {
                    if resp.attempt != attempt {
                        continue;
                    }
                    if !resp.success {
                        // Whatever we held is no good; start over from a login.
                        tracing::info!(%peer, attempt, "sync handshake rejected");
                        self.network.close(conn);
                        let role = self.role_of(peer)?;
                        let fresh = self.mint_login(peer, role, clock)?;
                        if let Some(state) = self.peers.get_mut(&peer) {
                            state.token = fresh;
                            state.holds_login = true;
                        }
                        return Ok(None);
                    }
                    let Some(state) = self.peers.get_mut(&peer) else {
                        self.network.close(conn);
                        return Err(SessionError::UnknownPeer(peer));
                    };
                    state.token = resp.token;
                    state.holds_login = false;
                    state.conn = Some(conn);
                    state.last_send = clock.instant();
                    tracing::debug!(%peer, %conn, attempt, "sync connection verified");
                    return Ok(Some(conn));
                }
                NetEvent::Closed { conn: c, .. } if c == conn => {
                    tracing::debug!(%peer, %conn, "sync connection closed during handshake");
                    return Ok(None);
                }
                other => self.absorb(other),
            }
        }
    }

    fn role_of(&self, peer: PeerId) -> Result<Role, SessionError> {
        self.peers
            .get(&peer)
            .map(|p| p.role)
            .ok_or(SessionError::UnknownPeer(peer))
    }

    fn await_response(&mut self, peer: PeerId, conn: ConnectionId, request_id: u64) -> Option<SyncResponse> {
        let deadline = Instant::now() + self.config.request_timeout;
        loop {
            let event = self.next_event(deadline)?;
            match event {
                NetEvent::Inbound {
                    conn: c,
                    message: WireMessage::SyncResponse(resp),
                    ..
                } if c == conn => {
                    if resp.request_id == request_id {
                        return Some(resp);
                    }
                    tracing::debug!(%peer, got = resp.request_id, want = request_id, "stale sync response ignored");
                }
                other => {
                    self.absorb(other);
                    if self.peers.get(&peer).and_then(|p| p.conn) != Some(conn) {
                        return None;
                    }
                }
            }
        }
    }

    /// Blocks for the next lane event until `deadline`.
    fn next_event(&self, deadline: Instant) -> Option<NetEvent> {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        self.lane.recv_timeout(remaining.max(Duration::from_millis(1)))
    }

    /// Handles an event nobody is waiting for.
    fn absorb(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected { conn, peer, .. } => {
                tracing::debug!(%peer, %conn, "late sync connect, closing");
                self.network.close(conn);
            }
            NetEvent::Closed { conn, .. } => {
                for state in self.peers.values_mut() {
                    if state.conn == Some(conn) {
                        state.conn = None;
                    }
                }
            }
            NetEvent::ConnectFailed { .. } | NetEvent::Inbound { .. } => {}
        }
    }

    fn drop_conn(&mut self, peer: PeerId, conn: ConnectionId) {
        self.network.close(conn);
        if let Some(state) = self.peers.get_mut(&peer) {
            if state.conn == Some(conn) {
                state.conn = None;
            }
        }
    }
}

impl<M> std::fmt::Debug for SyncClient<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("identity", &self.identity)
            .field("peers", &self.peers.len())
            .finish()
    }
}

// =========================================================================
// Tests
// =========================================================================
