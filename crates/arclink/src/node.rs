//! One backend process's view of its links.
//!
//! A [`Node`] owns the TCP network and the four session managers and is
//! driven from a single logic thread:
//!
//! ```text
//!   I/O threads ──Main──────▶ ┌───────────┐ ──▶ ClientManager (dialed conns)
//!                             │ Node::tick│ ──▶ ServerManager (accepted conns)
//!   I/O threads ──SyncServe─▶ └───────────┘ ──▶ SyncServer
//!   I/O threads ──Sync──────▶ SyncClient::request (blocking, on demand)
//! ```
//!
//! Every tick drains the hand-off lanes in full, routes each event to the
//! manager that owns its connection, then lets every manager run its
//! timers. Nothing else touches session state.

use std::net::SocketAddr;
use std::sync::Arc;

use arclink_protocol::{PayloadCodec, PeerId, Tagged};
use arclink_session::{
    ClientManager, ClientSession, Identity, Registration, ServerManager, SessionListener,
    SyncClient, SyncServer, TokenService, XorCipher,
};
use arclink_tick::{FramePacer, TickClock, TickInfo};
use arclink_transport::{HandoffReceiver, Lane, NetEvent, Network, TcpNetwork, lanes};

use crate::{ArclinkError, NodeConfig};

/// See the module docs.
pub struct Node<M: Tagged> {
    identity: Identity,
    network: Arc<TcpNetwork>,
    main: HandoffReceiver<NetEvent>,
    sync_serve: HandoffReceiver<NetEvent>,
    client: ClientManager<M>,
    server: ServerManager<M>,
    sync_client: SyncClient<M>,
    sync_server: SyncServer<M>,
    pacer: FramePacer,
    clock: TickClock,
}

impl<M: Tagged + 'static> Node<M> {
    /// Starts the I/O runtime and builds the managers.
    ///
    /// `codec` serves accepted sessions and both sync directions;
    /// `listener` receives the lifecycle of accepted sessions. Dialed
    /// sessions bring their own in [`register`](Self::register).
    ///
    /// # Errors
    /// [`ArclinkError::Transport`] if the I/O runtime can't start.
    pub fn new(
        config: &NodeConfig,
        codec: Arc<dyn PayloadCodec<Message = M>>,
        listener: Box<dyn SessionListener<M>>,
    ) -> Result<Self, ArclinkError> {
        let identity = config.identity();
        let session = config.session();
        let tokens = TokenService::new(
            Arc::new(XorCipher::new(config.token_key.as_bytes())),
            session.login_token_ttl,
        );

        let (senders, receivers) = lanes(config.handoff_capacity);
        let network = Arc::new(TcpNetwork::new(config.transport(), senders)?);
        let shared: Arc<dyn Network> = network.clone();

        let client = ClientManager::new(identity, tokens.clone(), session.clone(), Arc::clone(&shared));
        let server = ServerManager::new(
            identity,
            tokens.clone(),
            session.clone(),
            Arc::clone(&shared),
            Arc::clone(&codec),
            listener,
        );
        let sync_client = SyncClient::new(
            identity,
            tokens.clone(),
            session.clone(),
            Arc::clone(&shared),
            Arc::clone(&codec),
            receivers.sync,
        );
        let sync_server = SyncServer::new(identity, tokens, &session, shared, codec);

        tracing::info!(peer = %identity.id, role = %identity.role, "node started");

        Ok(Self {
            identity,
            network,
            main: receivers.main,
            sync_serve: receivers.sync_serve,
            client,
            server,
            sync_client,
            sync_server,
            pacer: FramePacer::new(config.tick()),
            clock: TickClock::now(),
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// The clock cached by the last tick.
    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    /// Accepts reliable sessions from peers on `addr`.
    pub fn listen(&self, addr: &str) -> Result<SocketAddr, ArclinkError> {
        Ok(self.network.listen(addr, Lane::Main)?)
    }

    /// Accepts sync RPC connections on `addr`.
    pub fn listen_sync(&self, addr: &str) -> Result<SocketAddr, ArclinkError> {
        Ok(self.network.listen(addr, Lane::SyncServe)?)
    }

    // -----------------------------------------------------------------------
    // Dialed sessions
    // -----------------------------------------------------------------------

    /// Opens a reliable session to a peer the discovery layer announced.
    pub fn register(
        &mut self,
        registration: Registration,
        codec: Arc<dyn PayloadCodec<Message = M>>,
        listener: Box<dyn SessionListener<M>>,
    ) -> Result<&ClientSession<M>, ArclinkError> {
        Ok(self.client.register(registration, codec, listener, &self.clock)?)
    }

    /// Opens a sync RPC link to a peer's sync listener.
    pub fn register_sync(&mut self, registration: Registration) -> Result<(), ArclinkError> {
        Ok(self.sync_client.register(registration, &self.clock)?)
    }

    /// Queues `message` for `peer`, on the session this node dialed if
    /// there is one, else on the session the peer dialed.
    pub fn send(&mut self, peer: PeerId, message: &M) -> Result<(), ArclinkError> {
        if self.client.session(peer).is_some() {
            self.client.send(peer, message)?;
        } else {
            self.server.send(peer, message, &self.clock)?;
        }
        Ok(())
    }

    /// Drops every session with `peer`, in both directions. Returns whether
    /// there was any.
    pub fn remove_session(&mut self, peer: PeerId) -> bool {
        let dialed = self.client.remove_session(peer);
        let accepted = self.server.remove_session(peer, &self.clock);
        let sync = self.sync_client.remove(peer);
        dialed || accepted || sync
    }

    /// Sends a sync request and blocks until its answer, or `None` once
    /// every retry timed out.
    pub fn request(&mut self, peer: PeerId, message: &M) -> Result<Option<M>, ArclinkError> {
        Ok(self.sync_client.request(peer, message, &self.clock)?)
    }

    /// Registers the handler answering sync requests tagged `tag`.
    pub fn register_handler<F>(&mut self, tag: u32, handler: F) -> Result<(), ArclinkError>
    where
        F: FnMut(PeerId, M) -> M + 'static,
    {
        Ok(self.sync_server.register_handler(tag, handler)?)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn client(&self) -> &ClientManager<M> {
        &self.client
    }

    pub fn server(&self) -> &ServerManager<M> {
        &self.server
    }

    pub fn sync_client(&self) -> &SyncClient<M> {
        &self.sync_client
    }

    pub fn sync_server(&self) -> &SyncServer<M> {
        &self.sync_server
    }

    pub fn open_connections(&self) -> usize {
        self.network.open_connections()
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Runs one logic frame against the wall clock.
    pub fn tick(&mut self) {
        self.tick_at(TickClock::now());
    }

    /// Runs one logic frame at `clock`.
    pub fn tick_at(&mut self, clock: TickClock) {
        self.clock = clock;

        for event in self.main.drain() {
            if self.client.owns(&event) {
                self.client.handle_event(event, &self.clock);
            } else {
                self.server.handle_event(event, &self.clock);
            }
        }
        self.sync_server.handle_events(self.sync_serve.drain(), &self.clock);

        self.client.tick(&self.clock);
        self.server.tick(&self.clock);
        self.sync_client.tick(&self.clock);
        self.sync_server.tick(&self.clock);
    }

    /// Sleeps until the next frame is due, then runs it.
    pub fn step(&mut self) -> TickInfo {
        let info = self.pacer.wait_for_tick();
        self.tick_at(info.clock);
        self.pacer.record_tick_end();
        info
    }
}

impl<M: Tagged + 'static> std::fmt::Debug for Node<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .field("dialed", &self.client.len())
            .field("accepted", &self.server.len())
            .field("sync_peers", &self.sync_client.len())
            .field("sync_sessions", &self.sync_server.len())
            .finish_non_exhaustive()
    }
}
