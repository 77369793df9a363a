//! TCP transport on a tokio multi-threaded runtime.
//!
//! [`TcpNetwork`] owns the runtime, so its worker threads *are* the I/O
//! thread pool. The logic thread never enters the runtime except for
//! [`TcpNetwork::listen`]; it only calls the non-blocking [`Network`]
//! methods, which hand work to per-connection tasks.
//!
//! Each connection runs two tasks:
//!
//! - a **reader** that decodes frames, runs them through the connection's
//!   [`HandshakeGate`], and pushes [`NetEvent`]s into the hand-off queue;
//! - a **writer** that drains an unbounded channel of outbound messages,
//!   batching whatever is queued into one flush.
//!
//! Closing a connection means dropping its writer channel: the writer
//! flushes what is left, shuts the socket down, and tells the reader to
//! stop. The reader always reports `Closed` on the way out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arclink_protocol::{
    DEFAULT_MAX_FRAME_BYTES, FrameCodec, GateVerdict, HandshakeGate, PeerId, WireMessage,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use crate::{
    ConnectTicket, ConnectionId, HandoffError, Lane, LaneSenders, NetEvent, Network,
    TransportError,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for the TCP transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Worker threads in the I/O runtime.
    pub io_threads: usize,
    /// Largest frame accepted or produced.
    pub max_frame_bytes: usize,
    /// How long an outbound connect may take before `ConnectFailed`.
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on every socket.
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            io_threads: 2,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            connect_timeout: Duration::from_secs(3),
            nodelay: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

type Writer = mpsc::UnboundedSender<WireMessage>;

/// State shared between the logic thread and every I/O task.
///
/// Only connection plumbing lives here. Session state never does.
struct Shared {
    config: TransportConfig,
    writers: Mutex<HashMap<ConnectionId, Writer>>,
    lanes: LaneSenders,
    next_conn: AtomicU64,
    next_ticket: AtomicU64,
}

impl Shared {
    fn writers(&self) -> MutexGuard<'_, HashMap<ConnectionId, Writer>> {
        // The map is only ever touched for an insert/remove/lookup, none of
        // which can leave it half-updated, so a poisoned lock is still sound.
        self.writers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Pushes into the lane's hand-off. `false` means the caller should
    /// close the connection that produced the event.
    fn push(&self, lane: Lane, event: NetEvent) -> bool {
        match self.lanes.get(lane).push(event) {
            Ok(()) => true,
            Err(HandoffError::Full(event)) => {
                warn!(?lane, ?event, "hand-off queue full, closing connection");
                false
            }
            Err(HandoffError::Disconnected(_)) => {
                debug!(?lane, "hand-off receiver gone");
                false
            }
        }
    }

    /// Pushes an event that ends a connection or a dial. There is no
    /// connection left to close, so a full queue is waited out for up to
    /// [`LIFECYCLE_PUSH_WAIT`] instead of dropping the event.
    async fn push_lifecycle(&self, lane: Lane, event: NetEvent) {
        let sender = self.lanes.get(lane);
        let deadline = tokio::time::Instant::now() + LIFECYCLE_PUSH_WAIT;
        let mut event = event;
        loop {
            match sender.push(event) {
                Ok(()) => return,
                Err(HandoffError::Disconnected(_)) => {
                    debug!(?lane, "hand-off receiver gone");
                    return;
                }
                Err(HandoffError::Full(back)) => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!(?lane, event = ?back, "hand-off queue full, lifecycle event lost");
                        return;
                    }
                    event = back;
                    tokio::time::sleep(LIFECYCLE_RETRY).await;
                }
            }
        }
    }
}

/// How long a `Closed` or `ConnectFailed` may wait for room in a full
/// hand-off queue.
const LIFECYCLE_PUSH_WAIT: Duration = Duration::from_secs(1);
const LIFECYCLE_RETRY: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// TcpNetwork
// ---------------------------------------------------------------------------

/// A [`Network`] over real TCP sockets.
pub struct TcpNetwork {
    runtime: Runtime,
    shared: Arc<Shared>,
}

impl TcpNetwork {
    /// Starts the I/O runtime. Each connection reports into the lane it
    /// was dialed or accepted on.
    pub fn new(config: TransportConfig, lanes: LaneSenders) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("arclink-io")
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;

        debug!(io_threads = config.io_threads, "I/O runtime started");

        Ok(Self {
            runtime,
            shared: Arc::new(Shared {
                config,
                writers: Mutex::new(HashMap::new()),
                lanes,
                next_conn: AtomicU64::new(1),
                next_ticket: AtomicU64::new(1),
            }),
        })
    }

    /// Binds a listener and starts accepting in the background. Accepted
    /// connections report into `lane`.
    ///
    /// Returns the bound address (useful with port `0`).
    pub fn listen(&self, addr: &str, lane: Lane) -> Result<SocketAddr, TransportError> {
        let listener = self
            .runtime
            .block_on(TcpListener::bind(addr))
            .map_err(TransportError::AcceptFailed)?;
        let local = listener.local_addr().map_err(TransportError::AcceptFailed)?;
        info!(%local, ?lane, "TCP transport listening");

        self.runtime
            .spawn(accept_loop(Arc::clone(&self.shared), listener, lane));
        Ok(local)
    }

    /// Number of connections with a live writer.
    pub fn open_connections(&self) -> usize {
        self.shared.writers().len()
    }
}

impl Network for TcpNetwork {
    fn connect(&self, peer: PeerId, host: &str, port: u16, lane: Lane) -> ConnectTicket {
        let ticket = ConnectTicket(self.shared.next_ticket.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::clone(&self.shared);
        let host = host.to_string();

        self.runtime.spawn(async move {
            let limit = shared.config.connect_timeout;
            let dialed = match tokio::time::timeout(
                limit,
                TcpStream::connect((host.as_str(), port)),
            )
            .await
            {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(TransportError::ConnectFailed(e)),
                Err(_) => Err(TransportError::ConnectTimeout(limit)),
            };

            match dialed {
                Ok(stream) => {
                    let conn = start_connection(
                        &shared,
                        stream,
                        HandshakeGate::dialed(peer),
                        lane,
                        Some((ticket, peer)),
                    );
                    debug!(%ticket, %peer, %conn, %host, port, "connected");
                }
                Err(e) => {
                    debug!(%ticket, %peer, %host, port, error = %e, "connect failed");
                    shared
                        .push_lifecycle(
                            lane,
                            NetEvent::ConnectFailed {
                                ticket,
                                peer,
                                reason: e.to_string(),
                            },
                        )
                        .await;
                }
            }
        });

        ticket
    }

    fn send(&self, conn: ConnectionId, msg: WireMessage) -> bool {
        match self.shared.writers().get(&conn) {
            Some(writer) => writer.send(msg).is_ok(),
            None => false,
        }
    }

    fn close(&self, conn: ConnectionId) {
        if self.shared.writers().remove(&conn).is_some() {
            debug!(%conn, "closing connection");
        }
    }
}

// ---------------------------------------------------------------------------
// Connection tasks
// ---------------------------------------------------------------------------

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, lane: Lane) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let conn = start_connection(
                    &shared,
                    stream,
                    HandshakeGate::accepted(),
                    lane,
                    None,
                );
                debug!(%conn, %addr, "accepted connection");
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                // Typically EMFILE; back off instead of spinning.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Registers the writer, announces a dialed connection, then starts the
/// reader. Must run inside the runtime.
fn start_connection(
    shared: &Arc<Shared>,
    stream: TcpStream,
    gate: HandshakeGate,
    lane: Lane,
    announce: Option<(ConnectTicket, PeerId)>,
) -> ConnectionId {
    if shared.config.nodelay {
        let _ = stream.set_nodelay(true);
    }
    let conn = ConnectionId::new(shared.next_conn.fetch_add(1, Ordering::Relaxed));
    let codec = FrameCodec::new(shared.config.max_frame_bytes);
    let (read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::unbounded_channel();
    shared.writers().insert(conn, tx);
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(write_loop(conn, FramedWrite::new(write_half, codec), rx, stop_tx));

    // `Connected` must be queued before the reader can queue anything
    // from this connection.
    if let Some((ticket, peer)) = announce {
        if !shared.push(lane, NetEvent::Connected { ticket, peer, conn }) {
            shared.writers().remove(&conn);
            return conn;
        }
    }

    tokio::spawn(read_loop(
        Arc::clone(shared),
        conn,
        FramedRead::new(read_half, codec),
        gate,
        lane,
        stop_rx,
    ));
    conn
}

async fn write_loop(
    conn: ConnectionId,
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<WireMessage>,
    stop: oneshot::Sender<()>,
) {
    while let Some(first) = rx.recv().await {
        let mut result = sink.feed(first).await;
        while result.is_ok() {
            match rx.try_recv() {
                Ok(msg) => result = sink.feed(msg).await,
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = sink.flush().await;
        }
        if let Err(e) = result {
            debug!(%conn, error = %e, "write failed");
            break;
        }
    }

    let _ = sink.close().await;
    let _ = stop.send(());
    trace!(%conn, "writer stopped");
}

async fn read_loop(
    shared: Arc<Shared>,
    conn: ConnectionId,
    mut frames: FramedRead<OwnedReadHalf, FrameCodec>,
    mut gate: HandshakeGate,
    lane: Lane,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            frame = frames.next() => frame,
            _ = &mut stop => break,
        };

        match next {
            Some(Ok(message)) => match gate.admit(&message) {
                GateVerdict::Pass(peer) => {
                    let event = NetEvent::Inbound {
                        conn,
                        peer,
                        message,
                    };
                    if !shared.push(lane, event) {
                        break;
                    }
                }
                GateVerdict::Reject(reason) => {
                    warn!(%conn, reason, "handshake gate closed connection");
                    break;
                }
            },
            Some(Err(e)) => {
                // Bad checksum, unknown tag, oversize: no partial trust.
                warn!(%conn, error = %e, "frame error, closing connection");
                break;
            }
            None => {
                debug!(%conn, "peer closed connection");
                break;
            }
        }
    }

    shared.writers().remove(&conn);
    shared
        .push_lifecycle(
            lane,
            NetEvent::Closed {
                conn,
                peer: gate.principal(),
            },
        )
        .await;
}
