//! Overlay viewer broadcast server.
//!
//! Viewers connect over WebSocket. Each accepted connection first receives
//! the current recommendation snapshot (when one exists), then joins the
//! connection set. `broadcast` writes one text frame to every member; a
//! member whose write fails is dropped from the set on the spot and the rest
//! still get the frame. Text frames from viewers go into the same inbound
//! queue the advisor pump feeds, tagged with the viewer's id.
//!
//! Threads: one accept loop plus one thread per viewer that owns the socket.
//! `broadcast` and `send_to` only queue frames for those threads, so the
//! frame loop never waits on a socket.

mod connection;

use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::events::{BridgeEvent, EventSink};
use crate::queue::{InboundMessage, InboundQueue, Origin};
use crate::store::RecommendationStore;

use connection::ReadOutcome;

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 7778;

const ACCEPT_IDLE: Duration = Duration::from_millis(50);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(200);
const SHUTDOWN_REASON: &str = "Server shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Something a payload can be pushed to.
pub trait ViewerConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Hand over one whole text frame for delivery. Fails once the
    /// connection can no longer deliver anything.
    fn send_text(&self, payload: &str) -> Result<()>;

    /// Send a "going away" close notification and release the transport.
    fn close(&self, reason: &str) -> Result<()>;
}

/// Result of one fan-out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: Vec<ConnectionId>,
}

/// Live viewer connections, keyed by id.
///
/// Fan-out iterates a copy of the membership taken under the lock, so
/// writers never hold the set lock and accept/close on other threads never
/// wait behind a slow viewer.
#[derive(Clone, Default)]
pub struct ConnectionSet {
    members: Arc<Mutex<BTreeMap<ConnectionId, Arc<dyn ViewerConnection>>>>,
}

impl fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSet")
            .field("ids", &self.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConnectionSet {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Arc<dyn ViewerConnection>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, connection: Arc<dyn ViewerConnection>) -> usize {
        let mut members = self.lock();
        members.insert(connection.id(), connection);
        members.len()
    }

    pub fn remove(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ViewerConnection>> {
        self.lock().values().cloned().collect()
    }

    /// Write `payload` to every member; drop the ones that fail.
    pub fn broadcast(&self, payload: &str) -> FanOut {
        let mut fan_out = FanOut::default();
        for connection in self.snapshot() {
            match connection.send_text(payload) {
                Ok(()) => fan_out.delivered += 1,
                Err(e) => {
                    warn!(viewer = %connection.id(), "failed to send to viewer, dropping it: {e:#}");
                    if self.remove(connection.id()) {
                        fan_out.dropped.push(connection.id());
                    }
                }
            }
        }
        fan_out
    }

    /// Write `payload` to one member. A failed write drops it.
    pub fn send_to(&self, id: ConnectionId, payload: &str) -> bool {
        let Some(connection) = self.lock().get(&id).cloned() else {
            return false;
        };
        match connection.send_text(payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(viewer = %id, "failed to send to viewer, dropping it: {e:#}");
                self.remove(id);
                false
            }
        }
    }

    /// Close every member, then empty the set even if some closes failed.
    pub fn close_all(&self, reason: &str) {
        for connection in self.snapshot() {
            if let Err(e) = connection.close(reason) {
                warn!(viewer = %connection.id(), "error closing viewer connection: {e:#}");
            }
        }
        self.lock().clear();
    }
}

/// State shared between the server handle and its threads.
struct Shared {
    running: AtomicBool,
    next_id: AtomicU64,
    connections: ConnectionSet,
    inbound: InboundQueue,
    store: Arc<RecommendationStore>,
    events: EventSink,
}

pub struct BroadcastServer {
    host: String,
    shared: Arc<Shared>,
    listener: Option<Arc<TcpListener>>,
    local_addr: Option<SocketAddr>,
    accept_thread: Option<JoinHandle<()>>,
}

impl BroadcastServer {
    pub fn new(
        host: impl Into<String>,
        inbound: InboundQueue,
        store: Arc<RecommendationStore>,
        events: EventSink,
    ) -> Self {
        Self {
            host: host.into(),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                connections: ConnectionSet::default(),
                inbound,
                store,
                events,
            }),
            listener: None,
            local_addr: None,
            accept_thread: None,
        }
    }

    /// Bind and start accepting viewers. Port 0 picks a free port (see
    /// [`local_addr`](Self::local_addr)).
    pub fn start(&mut self, port: u16) -> bool {
        if self.is_running() {
            info!("broadcast server already running");
            return true;
        }

        let listener = match TcpListener::bind((self.host.as_str(), port)) {
            Ok(listener) => listener,
            Err(e) => {
                error!(host = %self.host, port, "failed to start broadcast server: {e}");
                return false;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            error!("failed to make broadcast listener non-blocking: {e}");
            return false;
        }
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("failed to read broadcast listener address: {e}");
                return false;
            }
        };

        let listener = Arc::new(listener);
        self.shared.running.store(true, Ordering::SeqCst);
        let spawned = {
            let listener = Arc::clone(&listener);
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("viewer-accept".to_string())
                .spawn(move || accept_loop(&listener, &shared))
        };
        let accept_thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                error!("failed to spawn viewer accept thread: {e}");
                return false;
            }
        };

        info!(addr = %local_addr, "broadcast server started");
        self.shared.events.emit(BridgeEvent::ServerStarted {
            addr: local_addr.to_string(),
        });
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        self.accept_thread = Some(accept_thread);
        true
    }

    /// Close every viewer with a "going away" frame, then the listener.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shared.connections.close_all(SHUTDOWN_REASON);
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                warn!("viewer accept thread panicked");
            }
        }
        self.listener = None;
        self.local_addr = None;

        info!("broadcast server stopped");
        self.shared.events.emit(BridgeEvent::ServerStopped);
    }

    /// Push `payload` to every connected viewer. No-op while stopped.
    pub fn broadcast(&self, payload: &str) {
        if !self.is_running() {
            return;
        }
        let fan_out = self.shared.connections.broadcast(payload);
        debug!(
            delivered = fan_out.delivered,
            dropped = fan_out.dropped.len(),
            "broadcast to viewers"
        );
        for id in fan_out.dropped {
            self.shared.events.emit(BridgeEvent::ViewerDropped {
                id,
                reason: "write failed".to_string(),
            });
        }
    }

    /// Push `payload` to one viewer.
    pub fn send_to(&self, id: ConnectionId, payload: &str) -> bool {
        if !self.is_running() {
            return false;
        }
        let sent = self.shared.connections.send_to(id, payload);
        if !sent && !self.shared.connections.contains(id) {
            debug!(viewer = %id, "reply target is gone");
        }
        sent
    }

    pub fn client_count(&self) -> usize {
        if self.is_running() {
            self.shared.connections.len()
        } else {
            0
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &TcpListener, shared: &Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let id = ConnectionId(shared.next_id.fetch_add(1, Ordering::SeqCst));
                let worker = Arc::clone(shared);
                let spawned = thread::Builder::new()
                    .name(format!("{id}"))
                    .spawn(move || serve_viewer(stream, peer, id, &worker));
                if let Err(e) = spawned {
                    error!(%peer, "failed to spawn viewer thread: {e}");
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
            }
            Err(e) => {
                error!("error accepting viewer: {e}");
                thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
        }
    }
    debug!("viewer accept loop stopped");
}

fn serve_viewer(stream: TcpStream, peer: SocketAddr, id: ConnectionId, shared: &Shared) {
    let (connection, mut socket) = match connection::accept(id, stream, peer) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%peer, "viewer handshake failed: {e:#}");
            return;
        }
    };

    // Queued before joining the set, so it goes out ahead of any broadcast.
    if let Some(snapshot) = shared.store.get() {
        let _ = connection.send_text(&snapshot.payload());
    }

    let total = shared.connections.insert(Arc::new(connection));
    // stop() may have emptied the set between the handshake and the insert.
    if !shared.running.load(Ordering::SeqCst) {
        shared.connections.remove(id);
        socket.close(SHUTDOWN_REASON);
        return;
    }
    info!(viewer = %id, %peer, total, "viewer connected");
    shared.events.emit(BridgeEvent::ViewerConnected {
        id,
        peer: peer.to_string(),
    });

    let reason = loop {
        if let Some(reason) = socket.flush_outgoing() {
            break reason;
        }
        match socket.read_next() {
            ReadOutcome::Text(text) => {
                debug!(viewer = %id, "received viewer message: {text}");
                shared
                    .inbound
                    .push(InboundMessage::new(Origin::Viewer(id), text));
            }
            ReadOutcome::Idle | ReadOutcome::Ignored => {}
            ReadOutcome::Closed(reason) => break reason,
        }
    };

    if shared.connections.remove(id) {
        info!(viewer = %id, reason = %reason, total = shared.connections.len(), "viewer disconnected");
        shared.events.emit(BridgeEvent::ViewerDropped { id, reason });
    }
}
