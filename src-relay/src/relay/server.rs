//! Relay server: accepts extension connections and fans state out to them.
//!
//! Every accepted socket gets a read loop, a writer task draining an ordered
//! outbound queue, and a best-effort peer lookup. The registry of live
//! connections is only touched under `registry`'s guard, and that guard is
//! never held while writing to a socket.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::authority::Authorities;
use super::endpoint::{self, LISTEN_BACKLOG};
use super::error::RelayError;
use super::framing::{framed_socket, FrameReader, FrameWriter};
use super::peer::{self, PeerIdentity, PeerResolver};
use super::protocol::{RelayMessage, RelayRequest};
use super::router::{self, Outbound, RequestContext};

/// Identifier of a live connection: its socket descriptor
pub type ConnectionId = RawFd;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Messages a connection may have queued before it counts as stalled
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Pause after a failed accept so fd exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle notifications for the owning process
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected {
        id: ConnectionId,
        label: String,
    },
    PeerResolved {
        id: ConnectionId,
        label: String,
        peer: PeerIdentity,
    },
    /// The connection's read loop ended; anything tied to this peer may lapse
    Disconnected {
        id: ConnectionId,
        label: String,
        peer: Option<PeerIdentity>,
    },
}

/// One accepted endpoint
pub struct Connection {
    id: ConnectionId,
    label: String,
    peer: Mutex<Option<PeerIdentity>>,
    alive: AtomicBool,
    outbound: mpsc::Sender<RelayMessage>,
    writer: Arc<FrameWriter<OwnedWriteHalf>>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn peer(&self) -> Option<PeerIdentity> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.writer.must_close()
    }

    /// Queue a message; delivery order per connection is queue order.
    ///
    /// A peer that lets its queue fill up is not reading; it is torn down
    /// rather than buffered for.
    fn send(&self, msg: RelayMessage) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    connection = %self.label,
                    queued = OUTBOUND_QUEUE_CAPACITY,
                    "Peer stopped reading, dropping connection"
                );
                self.abort();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Wake the read loop with EOF; queued writes still drain
    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.writer.shutdown_read();
    }

    /// Drop queued writes and close both directions
    fn abort(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.writer.abort();
    }
}

enum ServerState {
    Stopped,
    Listening {
        shutdown: watch::Sender<bool>,
        accept_task: JoinHandle<()>,
    },
}

struct Inner {
    socket_path: PathBuf,
    authorities: Authorities,
    resolver: PeerResolver,
    state: Mutex<ServerState>,
    registry: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    /// Held from building a session snapshot until it is queued everywhere,
    /// so queues never receive snapshots out of order
    session_order: Mutex<()>,
    next_label: AtomicU64,
    events: broadcast::Sender<RelayEvent>,
}

/// Cloneable handle to the relay server
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<Inner>,
}

impl RelayServer {
    pub fn new(socket_path: impl Into<PathBuf>, authorities: Authorities) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                socket_path: socket_path.into(),
                authorities,
                resolver: PeerResolver::new(),
                state: Mutex::new(ServerState::Stopped),
                registry: Mutex::new(HashMap::new()),
                session_order: Mutex::new(()),
                next_label: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }

    pub fn authorities(&self) -> &Authorities {
        &self.inner.authorities
    }

    pub fn is_listening(&self) -> bool {
        matches!(*self.inner.lock_state(), ServerState::Listening { .. })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connection_count()
    }

    /// Labels of every registered connection, sorted
    pub fn connection_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .inner
            .lock_registry()
            .values()
            .map(|c| c.label.clone())
            .collect();
        labels.sort();
        labels
    }

    /// Clean up a stale endpoint, bind, and start accepting.
    ///
    /// Must be called from within a tokio runtime. On error the server stays
    /// stopped; nothing is retried.
    pub async fn start(&self) -> Result<(), RelayError> {
        let mut state = self.inner.lock_state();
        if let ServerState::Listening { .. } = *state {
            return Err(RelayError::AlreadyListening);
        }

        endpoint::clear_stale(&self.inner.socket_path)?;
        let listener = endpoint::bind(&self.inner.socket_path, LISTEN_BACKLOG)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.spawn_sync_forwarders(&shutdown_rx);
        let accept_task = tokio::spawn(Inner::accept_loop(
            Arc::clone(&self.inner),
            listener,
            shutdown_rx,
        ));

        *state = ServerState::Listening {
            shutdown,
            accept_task,
        };
        Ok(())
    }

    /// Stop accepting, wake every read loop, and remove the endpoint
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.inner.lock_state(), ServerState::Stopped);
        let ServerState::Listening {
            shutdown,
            accept_task,
        } = previous
        else {
            return;
        };

        let _ = shutdown.send(true);
        if let Err(e) = accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        let connections: Vec<Arc<Connection>> = self
            .inner
            .lock_registry()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in &connections {
            conn.close();
        }

        if let Err(e) = std::fs::remove_file(&self.inner.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove relay socket {}: {}",
                    self.inner.socket_path.display(),
                    e
                );
            }
        }

        info!(closed = connections.len(), "Relay stopped");
    }

    /// Send `msg` to every registered connection; returns how many accepted it
    pub fn broadcast(&self, msg: RelayMessage) -> usize {
        self.inner.broadcast(msg)
    }

    /// Push the current canonical sessions to everyone
    pub fn publish_sessions(&self) -> usize {
        let _order = self.inner.lock_session_order();
        self.inner
            .broadcast(router::session_sync(&self.inner.authorities, None, false))
    }

    /// Relay a settings payload from another subsystem, keys untouched
    pub fn broadcast_settings(&self, payload: Map<String, Value>) -> usize {
        self.inner.broadcast(RelayMessage::SettingsSync { payload })
    }

    /// Rebroadcast authority change notifications until shutdown
    fn spawn_sync_forwarders(&self, shutdown: &watch::Receiver<bool>) {
        let mut schedule_rx = self.inner.authorities.schedule.subscribe();
        let mut shutdown_rx = shutdown.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = schedule_rx.recv() => match result {
                        Ok(schedule) => {
                            debug!(state = %schedule.state, "schedule changed, rebroadcasting");
                            inner.broadcast(RelayMessage::ScheduleSync { schedule });
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            // Missed intermediate snapshots; the latest is all that matters
                            inner.broadcast(router::schedule_sync(&inner.authorities));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        let mut session_rx = self.inner.authorities.sessions.subscribe();
        let mut shutdown_rx = shutdown.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = session_rx.recv() => match result {
                        Ok(category) => {
                            let _order = inner.lock_session_order();
                            let auth = &inner.authorities;
                            inner.broadcast(router::session_sync(auth, Some(&category), false));
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            let _order = inner.lock_session_order();
                            inner.broadcast(router::session_sync(&inner.authorities, None, false));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_session_order(&self) -> std::sync::MutexGuard<'_, ()> {
        self.session_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connection_count(&self) -> usize {
        self.lock_registry().len()
    }

    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn broadcast(&self, msg: RelayMessage) -> usize {
        let targets: Vec<Arc<Connection>> = self.lock_registry().values().cloned().collect();

        targets
            .iter()
            .filter(|conn| conn.send(msg.clone()))
            .count()
    }

    async fn accept_loop(
        inner: Arc<Inner>,
        listener: UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => Inner::admit(&inner, stream),
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Accept loop exiting");
    }

    /// Register a freshly accepted stream and start its tasks
    fn admit(inner: &Arc<Inner>, stream: UnixStream) {
        let n = inner.next_label.fetch_add(1, Ordering::SeqCst) + 1;
        let label = format!("conn-{}", n);

        let peer_pid = peer::peer_pid(&stream);
        let (reader, writer, fd) = framed_socket(stream, label.clone());
        let writer = Arc::new(writer);
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        let conn = Arc::new(Connection {
            id: fd,
            label: label.clone(),
            peer: Mutex::new(None),
            alive: AtomicBool::new(true),
            outbound,
            writer: Arc::clone(&writer),
        });

        inner.lock_registry().insert(fd, Arc::clone(&conn));
        info!(connection = %label, fd, "Extension connected");
        inner.emit(RelayEvent::Connected {
            id: fd,
            label: label.clone(),
        });

        tokio::spawn(drain_outbound(Arc::clone(&writer), queue));
        tokio::spawn(Inner::resolve_peer(Arc::clone(inner), Arc::clone(&conn), peer_pid));
        tokio::spawn(Inner::read_loop(Arc::clone(inner), conn, reader));
    }

    async fn resolve_peer(inner: Arc<Inner>, conn: Arc<Connection>, peer_pid: Option<u32>) {
        let Some(pid) = peer_pid else {
            debug!(connection = %conn.label, "Peer credentials unavailable");
            return;
        };
        let resolver = inner.resolver.clone();
        let resolved = tokio::task::spawn_blocking(move || resolver.resolve_pid(pid)).await;

        match resolved {
            Ok(Some(peer)) => {
                info!(connection = %conn.label, app = %peer.name, pid = peer.pid, "Peer resolved");
                *conn.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer.clone());
                inner.emit(RelayEvent::PeerResolved {
                    id: conn.id,
                    label: conn.label.clone(),
                    peer,
                });
            }
            Ok(None) => debug!(connection = %conn.label, "Peer application unknown"),
            Err(e) => warn!(connection = %conn.label, "Peer lookup task failed: {}", e),
        }
    }

    async fn read_loop(
        inner: Arc<Inner>,
        conn: Arc<Connection>,
        mut reader: FrameReader<OwnedReadHalf>,
    ) {
        while let Some(request) = reader.read_message::<RelayRequest>().await {
            let ctx = RequestContext {
                label: conn.label.clone(),
                peer: conn.peer(),
                connections: inner.connection_count(),
            };

            // Queueing never blocks, so the order guard is never held across an await
            let _order = inner.lock_session_order();
            for out in router::route(&inner.authorities, &ctx, request) {
                match out {
                    Outbound::Reply(msg) => {
                        conn.send(msg);
                    }
                    Outbound::Broadcast(msg) => {
                        inner.broadcast(msg);
                    }
                }
            }
        }

        inner.remove(&conn);
        inner.authorities.usage.forget(&conn.label);
        info!(connection = %conn.label, "Extension disconnected");
        inner.emit(RelayEvent::Disconnected {
            id: conn.id,
            label: conn.label.clone(),
            peer: conn.peer(),
        });
    }

    fn remove(&self, conn: &Arc<Connection>) {
        conn.alive.store(false, Ordering::SeqCst);
        let mut registry = self.lock_registry();
        if registry
            .get(&conn.id)
            .map(|existing| Arc::ptr_eq(existing, conn))
            .unwrap_or(false)
        {
            registry.remove(&conn.id);
        }
    }
}

/// Write queued messages in order until the queue closes or a write fails
async fn drain_outbound(
    writer: Arc<FrameWriter<OwnedWriteHalf>>,
    mut queue: mpsc::Receiver<RelayMessage>,
) {
    while let Some(msg) = queue.recv().await {
        match writer.write_frame(&msg).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                debug!(
                    connection = %writer.label(),
                    "Dropping connection after write failure: {}", e
                );
                // Let the read loop observe EOF and unregister
                writer.shutdown_read();
                break;
            }
            Err(e) => {
                error!(connection = %writer.label(), "Skipping reply: {}", e);
            }
        }
    }
}
