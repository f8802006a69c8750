//! One live document: replica, awareness and attached connections.
//!
//! Architecture:
//! ```text
//! transport task ──┐                       ┌──► Outbound (conn A)
//! transport task ──┼── Command queue ──► DocumentSession ──┼──► Outbound (conn B)
//! sweep timer    ──┘   (bounded mpsc)      │               └──► Outbound (conn C)
//!                                          ├── ReplicaHandle
//!                                          ├── AwarenessTracker
//!                                          └── PersistenceStore::append
//! ```
//!
//! Each session is owned by a single task that drains its command queue in
//! order, so frames from different connections never interleave. The task
//! never awaits network I/O: outbound frames are queued with `try_send` and
//! a rejected send detaches that connection.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::awareness::{AwarenessChange, AwarenessTracker};
use crate::connection::{ConnectionId, ConnectionManager, Outbound, SyncState};
use crate::error::RelayError;
use crate::protocol::{AwarenessUpdate, Frame, SyncMessage};
use crate::registry::DocumentRegistry;
use crate::replica::{ApplyError, ReplicaHandle};
use crate::stats::RelayStats;
use crate::storage::{PersistenceStore, StoreError};

/// Names a document. Derived from the transport path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `/notes/today?token=x` → `notes/today`. `None` when nothing remains.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let id = path.split('?').next().unwrap_or_default();
        if id.is_empty() {
            None
        } else {
            Some(Self(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Commands buffered per session before senders wait
    pub queue_capacity: usize,
    /// Fold the stored update log into one snapshot when the session closes
    pub compact_on_close: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            compact_on_close: true,
        }
    }
}

/// The state behind one document id.
pub struct DocumentSession {
    doc_id: DocumentId,
    replica: Box<dyn ReplicaHandle>,
    awareness: AwarenessTracker,
    connections: ConnectionManager,
    store: Arc<dyn PersistenceStore>,
    stats: Arc<RelayStats>,
    /// Something was appended to the store during this session.
    dirty: bool,
}

impl DocumentSession {
    pub fn new(
        doc_id: DocumentId,
        replica: Box<dyn ReplicaHandle>,
        store: Arc<dyn PersistenceStore>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            doc_id,
            replica,
            awareness: AwarenessTracker::new(),
            connections: ConnectionManager::new(),
            store,
            stats,
            dirty: false,
        }
    }

    /// Apply stored updates in storage order.
    pub fn replay(&mut self, updates: &[Vec<u8>]) -> Result<(), ApplyError> {
        for update in updates {
            self.replica.apply_update(update)?;
        }
        log::debug!("Replayed {} stored updates into {}", updates.len(), self.doc_id);
        Ok(())
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn full_state(&self) -> Vec<u8> {
        self.replica.full_state()
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Attach a connection and start its handshake: SyncStep1 with our
    /// state vector, then the current awareness snapshot.
    pub fn attach(&mut self, conn: ConnectionId, outbound: Outbound) -> Result<(), RelayError> {
        if !self.connections.attach(conn, outbound) {
            log::debug!("Connection {conn} already attached to {}", self.doc_id);
            return Ok(());
        }

        let step1 = Frame::sync_step1(self.replica.state_vector()).encode();
        let awareness = Frame::awareness(self.awareness.snapshot()).encode();
        for frame in [step1, awareness] {
            if let Err(e) = self.connections.send(conn, Arc::new(frame)) {
                self.drop_connection(conn);
                return Err(RelayError::TransportSend(conn, e));
            }
        }

        if let Some(c) = self.connections.get_mut(conn) {
            c.state = SyncState::Handshaking;
        }
        log::info!(
            "Connection {conn} joined {} ({} attached)",
            self.doc_id,
            self.connections.len()
        );
        Ok(())
    }

    /// Detach a connection and retract the awareness clients it controlled.
    pub fn detach(&mut self, conn: ConnectionId) {
        if self.drop_connection(conn) {
            log::info!(
                "Connection {conn} left {} ({} attached)",
                self.doc_id,
                self.connections.len()
            );
        }
    }

    /// Decode and dispatch one inbound frame. A frame that cannot be
    /// decoded or applied closes its connection and nothing else.
    pub fn handle_frame(&mut self, conn: ConnectionId, bytes: &[u8]) {
        if !self.connections.contains(conn) {
            log::debug!("Dropping frame from detached connection {conn}");
            return;
        }

        let result = Frame::decode(bytes)
            .map_err(RelayError::from)
            .and_then(|frame| self.dispatch(conn, frame));

        if let Err(e) = result {
            if matches!(e, RelayError::Protocol(_) | RelayError::Apply(_)) {
                self.stats.protocol_error();
            }
            log::warn!("Closing connection {conn} on {}: {e}", self.doc_id);
            self.detach(conn);
        }
    }

    fn dispatch(&mut self, conn: ConnectionId, frame: Frame) -> Result<(), RelayError> {
        match frame {
            Frame::Sync(msg) => {
                log::trace!("{} from {conn} on {}", msg.name(), self.doc_id);
                self.handle_sync(conn, msg)
            }
            Frame::Awareness(update) => {
                self.handle_awareness(conn, &update);
                Ok(())
            }
        }
    }

    fn handle_sync(&mut self, conn: ConnectionId, msg: SyncMessage) -> Result<(), RelayError> {
        match msg {
            SyncMessage::SyncStep1(state_vector) => {
                let diff = self.replica.diff(&state_vector)?;
                if !diff.is_empty() {
                    self.connections
                        .send(conn, Arc::new(Frame::sync_step2(diff).encode()))
                        .map_err(|e| RelayError::TransportSend(conn, e))?;
                }
                self.mark_synced(conn);
                Ok(())
            }
            SyncMessage::SyncStep2(update) => {
                self.apply_update(conn, update)?;
                self.mark_synced(conn);
                Ok(())
            }
            SyncMessage::Update(update) => self.apply_update(conn, update),
        }
    }

    /// Merge, persist what integrated, then relay it to siblings.
    fn apply_update(&mut self, origin: ConnectionId, update: Vec<u8>) -> Result<(), RelayError> {
        let integrated = if update.is_empty() {
            None
        } else {
            self.replica.apply_update(&update)?
        };
        let Some(update) = integrated else {
            log::trace!("Update from {origin} on {} had no effect", self.doc_id);
            return Ok(());
        };

        // Append precedes fan-out. With `sync_writes` off this is a memtable
        // and WAL write, not an fsync.
        match self.store.append(&self.doc_id, &update) {
            Ok(seq) => {
                self.dirty = true;
                self.stats.update_persisted();
                log::trace!("Persisted update #{seq} for {}", self.doc_id);
            }
            Err(e) => {
                self.stats.persistence_failed();
                log::error!("Failed to persist update for {}: {e}", self.doc_id);
            }
        }

        self.fanout(Frame::update(update).encode(), Some(origin));
        Ok(())
    }

    fn handle_awareness(&mut self, origin: ConnectionId, update: &AwarenessUpdate) {
        let change = self.awareness.apply_delta(update, Instant::now());
        if change.is_empty() {
            return;
        }

        if let Some(conn) = self.connections.get_mut(origin) {
            for entry in &change.applied {
                if entry.is_removal() {
                    conn.controlled.remove(&entry.client_id);
                } else {
                    conn.controlled.insert(entry.client_id);
                }
            }
        }

        self.fanout(Frame::awareness(change.to_update()).encode(), Some(origin));
    }

    /// Remove awareness clients not heard from within `timeout`.
    pub fn expire_awareness(&mut self, timeout: Duration, now: Instant) -> usize {
        let change = self.awareness.expire_stale(timeout, now);
        for client in &change.removed {
            self.connections.release_client(*client);
        }
        let removed = change.removed.len();
        self.broadcast_removals(change);
        removed
    }

    /// Close every connection, e.g. on shutdown.
    pub fn close_all(&mut self) {
        let closed = self.connections.detach_all();
        if !closed.is_empty() {
            log::info!("Closed {} connections on {}", closed.len(), self.doc_id);
        }
    }

    /// Fold the stored log into one snapshot if this session wrote anything.
    /// The store write runs on the blocking pool.
    pub async fn compact(&mut self) -> Result<bool, StoreError> {
        if !self.dirty {
            return Ok(false);
        }
        let store = self.store.clone();
        let doc_id = self.doc_id.clone();
        let snapshot = self.replica.full_state();
        tokio::task::spawn_blocking(move || store.compact(&doc_id, &snapshot))
            .await
            .map_err(|e| StoreError::Unavailable(format!("compaction task failed: {e}")))??;
        self.dirty = false;
        Ok(true)
    }

    fn mark_synced(&mut self, conn: ConnectionId) {
        if let Some(c) = self.connections.get_mut(conn) {
            if c.state != SyncState::Synced {
                c.state = SyncState::Synced;
                log::debug!("Connection {conn} synced on {}", self.doc_id);
            }
        }
    }

    /// Queue a frame for every connection except `exclude`, then detach
    /// whichever connections rejected it.
    fn fanout(&mut self, frame: Vec<u8>, exclude: Option<ConnectionId>) {
        let frame = Arc::new(frame);
        let sent_before = self.connections.stats().frames_sent;
        let failed = self.connections.broadcast(&frame, exclude);
        self.stats
            .frames_fanned_out(self.connections.stats().frames_sent - sent_before);

        for conn in failed {
            self.stats.connection_dropped();
            self.detach(conn);
        }
    }

    /// Detach and broadcast removals for the clients the connection controlled.
    /// Returns `false` if the connection was not attached.
    fn drop_connection(&mut self, conn: ConnectionId) -> bool {
        let Some(closed) = self.connections.detach(conn) else {
            return false;
        };
        let change = self
            .awareness
            .remove_clients(closed.controlled.iter().copied(), Instant::now());
        self.broadcast_removals(change);
        true
    }

    fn broadcast_removals(&mut self, change: AwarenessChange) {
        if change.is_empty() || self.connections.is_empty() {
            return;
        }
        self.fanout(Frame::awareness(change.to_update()).encode(), None);
    }
}

// ─── Actor ────────────────────────────────────────────────────────────

pub(crate) enum Command {
    Attach {
        conn: ConnectionId,
        outbound: Outbound,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Frame {
        conn: ConnectionId,
        bytes: Vec<u8>,
    },
    Detach {
        conn: ConnectionId,
    },
    ExpireAwareness {
        timeout: Duration,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable address of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    doc_id: DocumentId,
    generation: u64,
    commands: mpsc::Sender<Command>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Attach { conn, .. } => write!(f, "Attach({conn})"),
            Command::Frame { conn, bytes } => write!(f, "Frame({conn}, {} bytes)", bytes.len()),
            Command::Detach { conn } => write!(f, "Detach({conn})"),
            Command::ExpireAwareness { timeout } => write!(f, "ExpireAwareness({timeout:?})"),
            Command::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl SessionHandle {
    pub(crate) fn new(doc_id: DocumentId, generation: u64, commands: mpsc::Sender<Command>) -> Self {
        Self {
            doc_id,
            generation,
            commands,
        }
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    /// Distinguishes successive sessions for the same document id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Attach a connection. Fails with [`RelayError::SessionClosed`] if the
    /// session shut down first; callers reopen and retry.
    pub async fn attach(&self, conn: ConnectionId, outbound: Outbound) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Attach {
            conn,
            outbound,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Queue an inbound frame. Waits while the session queue is full.
    pub async fn frame(&self, conn: ConnectionId, bytes: Vec<u8>) -> Result<(), RelayError> {
        self.send(Command::Frame { conn, bytes }).await
    }

    pub async fn detach(&self, conn: ConnectionId) {
        // A closed session has already dropped the connection.
        let _ = self.send(Command::Detach { conn }).await;
    }

    pub async fn expire_awareness(&self, timeout: Duration) -> Result<(), RelayError> {
        self.send(Command::ExpireAwareness { timeout }).await
    }

    /// Close every connection and stop the session.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: Command) -> Result<(), RelayError> {
        self.commands.send(command).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> RelayError {
        RelayError::SessionClosed(self.doc_id.clone())
    }
}

/// Everything a session task needs besides its queue.
pub(crate) struct SessionContext {
    pub doc_id: DocumentId,
    pub generation: u64,
    pub registry: DocumentRegistry,
}

/// Body of a session task: replay, serve commands until the last
/// connection leaves, then unregister.
pub(crate) async fn run(ctx: SessionContext, mut commands: mpsc::Receiver<Command>) {
    let SessionContext {
        doc_id,
        generation,
        registry,
    } = ctx;

    let mut session = match load(&doc_id, &registry).await {
        Ok(session) => session,
        Err(e) => {
            log::error!("Failed to open document {doc_id}: {e}");
            registry.close(&doc_id, generation).await;
            commands.close();
            while let Some(command) = commands.recv().await {
                if let Command::Attach { reply, .. } = command {
                    let _ = reply.send(Err(RelayError::Persistence(e.clone())));
                }
            }
            return;
        }
    };
    registry.stats().session_opened();
    log::info!("Opened session for {doc_id} (generation {generation})");

    let mut shutdown_reply = None;
    while let Some(command) = commands.recv().await {
        let mut may_close = true;
        match command {
            Command::Attach {
                conn,
                outbound,
                reply,
            } => {
                let _ = reply.send(session.attach(conn, outbound));
            }
            Command::Frame { conn, bytes } => session.handle_frame(conn, &bytes),
            Command::Detach { conn } => session.detach(conn),
            Command::ExpireAwareness { timeout } => {
                let expired = session.expire_awareness(timeout, Instant::now());
                if expired > 0 {
                    log::debug!("Expired {expired} awareness clients on {doc_id}");
                }
                may_close = false;
            }
            Command::Shutdown { reply } => {
                session.close_all();
                shutdown_reply = Some(reply);
                break;
            }
        }
        if may_close && session.connection_count() == 0 {
            break;
        }
    }

    finish(&mut session, registry.config().compact_on_close).await;
    registry.close(&doc_id, generation).await;
    registry.stats().session_closed();

    // Anything that raced the close gets turned away; attaches retry on a
    // fresh session.
    commands.close();
    while let Some(command) = commands.recv().await {
        match command {
            Command::Attach { reply, .. } => {
                let _ = reply.send(Err(RelayError::SessionClosed(doc_id.clone())));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
            Command::Frame { .. } | Command::Detach { .. } | Command::ExpireAwareness { .. } => {}
        }
    }

    log::info!("Closed session for {doc_id} (generation {generation})");
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

/// Build the session and replay its stored updates off the async runtime.
async fn load(doc_id: &DocumentId, registry: &DocumentRegistry) -> Result<DocumentSession, StoreError> {
    let store = registry.store().clone();
    let id = doc_id.clone();
    let updates = tokio::task::spawn_blocking(move || store.load(&id))
        .await
        .map_err(|e| StoreError::Unavailable(format!("load task failed: {e}")))??;

    let replica = (registry.replicas())()
        .map_err(|e| StoreError::Unavailable(format!("replica unavailable: {e}")))?;
    let mut session = DocumentSession::new(
        doc_id.clone(),
        replica,
        registry.store().clone(),
        registry.stats().clone(),
    );
    session
        .replay(&updates)
        .map_err(|e| StoreError::DeserializationError(format!("stored update rejected: {e}")))?;
    Ok(session)
}

async fn finish(session: &mut DocumentSession, compact: bool) {
    if !compact {
        return;
    }
    match session.compact().await {
        Ok(true) => log::debug!("Compacted {} on close", session.doc_id()),
        Ok(false) => {}
        Err(e) => log::error!("Failed to compact {} on close: {e}", session.doc_id()),
    }
}
