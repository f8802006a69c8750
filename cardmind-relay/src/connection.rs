//! Fan-out of encoded frames to the connections attached to one document.
//!
//! Every connection owns a bounded outbound queue drained by its transport
//! task. Sends never block the session: a full or closed queue is reported
//! back as a failed connection so the caller can detach it. One slow peer can
//! therefore never stall delivery to its siblings.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one transport connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Encoded frames shared across every recipient of a fan-out.
pub type OutboundFrame = Arc<Vec<u8>>;

/// Sending half of a connection's outbound queue.
pub type Outbound = mpsc::Sender<OutboundFrame>;

/// Where a connection stands in the sync handshake.
///
/// ```text
/// Connected ──attach──► Handshaking ──step2 in / step1 answered──► Synced
///     │                      │                                      │
///     └──────────────────────┴────────────── detach ────────────────┴──► Closed
/// ```
///
/// Frames are accepted in every state except `Closed`; the state only
/// informs logging and inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Connected,
    Handshaking,
    Synced,
    Closed,
}

/// Why a frame could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
    #[error("connection not attached")]
    Unknown,
}

/// One attached transport connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub state: SyncState,
    /// Awareness client ids this connection has published.
    pub controlled: HashSet<u64>,
    sender: Outbound,
}

impl Connection {
    fn new(id: ConnectionId, sender: Outbound) -> Self {
        Self {
            id,
            state: SyncState::Connected,
            controlled: HashSet::new(),
            sender,
        }
    }

    fn try_send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub frames_sent: u64,
    pub send_failures: u64,
    pub active_connections: usize,
}

/// The set of connections attached to a document session.
///
/// Owned by the session task, so no locking is needed.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: HashMap<ConnectionId, Connection>,
    frames_sent: u64,
    send_failures: u64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns `false` if the id is already attached.
    pub fn attach(&mut self, id: ConnectionId, sender: Outbound) -> bool {
        if self.connections.contains_key(&id) {
            return false;
        }
        self.connections.insert(id, Connection::new(id, sender));
        true
    }

    /// Unregister a connection. Dropping the returned value closes its queue.
    pub fn detach(&mut self, id: ConnectionId) -> Option<Connection> {
        let mut conn = self.connections.remove(&id)?;
        conn.state = SyncState::Closed;
        Some(conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Queue a frame for a single connection.
    pub fn send(&mut self, id: ConnectionId, frame: OutboundFrame) -> Result<(), SendError> {
        let conn = self.connections.get(&id).ok_or(SendError::Unknown)?;
        match conn.try_send(frame) {
            Ok(()) => {
                self.frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.send_failures += 1;
                Err(e)
            }
        }
    }

    /// Queue a frame for every connection except `exclude`.
    ///
    /// Returns the connections whose queue rejected the frame. They stay
    /// attached; detaching them is the caller's job.
    pub fn broadcast(
        &mut self,
        frame: &OutboundFrame,
        exclude: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let mut failed = Vec::new();
        for (id, conn) in &self.connections {
            if Some(*id) == exclude {
                continue;
            }
            match conn.try_send(frame.clone()) {
                Ok(()) => self.frames_sent += 1,
                Err(e) => {
                    log::warn!("Fan-out to {id} failed: {e}");
                    self.send_failures += 1;
                    failed.push(*id);
                }
            }
        }
        failed
    }

    /// Forget `client_id` on every connection that claimed it.
    pub fn release_client(&mut self, client_id: u64) {
        for conn in self.connections.values_mut() {
            conn.controlled.remove(&client_id);
        }
    }

    /// Drain every connection, e.g. on shutdown.
    pub fn detach_all(&mut self) -> Vec<Connection> {
        self.connections
            .drain()
            .map(|(_, mut conn)| {
                conn.state = SyncState::Closed;
                conn
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            frames_sent: self.frames_sent,
            send_failures: self.send_failures,
            active_connections: self.connections.len(),
        }
    }
}
