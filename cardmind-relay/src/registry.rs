//! Document registry: maps document ids to live session tasks.
//!
//! The registry lock is held only for the check-and-insert. Replaying the
//! stored log happens inside the new session task, and frames that arrive
//! meanwhile wait in its queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, Mutex};

use crate::connection::{ConnectionId, Outbound};
use crate::error::RelayError;
use crate::replica::{yrs_factory, ReplicaFactory};
use crate::session::{self, DocumentId, SessionConfig, SessionContext, SessionHandle};
use crate::stats::RelayStats;
use crate::storage::PersistenceStore;

struct RegistryInner {
    sessions: Mutex<HashMap<DocumentId, SessionHandle>>,
    store: Arc<dyn PersistenceStore>,
    replicas: ReplicaFactory,
    stats: Arc<RelayStats>,
    config: SessionConfig,
    next_generation: AtomicU64,
}

/// Creates, finds and retires [`SessionHandle`]s. Cheap to clone.
#[derive(Clone)]
pub struct DocumentRegistry {
    inner: Arc<RegistryInner>,
}

impl DocumentRegistry {
    /// Registry whose sessions hold Yrs replicas.
    pub fn new(store: Arc<dyn PersistenceStore>, stats: Arc<RelayStats>, config: SessionConfig) -> Self {
        Self::with_replicas(store, stats, config, yrs_factory())
    }

    pub fn with_replicas(
        store: Arc<dyn PersistenceStore>,
        stats: Arc<RelayStats>,
        config: SessionConfig,
        replicas: ReplicaFactory,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                store,
                replicas,
                stats,
                config,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Return the running session for `doc_id`, starting one if needed.
    pub async fn open(&self, doc_id: &DocumentId) -> SessionHandle {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(handle) = sessions.get(doc_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let handle = SessionHandle::new(doc_id.clone(), generation, tx);
        sessions.insert(doc_id.clone(), handle.clone());
        drop(sessions);

        log::debug!("Starting session for {doc_id} (generation {generation})");
        let ctx = SessionContext {
            doc_id: doc_id.clone(),
            generation,
            registry: self.clone(),
        };
        tokio::spawn(session::run(ctx, rx));
        handle
    }

    /// Attach a connection to the session for `doc_id`.
    ///
    /// If the session closes between lookup and attach, a fresh one is
    /// opened and the attach retried.
    pub async fn connect(
        &self,
        doc_id: &DocumentId,
        conn: ConnectionId,
        outbound: Outbound,
    ) -> Result<SessionHandle, RelayError> {
        loop {
            let handle = self.open(doc_id).await;
            match handle.attach(conn, outbound.clone()).await {
                Ok(()) => return Ok(handle),
                Err(RelayError::SessionClosed(_)) => {
                    log::debug!("Session for {doc_id} closed during attach, reopening");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Running session for `doc_id`, without starting one.
    pub async fn get(&self, doc_id: &DocumentId) -> Option<SessionHandle> {
        self.inner.sessions.lock().await.get(doc_id).cloned()
    }

    /// Remove the entry for `doc_id` if it still belongs to `generation`.
    pub(crate) async fn close(&self, doc_id: &DocumentId, generation: u64) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        match sessions.get(doc_id) {
            Some(handle) if handle.generation() == generation => {
                sessions.remove(doc_id);
                true
            }
            _ => false,
        }
    }

    /// Ask every session to drop awareness clients idle for `timeout`.
    pub async fn expire_awareness(&self, timeout: Duration) {
        for handle in self.handles().await {
            // A session closing concurrently has nothing left to expire.
            let _ = handle.expire_awareness(timeout).await;
        }
    }

    /// Stop every session and wait for each to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        if handles.is_empty() {
            return;
        }
        log::info!("Shutting down {} sessions", handles.len());
        join_all(handles.iter().map(|h| h.shutdown())).await;
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.inner.sessions.lock().await.keys().cloned().collect()
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.inner.store
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.inner.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub(crate) fn replicas(&self) -> &ReplicaFactory {
        &self.inner.replicas
    }

    async fn handles(&self) -> Vec<SessionHandle> {
        self.inner.sessions.lock().await.values().cloned().collect()
    }
}
