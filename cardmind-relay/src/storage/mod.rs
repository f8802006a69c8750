//! Durable update log per document.
//!
//! Architecture:
//! ```text
//! ┌─────────────────┐  append(update)   ┌──────────────────┐
//! │ DocumentSession │ ────────────────► │ PersistenceStore │
//! │ (actor)         │                   │                  │
//! └────────┬────────┘                   ├── MemoryStore    │
//!          │ on open                    └── RocksStore     │
//!          ▼                                 │
//!   load(doc) → [u1, u2, ...]                ├── CF "updates"  (LZ4)
//!   replayed in append order                 └── CF "metadata" (bincode)
//! ```
//!
//! The store never interprets update bytes. Replaying what `load` returns,
//! in order, reconstructs the document.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

use crate::session::DocumentId;

/// Append-only update log keyed by document.
///
/// Implementations are shared across session tasks and called from blocking
/// contexts, so they must be thread-safe.
pub trait PersistenceStore: Send + Sync {
    /// Every stored update for `doc_id`, oldest first. Unknown documents
    /// yield an empty list.
    fn load(&self, doc_id: &DocumentId) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Durably record one update. Returns the sequence number assigned.
    fn append(&self, doc_id: &DocumentId, update: &[u8]) -> Result<u64, StoreError>;

    /// Replace every stored update of `doc_id` with a single snapshot that
    /// encodes the same state.
    fn compact(&self, doc_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError>;

    /// Push buffered writes to stable storage.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// The backend refused the operation
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
