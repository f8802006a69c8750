//! # cardmind-relay: Collaborative document sync relay
//!
//! Lets many clients hold a replicated copy of a document and converge
//! without a central lock, tracks ephemeral per-user presence ("awareness"),
//! and persists every update that changed a document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   WebSocket /<doc>   ┌────────────────────────────────────┐
//! │ client A │ ◄──────────────────► │ RelayServer                        │
//! └──────────┘    binary frames     │   └── DocumentRegistry             │
//! ┌──────────┐                      │         └── DocumentSession (actor)│
//! │ client B │ ◄──────────────────► │               ├── ReplicaHandle    │
//! └──────────┘                      │               ├── AwarenessTracker │
//!                                   │               └── ConnectionManager│
//!                                   └──────────────────┬─────────────────┘
//!                                                      ▼
//!                                              PersistenceStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Varint wire format for sync and awareness frames
//! - [`replica`]: The four CRDT operations the relay consumes, backed by Yrs
//! - [`awareness`]: Per-client presence with monotonic clocks
//! - [`connection`]: Attached connections and non-blocking fan-out
//! - [`session`]: One actor per live document
//! - [`registry`]: Document id → session lookup and eviction
//! - [`storage`]: Update log (RocksDB or in-memory)
//! - [`server`]: WebSocket accept loop and per-connection tasks

pub mod awareness;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod server;
pub mod session;
pub mod stats;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessEntry, AwarenessTracker};
pub use connection::{ConnectionId, ConnectionManager, SendError, SyncState};
pub use error::RelayError;
pub use protocol::{
    AwarenessEntryUpdate, AwarenessUpdate, Frame, MessageType, ProtocolError, SyncMessage,
};
pub use registry::DocumentRegistry;
pub use replica::{ApplyError, ReplicaFactory, ReplicaHandle, YrsReplica};
pub use server::{RelayServer, ServerConfig};
pub use session::{DocumentId, DocumentSession, SessionConfig, SessionHandle};
pub use stats::{RelayStats, StatsSnapshot};
pub use storage::{MemoryStore, PersistenceStore, RocksStore, StoreConfig, StoreError};
