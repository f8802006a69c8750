//! Relay-level error type.

use crate::connection::{ConnectionId, SendError};
use crate::protocol::ProtocolError;
use crate::replica::ApplyError;
use crate::session::DocumentId;
use crate::storage::StoreError;

/// Errors surfaced by the relay.
///
/// Protocol and apply errors are scoped to the connection that caused them;
/// the relay closes that connection and keeps serving everyone else.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("replica rejected input: {0}")]
    Apply(#[from] ApplyError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("send to connection {0} failed: {1}")]
    TransportSend(ConnectionId, SendError),

    #[error("session for document '{0}' is closed")]
    SessionClosed(DocumentId),

    #[error("missing document id in request path")]
    MissingDocumentId,

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the error is the peer's fault and only that connection should go.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            RelayError::Protocol(_) | RelayError::Apply(_) | RelayError::TransportSend(..)
        )
    }
}
