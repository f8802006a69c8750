//! Per-document replicated state.
//!
//! The relay never looks inside a document. It needs four operations from
//! the CRDT, captured by [`ReplicaHandle`]; [`YrsReplica`] provides them on
//! top of a `yrs::Doc`.

use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Encoding of an update that carries no structs and no deletions.
pub const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// The replica rejected bytes as corrupt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("update rejected: {0}")]
    Rejected(String),
    #[error("replica unavailable: {0}")]
    Unavailable(String),
}

/// The four operations the relay consumes from a CRDT document.
pub trait ReplicaHandle: Send {
    /// Merge `update`. Returns what actually integrated, encoded as an
    /// update, or `None` for a no-op re-apply of already known state.
    ///
    /// Content whose dependencies are still missing is held back and shows
    /// up in the result of the call that supplies them.
    fn apply_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, ApplyError>;

    /// Compact summary of everything this replica has seen.
    fn state_vector(&self) -> Vec<u8>;

    /// Update carrying what the peer behind `peer_state_vector` is missing.
    /// Empty when there is nothing to send.
    fn diff(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, ApplyError>;

    /// The whole document encoded as a single update.
    fn full_state(&self) -> Vec<u8>;
}

/// Builds a fresh replica for a newly opened document.
pub type ReplicaFactory =
    Arc<dyn Fn() -> Result<Box<dyn ReplicaHandle>, ApplyError> + Send + Sync>;

/// Factory producing [`YrsReplica`]s.
pub fn yrs_factory() -> ReplicaFactory {
    Arc::new(|| Ok(Box::new(YrsReplica::new()?) as Box<dyn ReplicaHandle>))
}

/// [`ReplicaHandle`] backed by a Yrs document.
pub struct YrsReplica {
    doc: Doc,
}

impl YrsReplica {
    pub fn new() -> Result<Self, ApplyError> {
        Self::with_doc(Doc::new())
    }

    /// Wrap an existing doc. Useful for clients that edit locally.
    pub fn with_doc(doc: Doc) -> Result<Self, ApplyError> {
        Ok(Self { doc })
    }

    /// Direct access for callers that edit the document themselves.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl ReplicaHandle for YrsReplica {
    fn apply_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, ApplyError> {
        let update =
            Update::decode_v1(update).map_err(|e| ApplyError::MalformedUpdate(e.to_string()))?;

        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ApplyError::Rejected(e.to_string()))?;
        // Everything integrated since the transaction began, including
        // previously parked structs that this update unblocked.
        let integrated = txn.encode_update_v1();
        Ok((integrated != EMPTY_UPDATE).then_some(integrated))
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, ApplyError> {
        let sv = StateVector::decode_v1(peer_state_vector)
            .map_err(|e| ApplyError::MalformedStateVector(e.to_string()))?;
        let diff = self.doc.transact().encode_diff_v1(&sv);
        if diff == EMPTY_UPDATE {
            Ok(Vec::new())
        } else {
            Ok(diff)
        }
    }

    fn full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    fn insert(replica: &YrsReplica, at: u32, content: &str) -> Vec<u8> {
        let before = replica.state_vector();
        {
            let mut txn = replica.doc().transact_mut();
            let text = txn.get_or_insert_text("body");
            text.insert(&mut txn, at, content);
        }
        replica.diff(&before).unwrap()
    }

    fn text_of(replica: &YrsReplica) -> String {
        let txn = replica.doc().transact();
        txn.get_text("body")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    #[test]
    fn test_apply_reports_effect_then_idempotent() {
        let source = YrsReplica::new().unwrap();
        let update = insert(&source, 0, "hello");

        let mut target = YrsReplica::new().unwrap();
        assert!(target.apply_update(&update).unwrap().is_some());
        let state = target.full_state();

        assert!(target.apply_update(&update).unwrap().is_none());
        assert_eq!(target.full_state(), state);
        assert_eq!(text_of(&target), "hello");
    }

    #[test]
    fn test_malformed_update_rejected() {
        let mut replica = YrsReplica::new().unwrap();
        assert!(replica.apply_update(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_malformed_state_vector_rejected() {
        let replica = YrsReplica::new().unwrap();
        assert!(matches!(
            replica.diff(&[0xFF]),
            Err(ApplyError::MalformedStateVector(_))
        ));
    }

    #[test]
    fn test_diff_empty_when_peer_up_to_date() {
        let a = YrsReplica::new().unwrap();
        insert(&a, 0, "same");

        let mut b = YrsReplica::new().unwrap();
        b.apply_update(&a.full_state()).unwrap();

        assert!(a.diff(&b.state_vector()).unwrap().is_empty());
        assert!(b.diff(&a.state_vector()).unwrap().is_empty());
    }

    #[test]
    fn test_diff_against_empty_peer_is_full_content() {
        let a = YrsReplica::new().unwrap();
        insert(&a, 0, "content");

        let fresh = YrsReplica::new().unwrap();
        let diff = a.diff(&fresh.state_vector()).unwrap();
        assert!(!diff.is_empty());

        let mut b = YrsReplica::new().unwrap();
        assert!(b.apply_update(&diff).unwrap().is_some());
        assert_eq!(text_of(&b), "content");
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let a = YrsReplica::new().unwrap();
        let b = YrsReplica::new().unwrap();
        let ua = insert(&a, 0, "left");
        let ub = insert(&b, 0, "right");

        let mut a = a;
        let mut b = b;
        a.apply_update(&ub).unwrap();
        b.apply_update(&ua).unwrap();

        assert_eq!(text_of(&a), text_of(&b));
        assert_eq!(a.full_state(), b.full_state());
    }

    #[test]
    fn test_empty_update_has_no_effect() {
        let mut replica = YrsReplica::new().unwrap();
        assert!(replica.apply_update(&EMPTY_UPDATE).unwrap().is_none());
    }

    #[test]
    fn test_out_of_order_update_held_until_dependency() {
        let source = YrsReplica::new().unwrap();
        let first = insert(&source, 0, "A");
        let second = insert(&source, 1, "B");

        let mut target = YrsReplica::new().unwrap();
        assert!(target.apply_update(&second).unwrap().is_none());

        let integrated = target.apply_update(&first).unwrap().unwrap();
        assert_eq!(text_of(&target), "AB");

        // The integrated bytes carry both edits.
        let mut sibling = YrsReplica::new().unwrap();
        sibling.apply_update(&integrated).unwrap();
        assert_eq!(text_of(&sibling), "AB");
    }

    #[test]
    fn test_integrated_update_completes_partial_peer() {
        let source = YrsReplica::new().unwrap();
        let first = insert(&source, 0, "known");
        insert(&source, 5, " new");

        let mut target = YrsReplica::new().unwrap();
        target.apply_update(&first).unwrap();
        let integrated = target.apply_update(&source.full_state()).unwrap().unwrap();

        let mut sibling = YrsReplica::new().unwrap();
        sibling.apply_update(&first).unwrap();
        sibling.apply_update(&integrated).unwrap();
        assert_eq!(text_of(&sibling), "known new");
    }

    #[test]
    fn test_replica_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<YrsReplica>();
        assert_send::<Box<dyn ReplicaHandle>>();
    }
}
