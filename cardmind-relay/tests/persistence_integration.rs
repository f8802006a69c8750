//! Persistence integration tests.
//!
//! Verifies:
//! - Update log roundtrip through RocksDB, across reopen
//! - Compaction keeps document content
//! - Sequence recovery after restart
//! - Session eviction persists and a new session replays
//! - Multi-document isolation

use std::sync::Arc;
use std::time::Duration;

use cardmind_relay::protocol::{Frame, SyncMessage};
use cardmind_relay::replica::{ReplicaHandle, YrsReplica};
use cardmind_relay::session::{DocumentId, SessionConfig};
use cardmind_relay::storage::{PersistenceStore, RocksStore, StoreConfig};
use cardmind_relay::{ConnectionId, DocumentRegistry, RelayStats};
use tempfile::tempdir;
use tokio::sync::mpsc;
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Append `text` to the replica's "content" text and return the update.
fn edit(replica: &YrsReplica, text: &str) -> Vec<u8> {
    let before = replica.state_vector();
    {
        let mut txn = replica.doc().transact_mut();
        let content = txn.get_or_insert_text("content");
        let len = content.get_string(&txn).len() as u32;
        content.insert(&mut txn, len, text);
    }
    replica.diff(&before).unwrap()
}

fn content(replica: &YrsReplica) -> String {
    let txn = replica.doc().transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

fn replay(updates: &[Vec<u8>]) -> YrsReplica {
    let mut replica = YrsReplica::new().unwrap();
    for update in updates {
        replica.apply_update(update).unwrap();
    }
    replica
}

fn open_store(path: &std::path::Path) -> RocksStore {
    RocksStore::open(StoreConfig::for_testing(path)).unwrap()
}

// ─── Update log ──────────────────────────────────────────────────────────────

#[test]
fn test_updates_survive_reopen() {
    let dir = tempdir().unwrap();
    let doc = DocumentId::new("notes/today");
    let author = YrsReplica::new().unwrap();

    let written: Vec<Vec<u8>> = ["Hello", ", ", "persistence!"]
        .iter()
        .map(|part| edit(&author, part))
        .collect();
    {
        let store = open_store(dir.path());
        for update in &written {
            store.append(&doc, update).unwrap();
        }
        store.flush().unwrap();
    }

    let store = open_store(dir.path());
    let loaded = store.load(&doc).unwrap();
    assert_eq!(loaded, written);
    assert_eq!(content(&replay(&loaded)), "Hello, persistence!");
}

#[test]
fn test_compaction_preserves_content() {
    let dir = tempdir().unwrap();
    let doc = DocumentId::new("compact-me");
    let author = YrsReplica::new().unwrap();

    {
        let store = open_store(dir.path());
        for i in 0..50 {
            store.append(&doc, &edit(&author, &format!("line {i}\n"))).unwrap();
        }
        assert_eq!(store.load_metadata(&doc).unwrap().unwrap().update_count, 50);

        store.compact(&doc, &author.full_state()).unwrap();
    }

    let store = open_store(dir.path());
    let loaded = store.load(&doc).unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(content(&replay(&loaded)), content(&author));

    let meta = store.load_metadata(&doc).unwrap().unwrap();
    assert_eq!(meta.update_count, 1);
    assert_eq!(meta.compactions, 1);
}

#[test]
fn test_sequence_recovers_after_restart() {
    let dir = tempdir().unwrap();
    let doc = DocumentId::new("seq");
    let author = YrsReplica::new().unwrap();

    let first = {
        let store = open_store(dir.path());
        store.append(&doc, &edit(&author, "a")).unwrap();
        store.append(&doc, &edit(&author, "b")).unwrap()
    };

    let store = open_store(dir.path());
    let next = store.append(&doc, &edit(&author, "c")).unwrap();
    assert!(next > first, "sequence went backwards: {next} <= {first}");
    assert_eq!(content(&replay(&store.load(&doc).unwrap())), "abc");
}

#[test]
fn test_multi_document_isolation() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    let docs: Vec<DocumentId> = (0..5).map(|i| DocumentId::new(format!("doc-{i}"))).collect();
    for (i, doc) in docs.iter().enumerate() {
        let author = YrsReplica::new().unwrap();
        store.append(doc, &edit(&author, &format!("document {i}"))).unwrap();
    }

    let mut listed = store.list_documents().unwrap();
    listed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(listed, docs);

    for (i, doc) in docs.iter().enumerate() {
        assert_eq!(content(&replay(&store.load(doc).unwrap())), format!("document {i}"));
    }
}

#[test]
fn test_large_document_persistence() {
    let dir = tempdir().unwrap();
    let doc = DocumentId::new("large");
    let author = YrsReplica::new().unwrap();
    let text = "The quick brown fox jumps over the lazy dog. ".repeat(2_500);

    {
        let store = open_store(dir.path());
        store.append(&doc, &edit(&author, &text)).unwrap();
    }

    let store = open_store(dir.path());
    assert_eq!(content(&replay(&store.load(&doc).unwrap())), text);
}

// ─── Sessions over RocksDB ───────────────────────────────────────────────────

async fn wait_until_closed(registry: &DocumentRegistry) {
    for _ in 0..100 {
        if registry.is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never closed");
}

#[tokio::test]
async fn test_session_eviction_persists_and_replays() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn PersistenceStore> = Arc::new(open_store(dir.path()));
    let stats = Arc::new(RelayStats::new());
    let registry = DocumentRegistry::new(store.clone(), stats.clone(), SessionConfig::default());
    let doc = DocumentId::new("evicted");
    let author = YrsReplica::new().unwrap();

    let conn = ConnectionId::new();
    let (tx, mut rx) = mpsc::channel(16);
    let session = registry.connect(&doc, conn, tx).await.unwrap();
    session.frame(conn, Frame::update(edit(&author, "kept ")).encode()).await.unwrap();
    session.frame(conn, Frame::update(edit(&author, "after close")).encode()).await.unwrap();
    session.detach(conn).await;
    wait_until_closed(&registry).await;

    // Compacted on close.
    let stored = store.load(&doc).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(content(&replay(&stored)), "kept after close");
    assert_eq!(stats.snapshot().persisted_updates, 2);

    // Drain the first connection's greeting; the queue then ends.
    while rx.recv().await.is_some() {}

    let conn = ConnectionId::new();
    let (tx, mut rx) = mpsc::channel(16);
    let session = registry.connect(&doc, conn, tx).await.unwrap();
    let greeting = rx.recv().await.unwrap();
    let Frame::Sync(SyncMessage::SyncStep1(state_vector)) = Frame::decode(&greeting).unwrap() else {
        panic!("expected SyncStep1");
    };
    assert_eq!(state_vector, author.state_vector());

    rx.recv().await.unwrap(); // awareness snapshot

    let empty = YrsReplica::new().unwrap().state_vector();
    session.frame(conn, Frame::sync_step1(empty).encode()).await.unwrap();
    let reply = rx.recv().await.unwrap();
    let Frame::Sync(SyncMessage::SyncStep2(state)) = Frame::decode(&reply).unwrap() else {
        panic!("expected SyncStep2");
    };
    assert_eq!(content(&replay(&[state])), "kept after close");

    registry.shutdown().await;
}
