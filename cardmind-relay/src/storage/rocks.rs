//! RocksDB-backed update log.
//!
//! Column families:
//! - `updates`: raw CRDT updates (LZ4 compressed, keyed by doc prefix + sequence)
//! - `metadata`: per-document bookkeeping (bincode)
//!
//! Key format in `updates`:
//! ```text
//! ┌──────────────┬─────────────────┬──────────────┐
//! │ len: u32 BE  │ doc id (UTF-8)  │ seq: u64 BE  │
//! └──────────────┴─────────────────┴──────────────┘
//! ```
//! The length prefix keeps one document's range from overlapping another
//! whose id it is a prefix of. Big-endian sequences make a forward scan
//! return updates in append order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use super::{PersistenceStore, StoreError};
use crate::session::DocumentId;

/// Column family names.
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_UPDATES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false, `flush` syncs instead)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cardmind_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Default tuning at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Bookkeeping stored next to each document's updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    /// Sequence of the newest stored update
    pub last_sequence: u64,
    /// Updates currently stored (1 right after a compaction)
    pub update_count: u64,
    /// Uncompressed bytes currently stored
    pub stored_bytes: u64,
    pub compactions: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &DocumentId) -> Self {
        let now = unix_now();
        Self {
            doc_id: doc_id.as_str().to_string(),
            last_sequence: 0,
            update_count: 0,
            stored_bytes: 0,
            compactions: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`PersistenceStore`].
///
/// Appends and compactions go through atomic write batches so the update
/// log and its metadata never disagree.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next sequence number, shared by all documents
    sequence: AtomicU64,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened update store at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_UPDATES => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Highest sequence recorded in any document's metadata, plus one.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = match db.cf_handle(CF_METADATA) {
            Some(cf) => cf,
            None => return Ok(0),
        };

        let mut next = 0;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let meta = DocumentMetadata::decode(&value)?;
            next = next.max(meta.last_sequence + 1);
        }
        Ok(next)
    }

    /// Load document metadata, if the document has ever been written.
    pub fn load_metadata(&self, doc_id: &DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all stored document ids.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            doc_ids.push(DocumentId::new(DocumentMetadata::decode(&value)?.doc_id));
        }
        Ok(doc_ids)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Queue deletion of every update of `doc_id`. Returns how many.
    fn delete_updates(&self, doc_id: &DocumentId, batch: &mut WriteBatch) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = doc_prefix(doc_id);
        let mut count = 0u64;

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }
        Ok(count)
    }
}

impl PersistenceStore for RocksStore {
    fn load(&self, doc_id: &DocumentId) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = doc_prefix(doc_id);

        let mut updates = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            updates.push(update);
        }

        log::debug!("Loaded {} updates for document {doc_id}", updates.len());
        Ok(updates)
    }

    fn append(&self, doc_id: &DocumentId, update: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let compressed = lz4_flex::compress_prepend_size(update);

        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        meta.last_sequence = seq;
        meta.update_count += 1;
        meta.stored_bytes += update.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_updates, update_key(doc_id, seq), &compressed);
        batch.put_cf(cf_meta, doc_id.as_str().as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(seq)
    }

    fn compact(&self, doc_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        let removed = self.delete_updates(doc_id, &mut batch)?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        batch.put_cf(
            cf_updates,
            update_key(doc_id, seq),
            lz4_flex::compress_prepend_size(snapshot),
        );

        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        meta.last_sequence = seq;
        meta.update_count = 1;
        meta.stored_bytes = snapshot.len() as u64;
        meta.compactions += 1;
        meta.updated_at = unix_now();
        batch.put_cf(cf_meta, doc_id.as_str().as_bytes(), meta.encode()?);

        self.db.write_opt(batch, &self.write_options())?;
        log::info!("Compacted {removed} updates of document {doc_id} into one snapshot");
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }
}

/// `len (u32 BE) ++ id bytes`
fn doc_prefix(doc_id: &DocumentId) -> Vec<u8> {
    let id = doc_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(4 + id.len() + 8);
    key.extend_from_slice(&(id.len() as u32).to_be_bytes());
    key.extend_from_slice(id);
    key
}

fn update_key(doc_id: &DocumentId, seq: u64) -> Vec<u8> {
    let mut key = doc_prefix(doc_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_append_load_in_order() {
        let (_dir, store) = open_temp();
        let doc = DocumentId::new("board-1");

        for i in 1..=10u8 {
            store.append(&doc, &[i; 32]).unwrap();
        }

        let loaded = store.load(&doc).unwrap();
        assert_eq!(loaded.len(), 10);
        assert_eq!(loaded[0], vec![1; 32]);
        assert_eq!(loaded[9], vec![10; 32]);
    }

    #[test]
    fn test_unknown_document_loads_empty() {
        let (_dir, store) = open_temp();
        assert!(store.load(&DocumentId::new("nothing")).unwrap().is_empty());
        assert!(store.load_metadata(&DocumentId::new("nothing")).unwrap().is_none());
    }

    #[test]
    fn test_prefix_ids_do_not_overlap() {
        let (_dir, store) = open_temp();
        let short = DocumentId::new("a");
        let long = DocumentId::new("ab");
        store.append(&short, b"short").unwrap();
        store.append(&long, b"long").unwrap();
        store.append(&short, b"short-2").unwrap();

        assert_eq!(
            store.load(&short).unwrap(),
            vec![b"short".to_vec(), b"short-2".to_vec()]
        );
        assert_eq!(store.load(&long).unwrap(), vec![b"long".to_vec()]);
    }

    #[test]
    fn test_compact_replaces_updates() {
        let (_dir, store) = open_temp();
        let doc = DocumentId::new("notes");
        store.append(&doc, b"u1").unwrap();
        store.append(&doc, b"u2").unwrap();
        store.append(&doc, b"u3").unwrap();

        store.compact(&doc, b"snapshot").unwrap();
        assert_eq!(store.load(&doc).unwrap(), vec![b"snapshot".to_vec()]);

        let meta = store.load_metadata(&doc).unwrap().unwrap();
        assert_eq!(meta.update_count, 1);
        assert_eq!(meta.compactions, 1);
        assert_eq!(meta.stored_bytes, 8);

        // New updates land after the snapshot.
        store.append(&doc, b"u4").unwrap();
        assert_eq!(
            store.load(&doc).unwrap(),
            vec![b"snapshot".to_vec(), b"u4".to_vec()]
        );
    }

    #[test]
    fn test_list_documents() {
        let (_dir, store) = open_temp();
        for name in ["alpha", "beta", "gamma"] {
            store.append(&DocumentId::new(name), b"data").unwrap();
        }
        let listed = store.list_documents().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.contains(&DocumentId::new("beta")));
    }

    #[test]
    fn test_sequence_and_contents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        let doc = DocumentId::new("durable");

        {
            let store = RocksStore::open(config.clone()).unwrap();
            assert_eq!(store.append(&doc, b"a").unwrap(), 0);
            assert_eq!(store.append(&doc, b"b").unwrap(), 1);
            assert_eq!(store.append(&doc, b"c").unwrap(), 2);
            store.flush().unwrap();
        }

        let store = RocksStore::open(config).unwrap();
        assert_eq!(store.append(&doc, b"d").unwrap(), 3);
        assert_eq!(
            store.load(&doc).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn test_metadata_tracks_appends() {
        let (_dir, store) = open_temp();
        let doc = DocumentId::new("meta");
        store.append(&doc, b"12345").unwrap();
        store.append(&doc, b"678").unwrap();

        let meta = store.load_metadata(&doc).unwrap().unwrap();
        assert_eq!(meta.doc_id, "meta");
        assert_eq!(meta.update_count, 2);
        assert_eq!(meta.stored_bytes, 8);
        assert_eq!(meta.last_sequence, 1);
        assert!(meta.updated_at >= meta.created_at);
    }
}
