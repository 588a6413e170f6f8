//! RocksDB-backed history store.
//!
//! Column families:
//! - `versions`  — immutable version records, keyed `<doc_id>\0<version:8 BE>`
//! - `meta`      — document metadata, keyed `<doc_id>`
//! - `documents` — compacted live document state (LZ4), keyed `<doc_id>`
//! - `updates`   — live document update log (LZ4), keyed `<doc_id>\0<seq:8 BE>`
//!
//! Values are bincode-encoded and LZ4-compressed. Multi-record writes go
//! through a single `WriteBatch` so they are all-or-nothing.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{decode_value, encode_value, HistoryBackend, StorageError, StoredDocument};
use crate::model::{DocumentId, DocumentMeta, VersionRecord};

const CF_VERSIONS: &str = "versions";
const CF_META: &str = "meta";
const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";

const COLUMN_FAMILIES: &[&str] = &[CF_VERSIONS, CF_META, CF_DOCUMENTS, CF_UPDATES];

/// Separates the document id from the numeric suffix in composite keys.
const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true, version records must survive a crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB implementation of [`HistoryBackend`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, callers serialize)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next update sequence number, shared by all documents
    sequence: AtomicU64,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
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
            "Opened history store at {} (next update seq {sequence})",
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
            CF_META => {
                // Small values, point lookups on every request
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSIONS | CF_DOCUMENTS | CF_UPDATES => {
                // Values are already LZ4-compressed
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Scan the update log for the highest sequence number in use.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StorageError> {
        let cf = match db.cf_handle(CF_UPDATES) {
            Some(cf) => cf,
            None => return Ok(0),
        };
        let mut next = 0u64;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(seq) = suffix_u64(&key) {
                next = next.max(seq + 1);
            }
        }
        Ok(next)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    /// List every document that has metadata.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StorageError> {
        let cf = self.cf(CF_META)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let meta: DocumentMeta = decode_value(&value)?;
            ids.push(meta.doc_id);
        }
        Ok(ids)
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }

    /// Collect `(suffix, value)` pairs for every key under `<doc_id>\0`.
    fn scan_prefixed(
        &self,
        cf_name: &str,
        doc_id: &DocumentId,
    ) -> Result<Vec<(u64, Box<[u8]>)>, StorageError> {
        let cf = self.cf(cf_name)?;
        let prefix = key_prefix(doc_id);
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            match suffix_u64(&key) {
                Some(n) if key.len() == prefix.len() + 8 => out.push((n, value)),
                _ => log::warn!("Skipping malformed {cf_name} key for document {doc_id}"),
            }
        }
        Ok(out)
    }
}

impl HistoryBackend for RocksStore {
    fn get_version(
        &self,
        doc_id: &DocumentId,
        version: u64,
    ) -> Result<Option<VersionRecord>, StorageError> {
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(cf, composite_key(doc_id, version))? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_versions(&self, doc_id: &DocumentId) -> Result<Vec<VersionRecord>, StorageError> {
        self.scan_prefixed(CF_VERSIONS, doc_id)?
            .into_iter()
            .map(|(_, value)| decode_value(&value))
            .collect()
    }

    fn put_version(&self, record: &VersionRecord) -> Result<(), StorageError> {
        let cf = self.cf(CF_VERSIONS)?;
        let key = composite_key(&record.doc_id, record.version);
        if self.db.get_cf(cf, &key)?.is_some() {
            return Err(StorageError::Conflict {
                doc_id: record.doc_id.clone(),
                version: record.version,
            });
        }
        self.db
            .put_cf_opt(cf, key, encode_value(record)?, &self.write_options())?;
        Ok(())
    }

    fn get_meta(&self, doc_id: &DocumentId) -> Result<Option<DocumentMeta>, StorageError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_meta(&self, meta: &DocumentMeta) -> Result<(), StorageError> {
        let cf = self.cf(CF_META)?;
        self.db.put_cf_opt(
            cf,
            meta.doc_id.as_bytes(),
            encode_value(meta)?,
            &self.write_options(),
        )?;
        Ok(())
    }

    fn commit_version(
        &self,
        record: &VersionRecord,
        meta: &DocumentMeta,
    ) -> Result<(), StorageError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_meta = self.cf(CF_META)?;

        let key = composite_key(&record.doc_id, record.version);
        if self.db.get_cf(cf_versions, &key)?.is_some() {
            return Err(StorageError::Conflict {
                doc_id: record.doc_id.clone(),
                version: record.version,
            });
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_versions, &key, encode_value(record)?);
        batch.put_cf(cf_meta, meta.doc_id.as_bytes(), encode_value(meta)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn load_document(&self, doc_id: &DocumentId) -> Result<StoredDocument, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let state = match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(compressed) => Some(
                lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StorageError::Compression(e.to_string()))?,
            ),
            None => None,
        };

        let mut updates = Vec::new();
        for (seq, value) in self.scan_prefixed(CF_UPDATES, doc_id)? {
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StorageError::Compression(e.to_string()))?;
            updates.push((seq, update));
        }

        Ok(StoredDocument { state, updates })
    }

    fn append_update(&self, doc_id: &DocumentId, update: &[u8]) -> Result<u64, StorageError> {
        let cf = self.cf(CF_UPDATES)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let compressed = lz4_flex::compress_prepend_size(update);
        self.db.put_cf_opt(
            cf,
            composite_key(doc_id, seq),
            compressed,
            &self.write_options(),
        )?;
        Ok(seq)
    }

    fn compact_document(
        &self,
        doc_id: &DocumentId,
        state: &[u8],
        through_seq: Option<u64>,
    ) -> Result<u64, StorageError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, doc_id.as_bytes(), lz4_flex::compress_prepend_size(state));

        let mut removed = 0u64;
        if let Some(through) = through_seq {
            for (seq, _) in self.scan_prefixed(CF_UPDATES, doc_id)? {
                if seq > through {
                    break;
                }
                batch.delete_cf(cf_updates, composite_key(doc_id, seq));
                removed += 1;
            }
        }

        self.db.write_opt(batch, &self.write_options())?;
        Ok(removed)
    }
}

/// `<doc_id>\0`
fn key_prefix(doc_id: &DocumentId) -> Vec<u8> {
    let mut key = Vec::with_capacity(doc_id.as_bytes().len() + 1);
    key.extend_from_slice(doc_id.as_bytes());
    key.push(KEY_SEPARATOR);
    key
}

/// `<doc_id>\0<n:8 bytes big-endian>`, so keys sort in numeric order.
fn composite_key(doc_id: &DocumentId, n: u64) -> Vec<u8> {
    let mut key = key_prefix(doc_id);
    key.extend_from_slice(&n.to_be_bytes());
    key
}

/// Trailing 8-byte big-endian number of a composite key.
fn suffix_u64(key: &[u8]) -> Option<u64> {
    if key.len() < 9 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[key.len() - 8..]);
    Some(u64::from_be_bytes(buf))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
