//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: Full yrs document snapshots (LZ4 compressed)
//! - `deltas`: Incremental yrs updates (LZ4 compressed, keyed by doc_id:version)
//! - `metadata`: Per-document metadata (bincode: versions, sizes, timestamps)
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{StorageAdapter, StoredDocument};
use crate::repo::DocumentId;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_DELTAS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true; flush is the durability barrier)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_db_data"),
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

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: DocumentId,
    /// Highest persisted version (snapshot or delta)
    pub version: u64,
    /// Version folded into the current snapshot (0 = no snapshot)
    pub snapshot_version: u64,
    /// Deltas stored after the snapshot
    pub delta_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: DocumentId) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            version: 0,
            snapshot_version: 0,
            delta_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document not found
    NotFound(DocumentId),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode; concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the document store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DELTAS => {
                // Many small writes, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
                // Values are LZ4-compressed already
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_DOCUMENTS => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }

        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full snapshot at `version`, dropping every delta up to it.
    pub fn save_snapshot(
        &self,
        doc_id: DocumentId,
        version: u64,
        snapshot: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_deltas = self.cf(CF_DELTAS)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self.metadata_or_new(doc_id)?;
        let mut batch = WriteBatch::default();
        let mut dropped = 0u64;
        for (key, delta_version) in self.delta_keys(doc_id)? {
            if delta_version > version {
                break;
            }
            batch.delete_cf(&cf_deltas, &key);
            dropped += 1;
        }

        meta.version = meta.version.max(version);
        meta.snapshot_version = version;
        meta.delta_count = meta.delta_count.saturating_sub(dropped);
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        batch.put_cf(&cf_docs, doc_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    /// Load a document snapshot (LZ4 decompressed).
    pub fn load_snapshot(&self, doc_id: DocumentId) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    // ─── Deltas ───────────────────────────────────────────────────────

    /// Store a compressed delta for a document.
    ///
    /// Key format: `<doc_id:16 bytes><version:8 bytes big-endian>`
    pub fn store_delta(
        &self,
        doc_id: DocumentId,
        version: u64,
        delta: &[u8],
    ) -> Result<u64, StoreError> {
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(delta);
        let compressed_len = compressed.len() as u64;

        let mut meta = self.metadata_or_new(doc_id)?;
        meta.version = meta.version.max(version);
        meta.delta_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deltas, Self::delta_key(doc_id, version), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        Ok(compressed_len)
    }

    /// Load all deltas for a document since a given version, in version order.
    pub fn load_deltas_since(
        &self,
        doc_id: DocumentId,
        since_version: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start_key = Self::delta_key(doc_id, since_version);

        let mut deltas = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            let version = match Self::delta_version(doc_id, &key) {
                Some(version) => version,
                None => break,
            };
            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            deltas.push((version, decompressed));
        }

        Ok(deltas)
    }

    pub fn load_all_deltas(&self, doc_id: DocumentId) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.load_deltas_since(doc_id, 0)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    /// Delete a document and all its deltas/metadata.
    pub fn delete_document(&self, doc_id: DocumentId) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_deltas = self.cf(CF_DELTAS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());
        for (key, _) in self.delta_keys(doc_id)? {
            batch.delete_cf(&cf_deltas, &key);
        }

        self.write(batch)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn metadata_or_new(&self, doc_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(doc_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(doc_id)),
            Err(e) => Err(e),
        }
    }

    /// Every delta key of a document with its version, in version order.
    fn delta_keys(&self, doc_id: DocumentId) -> Result<Vec<(Box<[u8]>, u64)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start_key = Self::delta_key(doc_id, 0);

        let mut keys = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            match Self::delta_version(doc_id, &key) {
                Some(version) => keys.push((key, version)),
                None => break,
            }
        }
        Ok(keys)
    }

    /// Build a delta key: doc_id (16 bytes) + version (8 bytes big-endian).
    fn delta_key(doc_id: DocumentId, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    /// Version encoded in `key`, if it belongs to `doc_id`.
    fn delta_version(doc_id: DocumentId, key: &[u8]) -> Option<u64> {
        if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[16..24]);
        Some(u64::from_be_bytes(buf))
    }
}

impl StorageAdapter for DocumentStore {
    fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let meta = match self.load_metadata(id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let snapshot = if meta.snapshot_version > 0 {
            Some(self.load_snapshot(id)?)
        } else {
            None
        };
        Ok(Some(StoredDocument {
            snapshot,
            deltas: self.load_all_deltas(id)?,
            version: meta.version,
        }))
    }

    fn append_delta(&self, id: DocumentId, version: u64, delta: &[u8]) -> Result<(), StoreError> {
        self.store_delta(id, version, delta).map(|_| ())
    }

    fn save_snapshot(
        &self,
        id: DocumentId,
        version: u64,
        snapshot: &[u8],
    ) -> Result<(), StoreError> {
        DocumentStore::save_snapshot(self, id, version, snapshot).map(|_| ())
    }

    fn remove(&self, id: DocumentId) -> Result<(), StoreError> {
        self.delete_document(id)
    }
}

fn now_secs() -> u64 {
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
