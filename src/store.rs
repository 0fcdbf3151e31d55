//! Durable per-user document index backed by RocksDB.
//!
//! Column families:
//! - `snapshots`: full Yrs document state (LZ4 compressed)
//! - `checkpoints`: snapshot as of the last confirmed remote flush,
//!   the restore point for `revert`
//! - `meta`: bincode [`DocMeta`] per document
//!
//! The in-memory index mirrors the `meta` column family and feeds a
//! watch channel so the background syncer reacts to index changes
//! without polling the database.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{watch, Mutex};

use crate::resource::{now_ms, DocId, Resource};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_CHECKPOINTS: &str = "checkpoints";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_CHECKPOINTS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory; the store opens `root/user_id`
    pub root: PathBuf,
    /// User this store belongs to
    pub user_id: String,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("tessera_data"),
            user_id: "anonymous".to_string(),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, caller-provided directory).
    pub fn for_testing(root: impl Into<PathBuf>, user_id: &str) -> Self {
        Self {
            root: root.into(),
            user_id: user_id.to_string(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Where a document was first instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateSource {
    Local,
    Remote,
}

/// Sync metadata stored per document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMeta {
    pub id: String,
    pub created_at: u64,
    pub create_source: CreateSource,
    pub exists_at_remote: bool,
    /// Set on the first locally-originated update of a dirty window,
    /// cleared by a confirmed remote flush. At most one transition per
    /// window regardless of how many local updates occur.
    pub needs_save_since: Option<u64>,
}

impl DocMeta {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    NotFound(String),
    AlreadyExists(String),
    Serialization(String),
    Compression(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "Document already exists: {id}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed local document store for one user.
pub struct LocalDocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    path: PathBuf,
    /// In-memory mirror of the meta column family
    index: StdMutex<HashMap<String, DocMeta>>,
    /// Ids with a live loaded replicated-document instance
    loaded: StdMutex<HashSet<String>>,
    /// Bumped on every index mutation
    index_tx: watch::Sender<u64>,
    /// Serializes migrations so overlapping calls queue, never interleave
    migrate_lock: Mutex<()>,
}

impl LocalDocumentStore {
    /// Open (or create) the store at `root/user_id`.
    pub fn open(config: StoreConfig) -> Result<Arc<Self>, StoreError> {
        let path = config.root.join(&config.user_id);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db =
            DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &path, cf_descriptors)?;

        // Rebuild the in-memory index from the meta column family.
        let mut index = HashMap::new();
        {
            let cf = db
                .cf_handle(CF_META)
                .ok_or_else(|| StoreError::Database("meta column family missing".into()))?;
            for item in db.iterator_cf(&cf, IteratorMode::Start) {
                let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
                let meta = DocMeta::decode(&value)?;
                index.insert(meta.id.clone(), meta);
            }
        }
        log::info!(
            "Opened document store for {} at {} ({} documents)",
            config.user_id,
            path.display(),
            index.len()
        );

        let (index_tx, _) = watch::channel(0);
        Ok(Arc::new(Self {
            db,
            config,
            path,
            index: StdMutex::new(index),
            loaded: StdMutex::new(HashSet::new()),
            index_tx,
            migrate_lock: Mutex::new(()),
        }))
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ─── Index ────────────────────────────────────────────────────────

    /// Snapshot of all document metadata, unordered.
    pub fn index(&self) -> Vec<DocMeta> {
        self.index.lock().unwrap().values().cloned().collect()
    }

    /// Watch channel bumped on every index mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.index_tx.subscribe()
    }

    pub fn contains(&self, id: &DocId) -> bool {
        self.index.lock().unwrap().contains_key(id.as_str())
    }

    pub fn meta(&self, id: &DocId) -> Option<DocMeta> {
        self.index.lock().unwrap().get(id.as_str()).cloned()
    }

    fn bump(&self) {
        self.index_tx.send_modify(|v| *v += 1);
    }

    // ─── Creation ─────────────────────────────────────────────────────

    /// Register a locally-created document.
    ///
    /// A fresh local document has never been uploaded, so its dirty
    /// stamp is set immediately.
    pub fn create_document(&self, id: &DocId) -> Result<(), StoreError> {
        self.create_with(DocMeta {
            id: id.as_str().to_string(),
            created_at: now_ms(),
            create_source: CreateSource::Local,
            exists_at_remote: false,
            needs_save_since: Some(now_ms()),
        })
    }

    /// Register a document first seen through remote hydration.
    pub fn create_document_from_remote(&self, id: &DocId) -> Result<(), StoreError> {
        self.create_with(DocMeta {
            id: id.as_str().to_string(),
            created_at: now_ms(),
            create_source: CreateSource::Remote,
            exists_at_remote: true,
            needs_save_since: None,
        })
    }

    fn create_with(&self, meta: DocMeta) -> Result<(), StoreError> {
        {
            let index = self.index.lock().unwrap();
            if index.contains_key(&meta.id) {
                return Err(StoreError::AlreadyExists(meta.id.clone()));
            }
        }
        if self.loaded.lock().unwrap().contains(&meta.id) {
            return Err(StoreError::AlreadyExists(meta.id.clone()));
        }
        self.put_meta(&meta)?;
        log::debug!("{}: registered ({:?})", meta.id, meta.create_source);
        self.index.lock().unwrap().insert(meta.id.clone(), meta);
        self.bump();
        Ok(())
    }

    // ─── Load guard ───────────────────────────────────────────────────

    /// Hydrate `resource` from the persisted snapshot, if any.
    ///
    /// # Panics
    ///
    /// Panics if the id is already loaded. Two live replicated-document
    /// instances for one id would silently diverge; the connection cache
    /// is responsible for never letting that happen.
    pub fn load_document(&self, id: &DocId, resource: &Resource) -> Result<(), StoreError> {
        {
            let mut loaded = self.loaded.lock().unwrap();
            assert!(
                loaded.insert(id.as_str().to_string()),
                "document {id} is already loaded"
            );
        }
        let hydrate = || -> Result<(), StoreError> {
            if !self.contains(id) {
                return Err(StoreError::NotFound(id.as_str().to_string()));
            }
            if let Some(snapshot) = self.read_blob(CF_SNAPSHOTS, id.as_str())? {
                resource
                    .apply_remote_update(&snapshot)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
            }
            Ok(())
        };
        let result = hydrate();
        // A failed hydration releases the guard so the load can be
        // retried once the underlying problem clears.
        if result.is_err() {
            self.loaded.lock().unwrap().remove(id.as_str());
        }
        result
    }

    /// Release the load guard for an id.
    pub fn unload(&self, id: &DocId) {
        self.loaded.lock().unwrap().remove(id.as_str());
    }

    pub fn is_loaded(&self, id: &DocId) -> bool {
        self.loaded.lock().unwrap().contains(id.as_str())
    }

    // ─── Sync metadata ────────────────────────────────────────────────

    /// Stamp the dirty marker, only if it is not already set.
    pub fn note_local_update(&self, id: &DocId) -> Result<(), StoreError> {
        let mut index = self.index.lock().unwrap();
        let meta = index
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::NotFound(id.as_str().to_string()))?;
        if meta.needs_save_since.is_some() {
            return Ok(());
        }
        meta.needs_save_since = Some(now_ms());
        let meta = meta.clone();
        drop(index);
        self.put_meta(&meta)?;
        self.bump();
        Ok(())
    }

    /// Record a confirmed remote flush: clear the dirty stamp, mark the
    /// document as existing remotely, and checkpoint the current snapshot.
    pub fn mark_synced(&self, id: &DocId) -> Result<(), StoreError> {
        let meta = {
            let mut index = self.index.lock().unwrap();
            let meta = index
                .get_mut(id.as_str())
                .ok_or_else(|| StoreError::NotFound(id.as_str().to_string()))?;
            meta.needs_save_since = None;
            meta.exists_at_remote = true;
            meta.clone()
        };
        self.put_meta(&meta)?;
        if let Some(compressed) = self.read_raw(CF_SNAPSHOTS, id.as_str())? {
            let cf = self.cf(CF_CHECKPOINTS)?;
            self.db.put_cf(&cf, id.as_str(), &compressed)?;
        }
        self.bump();
        Ok(())
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Persist the merged document state (LZ4 compressed).
    pub fn save_state(&self, id: &DocId, full_update: &[u8]) -> Result<(), StoreError> {
        if !self.contains(id) {
            return Err(StoreError::NotFound(id.as_str().to_string()));
        }
        let compressed = lz4_flex::compress_prepend_size(full_update);
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, id.as_str(), &compressed, &write_opts)?;
        Ok(())
    }

    /// Load the persisted snapshot, if one exists.
    pub fn load_snapshot(&self, id: &DocId) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_blob(CF_SNAPSHOTS, id.as_str())
    }

    /// Replace the working snapshot with the last checkpoint and clear
    /// the dirty stamp. Backs `revert`.
    pub fn restore_checkpoint(&self, id: &DocId) -> Result<(), StoreError> {
        let checkpoint = self
            .read_raw(CF_CHECKPOINTS, id.as_str())?
            .ok_or_else(|| StoreError::NotFound(id.as_str().to_string()))?;
        let cf = self.cf(CF_SNAPSHOTS)?;
        self.db.put_cf(&cf, id.as_str(), &checkpoint)?;

        let meta = {
            let mut index = self.index.lock().unwrap();
            let meta = index
                .get_mut(id.as_str())
                .ok_or_else(|| StoreError::NotFound(id.as_str().to_string()))?;
            meta.needs_save_since = None;
            meta.clone()
        };
        self.put_meta(&meta)?;
        self.bump();
        Ok(())
    }

    /// Remove persisted bytes and the index entry for a document.
    pub fn delete_local(&self, id: &DocId) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_SNAPSHOTS)?, id.as_str());
        batch.delete_cf(&self.cf(CF_CHECKPOINTS)?, id.as_str());
        batch.delete_cf(&self.cf(CF_META)?, id.as_str());
        self.db.write(batch)?;
        self.index.lock().unwrap().remove(id.as_str());
        self.loaded.lock().unwrap().remove(id.as_str());
        self.bump();
        log::debug!("{id}: deleted locally");
        Ok(())
    }

    // ─── Migration ────────────────────────────────────────────────────

    /// Copy every document into another user's store.
    ///
    /// Copied documents are marked dirty and not-at-remote under the
    /// target user; their upload is the target's business. Concurrent
    /// invocations on the same source store queue behind each other.
    /// Returns the number of documents copied.
    pub async fn migrate_into(&self, target: &LocalDocumentStore) -> Result<usize, StoreError> {
        let _guard = self.migrate_lock.lock().await;
        let metas = self.index();
        let mut copied = 0;
        for meta in metas {
            let id: DocId = meta
                .id
                .parse()
                .map_err(|_| StoreError::Serialization(format!("bad id in index: {}", meta.id)))?;
            if target.contains(&id) {
                log::debug!("{id}: already present in target store, skipping");
                continue;
            }
            target.create_with(DocMeta {
                id: meta.id.clone(),
                created_at: meta.created_at,
                create_source: CreateSource::Local,
                exists_at_remote: false,
                needs_save_since: Some(now_ms()),
            })?;
            if let Some(snapshot) = self.load_snapshot(&id)? {
                target.save_state(&id, &snapshot)?;
            }
            copied += 1;
        }
        log::info!(
            "Migrated {copied} documents from {} to {}",
            self.user_id(),
            target.user_id()
        );
        Ok(copied)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn put_meta(&self, meta: &DocMeta) -> Result<(), StoreError> {
        let cf = self.cf(CF_META)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, &meta.id, &meta.encode()?, &write_opts)?;
        Ok(())
    }

    fn read_raw(&self, cf_name: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    fn read_blob(&self, cf_name: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.read_raw(cf_name, key)? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}
