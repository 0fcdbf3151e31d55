//! Connection cache: at most one live resource per document id.
//!
//! Every open document flows through here. A [`ConnectionHandle`] is a
//! refcounted lease on one cached slot; cloning a handle is cheap, and
//! dropping the last clone tears the whole connection down (sync tasks
//! aborted, document persisted state left behind, memory released).
//!
//! Construction is serialized behind an async lock so two concurrent
//! loads of the same id cannot each build a replica and split the
//! document's update stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::watch;
use uuid::Uuid;

use crate::resource::{DocId, Ref, RefDef, Resource, ResourceError};
use crate::room::{RoomError, RoomService};
use crate::store::{LocalDocumentStore, StoreError};
use crate::sync::{DocStatus, SyncConfig, SyncManager};

/// The local user this cache acts as.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: String,
}

#[derive(Debug)]
pub enum CacheError {
    Store(StoreError),
    Resource(ResourceError),
    Room(RoomError),
    /// The operation needs exclusive access but other handles are live.
    Busy(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Store(e) => write!(f, "Store error: {e}"),
            CacheError::Resource(e) => write!(f, "Resource error: {e}"),
            CacheError::Room(e) => write!(f, "Room error: {e}"),
            CacheError::Busy(what) => write!(f, "Busy: {what}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        CacheError::Store(e)
    }
}

impl From<ResourceError> for CacheError {
    fn from(e: ResourceError) -> Self {
        CacheError::Resource(e)
    }
}

impl From<RoomError> for CacheError {
    fn from(e: RoomError) -> Self {
        CacheError::Room(e)
    }
}

/// Result of [`ConnectionCache::create`]. Identifier problems are
/// expected outcomes, not errors.
pub enum CreateOutcome {
    Created(ConnectionHandle),
    AlreadyExists(DocId),
    InvalidIdentifier(String),
}

struct Slot {
    id: DocId,
    resource: Arc<Resource>,
    manager: SyncManager,
    refcount: AtomicUsize,
}

struct CacheInner {
    session: Session,
    svc: Arc<dyn RoomService>,
    store: Arc<LocalDocumentStore>,
    cfg: SyncConfig,
    slots: StdMutex<HashMap<DocId, Arc<Slot>>>,
    /// Serializes slot construction; never held while a slot exists.
    build_lock: tokio::sync::Mutex<()>,
}

/// Shared, cloneable entry point for opening documents.
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

impl ConnectionCache {
    pub fn new(
        session: Session,
        svc: Arc<dyn RoomService>,
        store: Arc<LocalDocumentStore>,
        cfg: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                session,
                svc,
                store,
                cfg,
                slots: StdMutex::new(HashMap::new()),
                build_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn store(&self) -> &Arc<LocalDocumentStore> {
        &self.inner.store
    }

    /// Open a document, reusing the live connection when one exists.
    ///
    /// Unknown ids are registered as remote-created documents and start
    /// with an empty local state; the sync manager fills them in once the
    /// room is reachable.
    pub async fn load(&self, id: &DocId) -> Result<ConnectionHandle, CacheError> {
        if let Some(handle) = self.try_acquire(id) {
            return Ok(handle);
        }
        let _guard = self.inner.build_lock.lock().await;
        if let Some(handle) = self.try_acquire(id) {
            return Ok(handle);
        }
        if !self.inner.store.contains(id) {
            self.inner.store.create_document_from_remote(id)?;
        }
        self.build_slot(id)
    }

    /// Create a new local-first document owned by this session's user.
    pub async fn create(&self, name: &str, kind: &str) -> Result<CreateOutcome, CacheError> {
        let id = match DocId::new(&self.inner.session.user, name) {
            Ok(id) => id,
            Err(_) => return Ok(CreateOutcome::InvalidIdentifier(name.to_string())),
        };
        let _guard = self.inner.build_lock.lock().await;
        if self.inner.store.contains(&id) {
            return Ok(CreateOutcome::AlreadyExists(id));
        }
        // A room under this alias means someone (possibly an earlier
        // install of this user) already published the name. Offline is
        // not a conflict; creation proceeds locally.
        match self.inner.svc.resolve_alias(id.as_str()).await {
            Ok(_) => return Ok(CreateOutcome::AlreadyExists(id)),
            Err(RoomError::NotFound(_)) | Err(RoomError::Offline) => {}
            Err(e) => {
                log::warn!("{id}: alias probe failed, creating locally anyway: {e}");
            }
        }
        self.inner.store.create_document(&id)?;
        let handle = self.build_slot(&id)?;
        handle.resource().create(kind);
        self.inner
            .store
            .save_state(&id, &handle.resource().encode_full_state())?;
        Ok(CreateOutcome::Created(handle))
    }

    /// Copy a document's current state into a new document named
    /// `{name}-{suffix}` under this session's user. The fork shares no
    /// room with its origin.
    pub async fn fork(&self, handle: &ConnectionHandle) -> Result<ConnectionHandle, CacheError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", handle.id().name(), &suffix[..8]);
        let id = DocId::new(&self.inner.session.user, &name)?;
        {
            let _guard = self.inner.build_lock.lock().await;
            self.inner.store.create_document(&id)?;
            self.inner
                .store
                .save_state(&id, &handle.resource().encode_full_state())?;
        }
        self.load(&id).await
    }

    /// Discard local changes and reload from the last synced checkpoint.
    ///
    /// Consumes the handle; fails with [`CacheError::Busy`] when other
    /// handles on the same document are still live, since those would
    /// keep feeding the state being discarded.
    pub async fn revert(&self, handle: ConnectionHandle) -> Result<ConnectionHandle, CacheError> {
        let id = handle.id().clone();
        if handle.slot.refcount.load(Ordering::SeqCst) != 1 {
            return Err(CacheError::Busy(format!("{id} has other live handles")));
        }
        drop(handle);
        {
            let _guard = self.inner.build_lock.lock().await;
            self.inner.store.restore_checkpoint(&id)?;
        }
        self.load(&id).await
    }

    fn try_acquire(&self, id: &DocId) -> Option<ConnectionHandle> {
        let slots = self.inner.slots.lock().unwrap();
        let slot = slots.get(id)?.clone();
        slot.refcount.fetch_add(1, Ordering::SeqCst);
        Some(ConnectionHandle {
            slot,
            cache: self.clone(),
        })
    }

    /// Hydrate, attach, and register a slot. Caller holds `build_lock`
    /// and has ensured the document exists in the store.
    fn build_slot(&self, id: &DocId) -> Result<ConnectionHandle, CacheError> {
        let resource = Resource::new(id.clone())?;
        self.inner.store.load_document(id, &resource)?;
        let manager = SyncManager::attach(
            resource.clone(),
            self.inner.store.clone(),
            self.inner.svc.clone(),
            self.inner.session.user.clone(),
            self.inner.cfg.clone(),
        );
        let slot = Arc::new(Slot {
            id: id.clone(),
            resource,
            manager,
            refcount: AtomicUsize::new(1),
        });
        self.inner
            .slots
            .lock()
            .unwrap()
            .insert(id.clone(), slot.clone());
        Ok(ConnectionHandle {
            slot,
            cache: self.clone(),
        })
    }

    fn release(&self, slot: &Arc<Slot>) {
        let mut slots = self.inner.slots.lock().unwrap();
        if slot.refcount.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        // A revert may already have replaced this id's slot; only remove
        // the entry we actually own.
        if let Some(current) = slots.get(&slot.id) {
            if Arc::ptr_eq(current, slot) {
                slots.remove(&slot.id);
            }
        }
        drop(slots);
        slot.manager.detach();
        // Edits still buffered or queued at teardown must not evaporate
        // with the sync task; persist the full state before unloading.
        if let Err(e) = self
            .inner
            .store
            .save_state(&slot.id, &slot.resource.encode_full_state())
        {
            log::warn!("{}: final persist failed: {e}", slot.id);
        }
        self.inner.store.unload(&slot.id);
        log::debug!("{}: connection released", slot.id);
    }
}

/// Refcounted lease on a cached document connection.
pub struct ConnectionHandle {
    slot: Arc<Slot>,
    cache: ConnectionCache,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.slot.id)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> &DocId {
        &self.slot.id
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.slot.resource
    }

    pub fn status(&self) -> watch::Receiver<DocStatus> {
        self.slot.manager.status()
    }

    pub fn can_write(&self) -> watch::Receiver<bool> {
        self.slot.manager.can_write()
    }

    /// True while write access is denied and local changes cannot reach
    /// the room; the cue to offer [`ConnectionCache::fork`].
    pub fn needs_fork(&self) -> watch::Receiver<bool> {
        self.slot.manager.needs_fork()
    }

    /// Add a reference to `target`, optionally dropping a backreference
    /// notice into the target's inbox so its owner can validate the link.
    ///
    /// The notice is appended through a transient connection. Its upload
    /// may not complete before that connection is torn down, so the
    /// target is stamped dirty and persisted; the background syncer
    /// finishes the delivery.
    pub async fn add_ref(
        &self,
        def: &RefDef,
        target: &DocId,
        index: Option<usize>,
        notify: bool,
    ) -> Result<Ref, CacheError> {
        let added = self.slot.resource.add_ref(def, target, index)?;
        if notify {
            let notice = self.slot.resource.backref_notice(def);
            let target_handle = self.cache.load(target).await?;
            target_handle.resource().append_inbox(&notice)?;
            let store = self.cache.store();
            store.note_local_update(target)?;
            store.save_state(target, &target_handle.resource().encode_full_state())?;
        }
        Ok(added)
    }

    pub fn get_refs(&self, def: &RefDef) -> Vec<Ref> {
        self.slot.resource.get_refs(def)
    }

    pub fn remove_ref(&self, def: &RefDef, target: &DocId) -> bool {
        self.slot.resource.remove_ref(def, target)
    }

    pub fn move_ref(
        &self,
        def: &RefDef,
        target: &DocId,
        new_index: usize,
    ) -> Result<Option<Ref>, ResourceError> {
        self.slot.resource.move_ref(def, target, new_index)
    }
}

impl Clone for ConnectionHandle {
    fn clone(&self) -> Self {
        self.slot.refcount.fetch_add(1, Ordering::SeqCst);
        Self {
            slot: self.slot.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cache.release(&self.slot);
    }
}
