//! Sync orchestrator: attaches one resource to its remote room.
//!
//! Attach sequence: snapshot the local delete set, resolve the alias
//! (creating the room when this user owns the document), replay remote
//! history, then reconcile. The local-minus-remote diff is uploaded only
//! when it is neither empty nor exactly the pre-attach delete set; a
//! true resume therefore performs no redundant write on reconnect.
//!
//! Document-unavailable is a distinct state from transport-offline:
//! not-found retries on a slow timer, offline on a fast one.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::resource::{DocId, Resource, ResourceUpdate, UpdateOrigin};
use crate::room::{Payload, RoomError, RoomId, RoomService, Visibility};
use crate::store::LocalDocumentStore;
use crate::sync::reader::{catch_up, RoomReader};
use crate::sync::writer::ThrottledWriter;
use crate::sync::{is_empty_update, SyncConfig};

/// Observable document state, distinct from write permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStatus {
    /// Attach in progress
    Loading,
    /// Hydrated and live-syncing
    Available,
    /// Remote document absent; retried on a slow timer
    NotFound,
    /// Transport unreachable; retried on a fast timer
    Offline,
}

/// Drives hydrate, reconcile, and live sync for one attached document.
pub struct SyncManager {
    status_rx: watch::Receiver<DocStatus>,
    can_write_rx: watch::Receiver<bool>,
    needs_fork_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl SyncManager {
    /// Attach `resource` to its room and start syncing.
    ///
    /// The resource must already be hydrated from local persistence; the
    /// connection cache owns that step.
    pub fn attach(
        resource: Arc<Resource>,
        store: Arc<LocalDocumentStore>,
        svc: Arc<dyn RoomService>,
        user: String,
        cfg: SyncConfig,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(DocStatus::Loading);
        let status_tx = Arc::new(status_tx);
        let can_write_tx = Arc::new(watch::channel(true).0);
        let can_write_rx = can_write_tx.subscribe();
        let needs_fork_tx = Arc::new(watch::channel(false).0);
        let needs_fork_rx = needs_fork_tx.subscribe();

        // Subscribe before the task runs so edits made right after
        // attach are buffered rather than dropped; the live loop drains
        // them once reconciliation is done.
        let updates_rx = resource.subscribe();
        let task = tokio::spawn(run(
            resource,
            store,
            svc,
            user,
            cfg,
            status_tx,
            can_write_tx,
            needs_fork_tx,
            updates_rx,
        ));
        Self {
            status_rx,
            can_write_rx,
            needs_fork_rx,
            task,
        }
    }

    pub fn status(&self) -> watch::Receiver<DocStatus> {
        self.status_rx.clone()
    }

    pub fn can_write(&self) -> watch::Receiver<bool> {
        self.can_write_rx.clone()
    }

    /// True while write access is denied and local changes are stranded
    /// (queued fragments or a dirty store record). The caller's cue to
    /// offer forking the document.
    pub fn needs_fork(&self) -> watch::Receiver<bool> {
        self.needs_fork_rx.clone()
    }

    /// Abort the poll and flush tasks and drop all subscriptions.
    pub fn detach(&self) {
        self.task.abort();
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    resource: Arc<Resource>,
    store: Arc<LocalDocumentStore>,
    svc: Arc<dyn RoomService>,
    user: String,
    cfg: SyncConfig,
    status_tx: Arc<watch::Sender<DocStatus>>,
    can_write_tx: Arc<watch::Sender<bool>>,
    needs_fork_tx: Arc<watch::Sender<bool>>,
    mut updates_rx: broadcast::Receiver<ResourceUpdate>,
) {
    let id = resource.id().clone();
    // Captured before any remote payload touches the document; the
    // resume check below compares against exactly this.
    let deletion_set = resource.deletion_set();

    let room = resolve_room(&svc, &id, &user, &cfg, &status_tx).await;

    let caught = loop {
        match catch_up(svc.as_ref(), &room, cfg.history_page_size).await {
            Ok(caught) => break caught,
            Err(RoomError::Offline) => {
                status_tx.send_replace(DocStatus::Offline);
                tokio::time::sleep(cfg.offline_retry).await;
            }
            Err(e) => {
                log::warn!("{id}: history fetch failed: {e}");
                tokio::time::sleep(cfg.offline_retry).await;
            }
        }
    };

    let remote_updates: Vec<Vec<u8>> = caught
        .events
        .iter()
        .map(|event| match &event.payload {
            Payload::Update { update, .. } => update.clone(),
            Payload::Snapshot { update } => update.clone(),
        })
        .collect();
    for update in &remote_updates {
        if let Err(e) = resource.apply_remote_update(update) {
            log::warn!("{id}: skipping undecodable remote update: {e}");
        }
    }

    let remote_sv = state_vector_of(&remote_updates);
    let missing_local = resource.encode_diff(&remote_sv);
    let resume_only = is_empty_update(&missing_local) || missing_local == deletion_set;

    let (flushed_tx, mut flushed_rx) = mpsc::unbounded_channel();
    let writer = ThrottledWriter::spawn(
        svc.clone(),
        room.clone(),
        user.clone(),
        resource.client_id(),
        &cfg,
        can_write_tx.clone(),
        flushed_tx,
    );
    if resume_only {
        log::debug!("{id}: resume, nothing to upload");
    } else {
        log::debug!("{id}: uploading {} missing bytes", missing_local.len());
        if let Err(e) = store.note_local_update(&id) {
            log::warn!("{id}: dirty stamp failed: {e}");
        }
        writer.enqueue(missing_local);
    }

    if let Err(e) = store.save_state(&id, &resource.encode_full_state()) {
        log::warn!("{id}: persist failed: {e}");
    }
    if resume_only {
        // Local and remote agree, so whatever dirty stamp is left over
        // (an offline create, a torn-down transient write that did reach
        // the log) is already covered.
        if let Err(e) = store.mark_synced(&id) {
            log::warn!("{id}: mark synced failed: {e}");
        }
    }
    status_tx.send_replace(DocStatus::Available);
    log::info!("{id}: attached to {room}");

    let mut reader = RoomReader::new(svc.clone(), room.clone(), caught.token, &cfg);
    let mut can_write_rx = can_write_tx.subscribe();
    let mut since_snapshot = caught.updates_since_snapshot;

    loop {
        tokio::select! {
            events = reader.next() => {
                for event in events {
                    match event.payload {
                        Payload::Update { replica, update } => {
                            if let Err(e) = resource.apply_remote_update(&update) {
                                log::warn!("{id}: bad remote update: {e}");
                            }
                            since_snapshot += 1;
                            // The replica whose event lands on the
                            // boundary posts the compaction snapshot.
                            if cfg.snapshot_interval > 0
                                && since_snapshot % cfg.snapshot_interval == 0
                                && replica == resource.client_id()
                            {
                                let snapshot = resource.encode_full_state();
                                log::debug!("{id}: posting compaction snapshot");
                                if let Err(e) = svc
                                    .send(&room, &user, Payload::Snapshot { update: snapshot })
                                    .await
                                {
                                    log::debug!("{id}: snapshot post failed: {e}");
                                }
                            }
                        }
                        Payload::Snapshot { update } => {
                            if let Err(e) = resource.apply_remote_update(&update) {
                                log::warn!("{id}: bad remote snapshot: {e}");
                            }
                            since_snapshot = 0;
                        }
                    }
                }
                if let Err(e) = store.save_state(&id, &resource.encode_full_state()) {
                    log::warn!("{id}: persist failed: {e}");
                }
            }
            received = updates_rx.recv() => match received {
                Ok(u) if u.origin == UpdateOrigin::Local => {
                    if let Err(e) = store.note_local_update(&id) {
                        log::warn!("{id}: dirty stamp failed: {e}");
                    }
                    // On disk before it is sent; an edit made while
                    // offline or write-denied must survive teardown.
                    if let Err(e) = store.save_state(&id, &resource.encode_full_state()) {
                        log::warn!("{id}: persist failed: {e}");
                    }
                    writer.enqueue(u.update);
                    update_needs_fork(&needs_fork_tx, &can_write_tx, &writer, &store, &id);
                }
                Ok(_) => {
                    // Remote-origin updates are never echoed back out.
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("{id}: update stream lagged by {n}, resyncing full state");
                    writer.enqueue(resource.encode_full_state());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = flushed_rx.recv() => {
                if let Err(e) = store.save_state(&id, &resource.encode_full_state()) {
                    log::warn!("{id}: persist failed: {e}");
                }
                // Fragments queued behind the confirmed flush keep the
                // document dirty until their own confirmation.
                if writer.queued() == 0 {
                    if let Err(e) = store.mark_synced(&id) {
                        log::warn!("{id}: mark synced failed: {e}");
                    }
                }
                update_needs_fork(&needs_fork_tx, &can_write_tx, &writer, &store, &id);
            }
            changed = can_write_rx.changed() => {
                if changed.is_ok() {
                    update_needs_fork(&needs_fork_tx, &can_write_tx, &writer, &store, &id);
                }
            }
        }
    }
}

/// Recompute the needs-fork flag: write access denied while local
/// changes exist that cannot reach the room.
fn update_needs_fork(
    needs_fork_tx: &watch::Sender<bool>,
    can_write_tx: &watch::Sender<bool>,
    writer: &ThrottledWriter,
    store: &LocalDocumentStore,
    id: &DocId,
) {
    let stranded = !*can_write_tx.borrow()
        && (writer.queued() > 0
            || store
                .meta(id)
                .map(|m| m.needs_save_since.is_some())
                .unwrap_or(false));
    needs_fork_tx.send_if_modified(|current| {
        if *current != stranded {
            *current = stranded;
            true
        } else {
            false
        }
    });
}

/// Resolve the room alias, retrying until it succeeds. A document owned
/// by this user gets its room created on first attach.
async fn resolve_room(
    svc: &Arc<dyn RoomService>,
    id: &DocId,
    user: &str,
    cfg: &SyncConfig,
    status_tx: &watch::Sender<DocStatus>,
) -> RoomId {
    let alias = id.as_str();
    loop {
        match svc.resolve_alias(alias).await {
            Ok(room) => return room,
            Err(RoomError::NotFound(_)) if id.owner() == user => {
                match svc.create_room(alias, Visibility::Public, user).await {
                    Ok(room) => {
                        log::info!("{id}: created room {room}");
                        return room;
                    }
                    // Lost a creation race; the next resolve wins.
                    Err(RoomError::AlreadyExists(_)) => continue,
                    Err(RoomError::Offline) => {
                        status_tx.send_replace(DocStatus::Offline);
                        tokio::time::sleep(cfg.offline_retry).await;
                    }
                    Err(e) => {
                        log::warn!("{id}: room creation failed: {e}");
                        status_tx.send_replace(DocStatus::NotFound);
                        tokio::time::sleep(cfg.not_found_retry).await;
                    }
                }
            }
            Err(RoomError::NotFound(_)) => {
                status_tx.send_replace(DocStatus::NotFound);
                tokio::time::sleep(cfg.not_found_retry).await;
            }
            Err(RoomError::Offline) => {
                status_tx.send_replace(DocStatus::Offline);
                tokio::time::sleep(cfg.offline_retry).await;
            }
            Err(e) => {
                log::warn!("{id}: alias resolution failed: {e}");
                tokio::time::sleep(cfg.offline_retry).await;
            }
        }
    }
}

/// State vector covered by a set of update blobs, computed on a scratch
/// document.
fn state_vector_of(updates: &[Vec<u8>]) -> StateVector {
    let scratch = Doc::new();
    let mut txn = scratch.transact_mut();
    for update in updates {
        match Update::decode_v1(update) {
            Ok(decoded) => {
                let _ = txn.apply_update(decoded);
            }
            Err(e) => log::warn!("undecodable update in history: {e}"),
        }
    }
    txn.state_vector()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::MemoryRoom;
    use crate::store::StoreConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn wait_for_status(manager: &SyncManager, want: DocStatus) {
        let mut rx = manager.status();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if *rx.borrow() == want {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "status never became {want:?}, stuck at {:?}",
                *rx.borrow()
            );
            let _ = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        }
    }

    struct Peer {
        _dir: TempDir,
        store: Arc<LocalDocumentStore>,
    }

    fn peer(user: &str) -> Peer {
        let dir = TempDir::new().unwrap();
        let store = LocalDocumentStore::open(StoreConfig::for_testing(dir.path(), user)).unwrap();
        Peer { _dir: dir, store }
    }

    fn attach(
        peer: &Peer,
        svc: &Arc<MemoryRoom>,
        id: &DocId,
        user: &str,
    ) -> (Arc<Resource>, SyncManager) {
        if !peer.store.contains(id) {
            peer.store.create_document_from_remote(id).unwrap();
        }
        let resource = Resource::new(id.clone()).unwrap();
        peer.store.load_document(id, &resource).unwrap();
        let manager = SyncManager::attach(
            resource.clone(),
            peer.store.clone(),
            svc.clone() as Arc<dyn RoomService>,
            user.to_string(),
            SyncConfig::for_testing(),
        );
        (resource, manager)
    }

    #[tokio::test]
    async fn test_owner_attach_creates_room_and_flushes_edits() {
        let svc = Arc::new(MemoryRoom::new());
        let alice = peer("alice");
        let id: DocId = "@alice/doc".parse().unwrap();
        alice.store.create_document(&id).unwrap();

        let resource = Resource::new(id.clone()).unwrap();
        alice.store.load_document(&id, &resource).unwrap();
        let manager = SyncManager::attach(
            resource.clone(),
            alice.store.clone(),
            svc.clone() as Arc<dyn RoomService>,
            "alice".to_string(),
            SyncConfig::for_testing(),
        );
        wait_for_status(&manager, DocStatus::Available).await;

        resource.set_meta("title", "hello");
        let room = svc.resolve_alias(id.as_str()).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while svc.log_len(&room) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "edit never flushed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Confirmed flush clears the dirty stamp and checkpoints.
        while alice.store.meta(&id).unwrap().needs_save_since.is_some() {
            assert!(tokio::time::Instant::now() < deadline, "never marked synced");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(alice.store.meta(&id).unwrap().exists_at_remote);
    }

    #[tokio::test]
    async fn test_two_replicas_converge() {
        let svc = Arc::new(MemoryRoom::new());
        let alice = peer("alice");
        let bob = peer("bob");
        let id: DocId = "@alice/shared".parse().unwrap();

        alice.store.create_document(&id).unwrap();
        let (doc_a, mgr_a) = attach(&alice, &svc, &id, "alice");
        wait_for_status(&mgr_a, DocStatus::Available).await;

        let (doc_b, mgr_b) = attach(&bob, &svc, &id, "bob");
        wait_for_status(&mgr_b, DocStatus::Available).await;

        doc_a.set_meta("title", "from alice");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while doc_b.get_meta("title").as_deref() != Some("from alice") {
            assert!(tokio::time::Instant::now() < deadline, "never converged");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_non_owner_missing_room_is_not_found() {
        let svc = Arc::new(MemoryRoom::new());
        let bob = peer("bob");
        let id: DocId = "@alice/ghost".parse().unwrap();
        let (_doc, manager) = attach(&bob, &svc, &id, "bob");
        wait_for_status(&manager, DocStatus::NotFound).await;
    }

    #[tokio::test]
    async fn test_offline_then_available() {
        let svc = Arc::new(MemoryRoom::new());
        let alice = peer("alice");
        let id: DocId = "@alice/doc".parse().unwrap();
        alice.store.create_document(&id).unwrap();
        svc.set_offline(true);

        let (_doc, manager) = attach(&alice, &svc, &id, "alice");
        wait_for_status(&manager, DocStatus::Offline).await;

        svc.set_offline(false);
        wait_for_status(&manager, DocStatus::Available).await;
    }

    #[tokio::test]
    async fn test_resume_does_not_reupload() {
        let svc = Arc::new(MemoryRoom::new());
        let alice = peer("alice");
        let id: DocId = "@alice/doc".parse().unwrap();
        alice.store.create_document(&id).unwrap();

        let (doc, manager) = attach(&alice, &svc, &id, "alice");
        wait_for_status(&manager, DocStatus::Available).await;
        doc.set_meta("title", "v1");

        let room = svc.resolve_alias(id.as_str()).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while alice.store.meta(&id).unwrap().needs_save_since.is_some() {
            assert!(tokio::time::Instant::now() < deadline, "never flushed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let flushed_len = svc.log_len(&room);

        manager.detach();
        drop(manager);
        drop(doc);
        alice.store.unload(&id);

        // Fresh attach over the persisted state: nothing new to upload.
        let (_doc2, manager2) = attach(&alice, &svc, &id, "alice");
        wait_for_status(&manager2, DocStatus::Available).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(svc.log_len(&room), flushed_len);
    }

    /// MemoryRoom with a delay on every append, so a second edit can
    /// land while the first flush is still in flight.
    struct SlowSendRoom {
        inner: Arc<MemoryRoom>,
        send_delay: Duration,
    }

    #[async_trait::async_trait]
    impl RoomService for SlowSendRoom {
        async fn resolve_alias(&self, alias: &str) -> Result<RoomId, RoomError> {
            self.inner.resolve_alias(alias).await
        }

        async fn create_room(
            &self,
            alias: &str,
            visibility: Visibility,
            creator: &str,
        ) -> Result<RoomId, RoomError> {
            self.inner.create_room(alias, visibility, creator).await
        }

        async fn history(
            &self,
            room: &RoomId,
            before: Option<u64>,
            limit: usize,
        ) -> Result<crate::room::HistoryPage, RoomError> {
            self.inner.history(room, before, limit).await
        }

        async fn send(&self, room: &RoomId, sender: &str, payload: Payload) -> Result<(), RoomError> {
            tokio::time::sleep(self.send_delay).await;
            self.inner.send(room, sender, payload).await
        }

        async fn events_since(
            &self,
            room: &RoomId,
            token: u64,
            wait: Duration,
        ) -> Result<crate::room::EventBatch, RoomError> {
            self.inner.events_since(room, token, wait).await
        }

        async fn join(&self, room: &RoomId, user: &str) -> Result<(), RoomError> {
            self.inner.join(room, user).await
        }

        async fn can_write(&self, room: &RoomId, user: &str) -> Result<bool, RoomError> {
            self.inner.can_write(room, user).await
        }
    }

    #[tokio::test]
    async fn test_flush_confirmation_skips_queued_fragments() {
        let inner = Arc::new(MemoryRoom::new());
        let svc: Arc<dyn RoomService> = Arc::new(SlowSendRoom {
            inner: inner.clone(),
            send_delay: Duration::from_millis(120),
        });
        let alice = peer("alice");
        let id: DocId = "@alice/doc".parse().unwrap();
        alice.store.create_document(&id).unwrap();
        let resource = Resource::new(id.clone()).unwrap();
        alice.store.load_document(&id, &resource).unwrap();
        let manager = SyncManager::attach(
            resource.clone(),
            alice.store.clone(),
            svc,
            "alice".to_string(),
            SyncConfig::for_testing(),
        );
        wait_for_status(&manager, DocStatus::Available).await;

        resource.set_meta("a", "1");
        // Lands while the first flush is still inside the append delay.
        tokio::time::sleep(Duration::from_millis(60)).await;
        resource.set_meta("b", "2");

        let room = inner.resolve_alias(id.as_str()).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let clean = alice.store.meta(&id).unwrap().needs_save_since.is_none();
            if clean {
                assert!(
                    inner.log_len(&room) >= 2,
                    "marked synced while a fragment was still queued"
                );
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "second edit never flushed"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
