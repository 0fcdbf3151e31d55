//! End-to-end reference validation across two users sharing a room
//! transport: the referring side leaves a notice in the target's inbox,
//! and the target's validator resolves it against the live source.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use tessera_sync::{
    BackgroundSyncer, ConnectionCache, ConnectionHandle, CreateOutcome, InboxMessage,
    InboxValidator, LocalDocumentStore, MemoryRoom, MessageState, RefDef, Relation, RoomService,
    Session, StoreConfig, SyncConfig,
};

struct Peer {
    _dir: TempDir,
    cache: ConnectionCache,
}

fn peer(user: &str, svc: &Arc<MemoryRoom>) -> Peer {
    let dir = TempDir::new().unwrap();
    let store = LocalDocumentStore::open(StoreConfig::for_testing(dir.path(), user)).unwrap();
    let cache = ConnectionCache::new(
        Session {
            user: user.to_string(),
        },
        svc.clone() as Arc<dyn RoomService>,
        store,
        SyncConfig::for_testing(),
    );
    Peer { _dir: dir, cache }
}

async fn wait_for(mut check: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

async fn created(cache: &ConnectionCache, name: &str, kind: &str) -> ConnectionHandle {
    match cache.create(name, kind).await.unwrap() {
        CreateOutcome::Created(handle) => handle,
        _ => panic!("creation of {name} did not succeed"),
    }
}

async fn wait_published(cache: &ConnectionCache, handle: &ConnectionHandle) {
    let id = handle.id().clone();
    let store = cache.store().clone();
    wait_for(
        move || {
            store
                .meta(&id)
                .map(|m| m.exists_at_remote && m.needs_save_since.is_none())
                .unwrap_or(false)
        },
        "document never published",
    )
    .await;
}

fn link_def() -> RefDef {
    RefDef::new("app", "link", Relation::Many, false)
}

#[tokio::test]
async fn test_notice_backed_reference_becomes_valid() {
    let svc = Arc::new(MemoryRoom::new());
    let alice = peer("alice", &svc);
    let bob = peer("bob", &svc);

    let target = created(&bob.cache, "target", "journal").await;
    let source = created(&alice.cache, "src", "journal").await;
    wait_published(&bob.cache, &target).await;
    wait_published(&alice.cache, &source).await;

    let def = link_def();
    let validator = InboxValidator::new(target.clone(), def.clone(), bob.cache.clone());

    // The notice goes through a transient connection on alice's side;
    // her background syncer completes the upload after it is torn down.
    let _alice_syncer = BackgroundSyncer::spawn(alice.cache.clone(), Duration::from_millis(30));
    source.add_ref(&def, target.id(), None, true).await.unwrap();

    wait_for(
        || {
            validator
                .states()
                .values()
                .any(|s| *s == MessageState::Valid)
        },
        "claim never became valid",
    )
    .await;

    let valid = validator.valid_ref_messages();
    assert_eq!(valid.len(), 1);
    assert_eq!(valid[0].source, source.id().as_str());
    assert_eq!(valid[0].namespace, "app");
}

#[tokio::test]
async fn test_removing_reference_invalidates_claim() {
    let svc = Arc::new(MemoryRoom::new());
    let alice = peer("alice", &svc);
    let bob = peer("bob", &svc);

    let target = created(&bob.cache, "target", "journal").await;
    let source = created(&alice.cache, "src", "journal").await;
    wait_published(&bob.cache, &target).await;
    wait_published(&alice.cache, &source).await;

    let def = link_def();
    let validator = InboxValidator::new(target.clone(), def.clone(), bob.cache.clone());
    let _alice_syncer = BackgroundSyncer::spawn(alice.cache.clone(), Duration::from_millis(30));
    source.add_ref(&def, target.id(), None, true).await.unwrap();

    wait_for(
        || {
            validator
                .states()
                .values()
                .any(|s| *s == MessageState::Valid)
        },
        "claim never became valid",
    )
    .await;
    let msg_id = *validator.states().keys().next().unwrap();

    assert!(source.resource().remove_ref(&def, target.id()));
    wait_for(
        || validator.state_of(&msg_id) == Some(MessageState::Invalid),
        "removal never demoted the claim",
    )
    .await;
    assert!(validator.valid_ref_messages().is_empty());
}

#[tokio::test]
async fn test_forged_claim_is_permanently_rejected() {
    let svc = Arc::new(MemoryRoom::new());
    let alice = peer("alice", &svc);
    let bob = peer("bob", &svc);

    let target = created(&bob.cache, "target", "journal").await;
    let source = created(&alice.cache, "src", "journal").await;
    wait_published(&bob.cache, &target).await;
    wait_published(&alice.cache, &source).await;

    let def = link_def();
    let validator = InboxValidator::new(target.clone(), def.clone(), bob.cache.clone());

    // Anyone with room access can append; this claim names a clock the
    // source has trivially reached but no reference exists there.
    let forged = InboxMessage {
        message_type: "ref".to_string(),
        id: Uuid::new_v4(),
        namespace: def.namespace.clone(),
        kind: def.kind.clone(),
        source: source.id().as_str().to_string(),
        clock: "0:0".to_string(),
    };
    target.resource().append_inbox(&forged).unwrap();

    wait_for(
        || validator.state_of(&forged.id) == Some(MessageState::Invalid),
        "forged claim never rejected",
    )
    .await;

    // A genuine reference added afterwards does not resurrect the lie.
    source.add_ref(&def, target.id(), None, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        validator.state_of(&forged.id),
        Some(MessageState::Invalid)
    );
    assert!(validator.valid_ref_messages().is_empty());
}
