//! Resource entity: a replicated document with typed metadata, a
//! reference table, and an append-only backreference inbox.
//!
//! Layout inside the shared Yrs document:
//! - `meta`: map holding `type`, `created_at`, free-form metadata keys
//! - `refs`: map of RefKey -> JSON-encoded [`Ref`]
//! - `inbox`: array of JSON-encoded [`InboxMessage`], append-only
//!
//! RefKey is deterministic: `"{ns}:{kind}"` for unique relations and
//! `"{ns}:{kind}:{target}"` for many relations, so re-adding a reference
//! overwrites instead of duplicating.
//!
//! Every committed transaction is fanned out on a broadcast channel as a
//! [`ResourceUpdate`] tagged with its origin. Updates applied through
//! [`Resource::apply_remote_update`] carry the remote origin tag and are
//! never re-echoed back out by the sync adapter.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{
    Any, Array, ArrayRef, Doc, Map, MapRef, Origin, Out, ReadTxn, StateVector, Subscription,
    Transact, Update,
};

use crate::fractional::key_between;
use crate::inbox::InboxMessage;

/// Origin tag attached to transactions that replay remote or persisted state.
const REMOTE_ORIGIN: &str = "remote";

/// Capacity of the per-resource update fan-out channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

// ─── Identifiers ──────────────────────────────────────────────────────

/// Validated document identifier of the form `@owner/name`.
///
/// Owner and name are non-empty and drawn from `[a-z0-9._-]`. The string
/// form doubles as the room alias on the remote message service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocId(String);

impl DocId {
    /// Build an identifier from its owner and name parts.
    pub fn new(owner: &str, name: &str) -> Result<Self, ResourceError> {
        format!("@{owner}/{name}").parse()
    }

    pub fn owner(&self) -> &str {
        let body = &self.0[1..];
        &body[..body.find('/').unwrap_or(body.len())]
    }

    pub fn name(&self) -> &str {
        let body = &self.0[1..];
        &body[body.find('/').map(|i| i + 1).unwrap_or(0)..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for DocId {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ResourceError::InvalidIdentifier(s.to_string());
        let body = s.strip_prefix('@').ok_or_else(invalid)?;
        let (owner, name) = body.split_once('/').ok_or_else(invalid)?;
        if owner.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        let ok = |part: &str| {
            part.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b))
        };
        if !ok(owner) || !ok(name) {
            return Err(invalid());
        }
        Ok(DocId(s.to_string()))
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocId {
    type Error = ResourceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DocId> for String {
    fn from(id: DocId) -> Self {
        id.0
    }
}

// ─── References ───────────────────────────────────────────────────────

/// How many targets a reference definition admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Unique,
    Many,
}

/// A reference definition: namespace, kind, cardinality, ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefDef {
    pub namespace: String,
    pub kind: String,
    pub relation: Relation,
    pub sorted: bool,
}

impl RefDef {
    pub fn new(namespace: &str, kind: &str, relation: Relation, sorted: bool) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            relation,
            sorted,
        }
    }

    /// Deterministic map key for a reference under this definition.
    ///
    /// Unique relations key on the definition alone so repointing
    /// overwrites; many relations include the target.
    pub fn key_for(&self, target: &DocId) -> String {
        match self.relation {
            Relation::Unique => format!("{}:{}", self.namespace, self.kind),
            Relation::Many => format!("{}:{}:{}", self.namespace, self.kind, target),
        }
    }

    fn matches(&self, r: &Ref) -> bool {
        r.namespace == self.namespace && r.kind == self.kind
    }
}

/// A stored reference to another document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ref {
    pub id: Uuid,
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub relation: Relation,
    pub sorted: bool,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<String>,
}

// ─── Update fan-out ───────────────────────────────────────────────────

/// Where a document update originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// One committed transaction, broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct ResourceUpdate {
    pub origin: UpdateOrigin,
    pub update: Vec<u8>,
}

// ─── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ResourceError {
    /// Malformed document identifier
    InvalidIdentifier(String),
    /// Underlying CRDT substrate failure
    Substrate(String),
    /// JSON encode/decode failure inside a replicated container
    Serialization(String),
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceError::InvalidIdentifier(s) => write!(f, "Invalid identifier: {s}"),
            ResourceError::Substrate(e) => write!(f, "Substrate error: {e}"),
            ResourceError::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for ResourceError {}

impl From<serde_json::Error> for ResourceError {
    fn from(e: serde_json::Error) -> Self {
        ResourceError::Serialization(e.to_string())
    }
}

// ─── Resource ─────────────────────────────────────────────────────────

/// A resource entity over one replicated document.
///
/// All mutation methods take `&self`; transactions serialize on the
/// document's internal lock. The sync adapter is the only remote writer,
/// so one logical mutator runs at a time.
pub struct Resource {
    id: DocId,
    doc: Doc,
    meta: MapRef,
    refs: MapRef,
    inbox: ArrayRef,
    updates_tx: broadcast::Sender<ResourceUpdate>,
    _update_sub: Subscription,
}

impl Resource {
    pub fn new(id: DocId) -> Result<Arc<Self>, ResourceError> {
        Self::build(id, Doc::new())
    }

    /// Fixed replica id, used by tests that assert on clocks.
    pub fn with_client_id(id: DocId, client_id: u64) -> Result<Arc<Self>, ResourceError> {
        Self::build(id, Doc::with_client_id(client_id))
    }

    fn build(id: DocId, doc: Doc) -> Result<Arc<Self>, ResourceError> {
        let meta = doc.get_or_insert_map("meta");
        let refs = doc.get_or_insert_map("refs");
        let inbox = doc.get_or_insert_array("inbox");

        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let tx = updates_tx.clone();
        let remote = Origin::from(REMOTE_ORIGIN);
        let sub = doc
            .observe_update_v1(move |txn, event| {
                let origin = if txn.origin() == Some(&remote) {
                    UpdateOrigin::Remote
                } else {
                    UpdateOrigin::Local
                };
                // No receivers is fine; the send result only signals that.
                let _ = tx.send(ResourceUpdate {
                    origin,
                    update: event.update.clone(),
                });
            })
            .map_err(|e| ResourceError::Substrate(e.to_string()))?;

        Ok(Arc::new(Self {
            id,
            doc,
            meta,
            refs,
            inbox,
            updates_tx,
            _update_sub: sub,
        }))
    }

    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// Replica id of this document instance.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Subscribe to committed updates, both local and remote.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceUpdate> {
        self.updates_tx.subscribe()
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Assign the resource type and creation timestamp.
    ///
    /// # Panics
    ///
    /// Panics if the type was already set. Type assignment happens
    /// exactly once, at creation.
    pub fn create(&self, kind: &str) {
        if let Some(existing) = self.kind() {
            panic!(
                "resource {} already has type {existing:?}, cannot create as {kind:?}",
                self.id
            );
        }
        let mut txn = self.doc.transact_mut();
        self.meta.insert(&mut txn, "type", kind.to_string());
        self.meta
            .insert(&mut txn, "created_at", now_ms().to_string());
    }

    pub fn kind(&self) -> Option<String> {
        let txn = self.doc.transact();
        read_string(self.meta.get(&txn, "type"))
    }

    pub fn created_at(&self) -> Option<u64> {
        let txn = self.doc.transact();
        read_string(self.meta.get(&txn, "created_at")).and_then(|s| s.parse().ok())
    }

    pub fn set_meta(&self, key: &str, value: &str) {
        let mut txn = self.doc.transact_mut();
        self.meta.insert(&mut txn, key, value.to_string());
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        read_string(self.meta.get(&txn, key))
    }

    // ─── References ───────────────────────────────────────────────────

    /// Write a reference to `target` under `def`.
    ///
    /// For sorted definitions the sort key is a fractional index between
    /// the neighbors at `index`; with `index` omitted the reference is
    /// appended after the current last entry. Re-adding an existing
    /// (definition, target) pair overwrites it, the newer sort key wins.
    pub fn add_ref(
        &self,
        def: &RefDef,
        target: &DocId,
        index: Option<usize>,
    ) -> Result<Ref, ResourceError> {
        let sort_key = if def.sorted {
            let siblings = self.refs_excluding(def, Some(target));
            Some(key_at_index(&siblings, index))
        } else {
            None
        };

        let r = Ref {
            id: Uuid::new_v4(),
            namespace: def.namespace.clone(),
            kind: def.kind.clone(),
            relation: def.relation,
            sorted: def.sorted,
            target: target.as_str().to_string(),
            sort_key,
        };
        let encoded = serde_json::to_string(&r)?;
        let mut txn = self.doc.transact_mut();
        self.refs.insert(&mut txn, def.key_for(target), encoded);
        Ok(r)
    }

    /// All references matching `def`, sorted by sort key ascending with
    /// ties broken by target. The order is deterministic across replicas.
    pub fn get_refs(&self, def: &RefDef) -> Vec<Ref> {
        self.refs_excluding(def, None)
    }

    /// The reference for a specific (definition, target) pair, if any.
    pub fn ref_for(&self, def: &RefDef, target: &DocId) -> Option<Ref> {
        let txn = self.doc.transact();
        let raw = read_string(self.refs.get(&txn, &def.key_for(target)))?;
        drop(txn);
        let r: Ref = serde_json::from_str(&raw).ok()?;
        (def.matches(&r) && r.target == target.as_str()).then_some(r)
    }

    /// Remove the reference for (def, target). Returns whether one existed.
    pub fn remove_ref(&self, def: &RefDef, target: &DocId) -> bool {
        let mut txn = self.doc.transact_mut();
        self.refs.remove(&mut txn, &def.key_for(target)).is_some()
    }

    /// Reposition an existing reference within its sorted siblings.
    ///
    /// # Panics
    ///
    /// Panics if the definition is not sorted or not a many relation;
    /// index-based moves are meaningless there.
    pub fn move_ref(
        &self,
        def: &RefDef,
        target: &DocId,
        new_index: usize,
    ) -> Result<Option<Ref>, ResourceError> {
        assert!(
            def.sorted && def.relation == Relation::Many,
            "move_ref on unsorted or unique definition {}:{}",
            def.namespace,
            def.kind
        );
        let Some(mut r) = self.ref_for(def, target) else {
            return Ok(None);
        };
        let siblings = self.refs_excluding(def, Some(target));
        r.sort_key = Some(key_at_index(&siblings, Some(new_index)));
        let encoded = serde_json::to_string(&r)?;
        let mut txn = self.doc.transact_mut();
        self.refs.insert(&mut txn, def.key_for(target), encoded);
        Ok(Some(r))
    }

    fn refs_excluding(&self, def: &RefDef, skip_target: Option<&DocId>) -> Vec<Ref> {
        let txn = self.doc.transact();
        let mut out: Vec<Ref> = Vec::new();
        for (_, value) in self.refs.iter(&txn) {
            let Some(raw) = read_string(Some(value)) else {
                continue;
            };
            let Ok(r) = serde_json::from_str::<Ref>(&raw) else {
                log::warn!("{}: skipping malformed ref entry", self.id);
                continue;
            };
            if !def.matches(&r) {
                continue;
            }
            if skip_target.map(|t| t.as_str()) == Some(r.target.as_str()) {
                continue;
            }
            out.push(r);
        }
        out.sort_by(|a, b| {
            (a.sort_key.as_deref().unwrap_or(""), a.target.as_str())
                .cmp(&(b.sort_key.as_deref().unwrap_or(""), b.target.as_str()))
        });
        out
    }

    // ─── Inbox ────────────────────────────────────────────────────────

    /// Build a backreference notice for a reference this resource holds.
    ///
    /// The clock is this replica's own current sequence, so a validator
    /// on the target side can wait until it has synced the update that
    /// carried the reference before judging it.
    pub fn backref_notice(&self, def: &RefDef) -> InboxMessage {
        let replica = self.doc.client_id();
        let seq = {
            let txn = self.doc.transact();
            txn.state_vector().get(&replica)
        };
        InboxMessage {
            message_type: "ref".to_string(),
            id: Uuid::new_v4(),
            namespace: def.namespace.clone(),
            kind: def.kind.clone(),
            source: self.id.as_str().to_string(),
            clock: format!("{replica}:{seq}"),
        }
    }

    /// Append a message to this resource's public inbox.
    ///
    /// The inbox is append-only; nothing ever removes or rewrites an
    /// entry here.
    pub fn append_inbox(&self, msg: &InboxMessage) -> Result<(), ResourceError> {
        let encoded = serde_json::to_string(msg)?;
        let mut txn = self.doc.transact_mut();
        self.inbox.push_back(&mut txn, encoded);
        Ok(())
    }

    /// Parse the inbox. Entries that are not valid JSON are logged and
    /// skipped; structural problems inside a parsed message are the
    /// validator's business.
    pub fn inbox_messages(&self) -> Vec<InboxMessage> {
        let txn = self.doc.transact();
        let mut out = Vec::new();
        for value in self.inbox.iter(&txn) {
            let Some(raw) = read_string(Some(value)) else {
                continue;
            };
            match serde_json::from_str::<InboxMessage>(&raw) {
                Ok(msg) => out.push(msg),
                Err(e) => log::warn!("{}: unparseable inbox entry: {e}", self.id),
            }
        }
        out
    }

    // ─── Replication ──────────────────────────────────────────────────

    /// Apply an update that originated elsewhere (remote log or local
    /// persistence replay). Tagged so subscribers never echo it back out.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), ResourceError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| ResourceError::Substrate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(Origin::from(REMOTE_ORIGIN));
        txn.apply_update(decoded)
            .map_err(|e| ResourceError::Substrate(e.to_string()))?;
        Ok(())
    }

    /// Full document state as a single update blob.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }

    /// Everything this document has that `sv` does not cover.
    pub fn encode_diff(&self, sv: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_diff_v1(sv)
    }

    /// The update encoding only this document's deletions.
    ///
    /// Encoding against the document's own state vector leaves no
    /// insertions, just the delete set. The sync orchestrator compares
    /// this against the local-minus-remote diff to recognize a true
    /// resume, where nothing but already-acknowledged deletions differ.
    pub fn deletion_set(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        let sv = txn.state_vector();
        txn.encode_state_as_update_v1(&sv)
    }
}

fn read_string(value: Option<Out>) -> Option<String> {
    match value {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

/// Sort key for inserting at `index` within `siblings` (sorted ascending).
fn key_at_index(siblings: &[Ref], index: Option<usize>) -> String {
    let keys: Vec<&str> = siblings.iter().filter_map(|r| r.sort_key.as_deref()).collect();
    let at = index.unwrap_or(keys.len()).min(keys.len());
    let lo = at.checked_sub(1).and_then(|i| keys.get(i).copied());
    let hi = keys.get(at).copied();
    key_between(lo, hi)
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_id(s: &str) -> DocId {
        s.parse().unwrap()
    }

    fn child_def() -> RefDef {
        RefDef::new("core", "child", Relation::Many, true)
    }

    #[test]
    fn test_doc_id_parse() {
        let id = doc_id("@alice/notes-1");
        assert_eq!(id.owner(), "alice");
        assert_eq!(id.name(), "notes-1");
        assert_eq!(id.as_str(), "@alice/notes-1");
    }

    #[test]
    fn test_doc_id_rejects_malformed() {
        assert!("alice/notes".parse::<DocId>().is_err());
        assert!("@alice".parse::<DocId>().is_err());
        assert!("@/notes".parse::<DocId>().is_err());
        assert!("@alice/".parse::<DocId>().is_err());
        assert!("@Alice/notes".parse::<DocId>().is_err());
        assert!("@alice/no tes".parse::<DocId>().is_err());
    }

    #[test]
    fn test_create_sets_type_once() {
        let r = Resource::new(doc_id("@alice/a")).unwrap();
        r.create("note");
        assert_eq!(r.kind().as_deref(), Some("note"));
        assert!(r.created_at().unwrap() > 0);
    }

    #[test]
    #[should_panic(expected = "already has type")]
    fn test_create_twice_panics() {
        let r = Resource::new(doc_id("@alice/a")).unwrap();
        r.create("note");
        r.create("sheet");
    }

    #[test]
    fn test_add_ref_overwrites_same_target() {
        let r = Resource::new(doc_id("@alice/a")).unwrap();
        let def = child_def();
        let first = r.add_ref(&def, &doc_id("@bob/b"), None).unwrap();
        let second = r.add_ref(&def, &doc_id("@bob/b"), Some(0)).unwrap();

        let refs = r.get_refs(&def);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].sort_key, second.sort_key);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_unique_relation_repoints() {
        let r = Resource::new(doc_id("@alice/a")).unwrap();
        let def = RefDef::new("core", "parent", Relation::Unique, false);
        r.add_ref(&def, &doc_id("@bob/one"), None).unwrap();
        r.add_ref(&def, &doc_id("@bob/two"), None).unwrap();

        let refs = r.get_refs(&def);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].target, "@bob/two");
        assert!(r.ref_for(&def, &doc_id("@bob/one")).is_none());
        assert!(r.ref_for(&def, &doc_id("@bob/two")).is_some());
    }

    #[test]
    fn test_sorted_refs_ordering() {
        let r = Resource::new(doc_id("@alice/a")).unwrap();
        let def = child_def();
        r.add_ref(&def, &doc_id("@bob/one"), None).unwrap();
        r.add_ref(&def, &doc_id("@bob/two"), None).unwrap();
        // Insert at the front.
        r.add_ref(&def, &doc_id("@bob/three"), Some(0)).unwrap();

        let refs = r.get_refs(&def);
        let targets: Vec<&str> = refs.iter().map(|x| x.target.as_str()).collect();
        assert_eq!(targets, vec!["@bob/three", "@bob/one", "@bob/two"]);
    }

    #[test]
    fn test_move_ref_repositions() {
        let r = Resource::new(doc_id("@alice/a")).unwrap();
        let def = child_def();
        r.add_ref(&def, &doc_id("@bob/one"), None).unwrap();
        r.add_ref(&def, &doc_id("@bob/two"), None).unwrap();
        r.add_ref(&def, &doc_id("@bob/three"), None).unwrap();

        r.move_ref(&def, &doc_id("@bob/three"), 0).unwrap();
        let targets: Vec<String> = r.get_refs(&def).iter().map(|x| x.target.clone()).collect();
        assert_eq!(targets, vec!["@bob/three", "@bob/one", "@bob/two"]);
    }

    #[test]
    #[should_panic(expected = "move_ref on unsorted or unique")]
    fn test_move_ref_unsorted_panics() {
        let r = Resource::new(doc_id("@alice/a")).unwrap();
        let def = RefDef::new("core", "tag", Relation::Many, false);
        let _ = r.move_ref(&def, &doc_id("@bob/b"), 0);
    }

    #[test]
    fn test_remove_ref() {
        let r = Resource::new(doc_id("@alice/a")).unwrap();
        let def = child_def();
        r.add_ref(&def, &doc_id("@bob/b"), None).unwrap();
        assert!(r.remove_ref(&def, &doc_id("@bob/b")));
        assert!(!r.remove_ref(&def, &doc_id("@bob/b")));
        assert!(r.get_refs(&def).is_empty());
    }

    #[test]
    fn test_backref_notice_clock_tracks_state_vector() {
        let r = Resource::with_client_id(doc_id("@alice/a"), 7).unwrap();
        let def = child_def();
        r.add_ref(&def, &doc_id("@bob/b"), None).unwrap();

        let notice = r.backref_notice(&def);
        assert_eq!(notice.source, "@alice/a");
        let (replica, seq) = notice.clock.split_once(':').unwrap();
        assert_eq!(replica, "7");
        assert!(seq.parse::<u32>().unwrap() > 0);
    }

    #[test]
    fn test_inbox_append_and_read() {
        let a = Resource::new(doc_id("@alice/a")).unwrap();
        let b = Resource::new(doc_id("@bob/b")).unwrap();
        let def = child_def();
        a.add_ref(&def, b.id(), None).unwrap();
        let notice = a.backref_notice(&def);
        b.append_inbox(&notice).unwrap();

        let messages = b.inbox_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, notice.id);
        assert_eq!(messages[0].source, "@alice/a");
    }

    #[test]
    fn test_idempotent_remote_apply() {
        let a = Resource::new(doc_id("@alice/a")).unwrap();
        a.set_meta("title", "hello");
        let update = a.encode_full_state();

        let b = Resource::new(doc_id("@alice/a")).unwrap();
        b.apply_remote_update(&update).unwrap();
        let once = b.encode_full_state();
        b.apply_remote_update(&update).unwrap();
        let twice = b.encode_full_state();
        assert_eq!(once, twice);
        assert_eq!(b.get_meta("title").as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_update_origin_tagging() {
        let a = Resource::new(doc_id("@alice/a")).unwrap();
        let b = Resource::new(doc_id("@alice/a")).unwrap();
        let mut rx = b.subscribe();

        a.set_meta("k", "v");
        b.apply_remote_update(&a.encode_full_state()).unwrap();
        let remote = rx.recv().await.unwrap();
        assert_eq!(remote.origin, UpdateOrigin::Remote);

        b.set_meta("k2", "v2");
        let local = rx.recv().await.unwrap();
        assert_eq!(local.origin, UpdateOrigin::Local);
    }

    #[test]
    fn test_deletion_set_empty_on_fresh_doc() {
        let a = Resource::new(doc_id("@alice/a")).unwrap();
        a.set_meta("k", "v");
        // No deletions yet: the delete set encodes as the empty update.
        assert_eq!(a.deletion_set(), vec![0, 0]);
    }

    #[test]
    fn test_diff_against_state_vector() {
        let a = Resource::new(doc_id("@alice/a")).unwrap();
        a.set_meta("k", "v");
        let sv = a.state_vector();
        assert_eq!(a.encode_diff(&sv), vec![0, 0]);

        a.set_meta("k2", "v2");
        let diff = a.encode_diff(&sv);
        assert_ne!(diff, vec![0, 0]);

        let b = Resource::new(doc_id("@alice/a")).unwrap();
        b.apply_remote_update(&a.encode_full_state()).unwrap();
        b.apply_remote_update(&diff).unwrap();
        assert_eq!(b.get_meta("k2").as_deref(), Some("v2"));
    }
}
