//! Backreference inbox and its validator.
//!
//! A reference from `@a/x` to `@b/y` lives in `@a/x`. The only thing the
//! writer leaves behind in `@b/y` is an inbox notice claiming the
//! reference exists. Claims are untrusted: anyone who can write to the
//! target's room can append one. The validator resolves each claim
//! against the actual source document and tracks a per-message state:
//!
//!   Pending ──▶ Valid ──▶ Invalid
//!      │                    ▲
//!      └────────────────────┘
//!
//! Invalid is terminal. A message whose claim cannot yet be checked
//! (the source replica has not caught up to the claimed clock) stays
//! Pending rather than being rejected; a message that names a clock the
//! source has reached but no matching reference is a lie and is rejected
//! for good.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{ConnectionCache, ConnectionHandle};
use crate::resource::{DocId, RefDef, Resource};

/// Backoff between attempts to open a claim's source document.
const SOURCE_RETRY: std::time::Duration = std::time::Duration::from_secs(1);

/// Signed claim that a document holds a reference to the inbox owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    /// Discriminator; reference notices use `"ref"`
    pub message_type: String,
    pub id: Uuid,
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Document id claimed to hold the reference
    pub source: String,
    /// `"{replica}:{seq}"` clock the source had reached when the
    /// reference was written
    pub clock: String,
}

/// Validation state of one inbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    Valid,
    /// Terminal; a message never leaves this state
    Invalid,
}

/// Outcome of checking a claim against the source document right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// The source has not caught up to the claimed clock yet
    Wait,
    Valid,
    Invalid,
}

/// Check `msg`'s claim against the source document's current state.
///
/// The claimed clock gates the verdict: until the source replica named
/// in the clock has reached the claimed sequence, absence of the
/// reference proves nothing and the answer is [`Evaluation::Wait`].
pub fn evaluate(
    msg: &InboxMessage,
    owner: &DocId,
    def: &RefDef,
    source: &Resource,
) -> Evaluation {
    let Some((replica, seq)) = parse_clock(&msg.clock) else {
        return Evaluation::Invalid;
    };
    if source.state_vector().get(&replica) < seq {
        return Evaluation::Wait;
    }
    if source.ref_for(def, owner).is_some() {
        Evaluation::Valid
    } else {
        Evaluation::Invalid
    }
}

fn parse_clock(clock: &str) -> Option<(u64, u32)> {
    let (replica, seq) = clock.split_once(':')?;
    Some((replica.parse().ok()?, seq.parse().ok()?))
}

struct ValidatorInner {
    owner: ConnectionHandle,
    def: RefDef,
    cache: ConnectionCache,
    states: StdMutex<HashMap<Uuid, MessageState>>,
    watchers: StdMutex<HashMap<Uuid, JoinHandle<()>>>,
    revision_tx: Arc<watch::Sender<u64>>,
}

/// The only transitions allowed out of each state: a claim may be
/// confirmed or rejected, never un-confirmed. Invalid is terminal.
fn transition(current: MessageState, next: MessageState) -> Option<MessageState> {
    match (current, next) {
        (c, n) if c == n => None,
        (MessageState::Invalid, _) => None,
        (MessageState::Valid, MessageState::Pending) => None,
        _ => Some(next),
    }
}

impl ValidatorInner {
    /// Apply a state transition. Returns whether anything changed.
    fn set_state(&self, id: Uuid, state: MessageState) -> bool {
        let mut states = self.states.lock().unwrap();
        let slot = states.entry(id).or_insert(MessageState::Pending);
        let Some(next) = transition(*slot, state) else {
            return false;
        };
        log::debug!("inbox message {id}: {:?} -> {next:?}", *slot);
        *slot = next;
        drop(states);
        self.revision_tx.send_modify(|r| *r += 1);
        true
    }
}

/// Watches one document's inbox and resolves reference claims against
/// their source documents as both sides evolve.
pub struct InboxValidator {
    inner: Arc<ValidatorInner>,
    scan_task: JoinHandle<()>,
}

impl InboxValidator {
    /// Start validating `owner`'s inbox for claims matching `def`.
    /// Messages of other types or definitions are ignored.
    pub fn new(owner: ConnectionHandle, def: RefDef, cache: ConnectionCache) -> Self {
        let (revision_tx, _) = watch::channel(0u64);
        let inner = Arc::new(ValidatorInner {
            owner,
            def,
            cache,
            states: StdMutex::new(HashMap::new()),
            watchers: StdMutex::new(HashMap::new()),
            revision_tx: Arc::new(revision_tx),
        });
        let scan_task = tokio::spawn(scan_loop(inner.clone()));
        Self { inner, scan_task }
    }

    pub fn state_of(&self, id: &Uuid) -> Option<MessageState> {
        self.inner.states.lock().unwrap().get(id).copied()
    }

    pub fn states(&self) -> HashMap<Uuid, MessageState> {
        self.inner.states.lock().unwrap().clone()
    }

    /// The currently trusted subset of the inbox, in inbox order.
    pub fn valid_ref_messages(&self) -> Vec<InboxMessage> {
        let states = self.inner.states.lock().unwrap();
        self.inner
            .owner
            .resource()
            .inbox_messages()
            .into_iter()
            .filter(|m| states.get(&m.id) == Some(&MessageState::Valid))
            .collect()
    }

    /// Bumped whenever any message changes state.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision_tx.subscribe()
    }
}

impl Drop for InboxValidator {
    fn drop(&mut self) {
        self.scan_task.abort();
        for (_, watcher) in self.inner.watchers.lock().unwrap().drain() {
            watcher.abort();
        }
    }
}

/// Rescan the owner's inbox on every owner update, spawning a watcher
/// for each new matching message.
async fn scan_loop(inner: Arc<ValidatorInner>) {
    let mut updates = inner.owner.resource().subscribe();
    scan_once(&inner);
    loop {
        match updates.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => scan_once(&inner),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn scan_once(inner: &Arc<ValidatorInner>) {
    for msg in inner.owner.resource().inbox_messages() {
        if msg.message_type != "ref"
            || msg.namespace != inner.def.namespace
            || msg.kind != inner.def.kind
        {
            continue;
        }
        let mut watchers = inner.watchers.lock().unwrap();
        if watchers.contains_key(&msg.id) {
            continue;
        }
        inner
            .states
            .lock()
            .unwrap()
            .entry(msg.id)
            .or_insert(MessageState::Pending);
        let task = tokio::spawn(watch_message(inner.clone(), msg.clone()));
        watchers.insert(msg.id, task);
    }
}

/// Resolve one claim and keep resolving as the source evolves. Ends when
/// the message goes Invalid; a Valid message stays watched so a later
/// reference removal demotes it.
async fn watch_message(inner: Arc<ValidatorInner>, msg: InboxMessage) {
    let source_id: DocId = match msg.source.parse() {
        Ok(id) => id,
        Err(_) => {
            log::warn!("inbox message {} names invalid source {:?}", msg.id, msg.source);
            inner.set_state(msg.id, MessageState::Invalid);
            return;
        }
    };
    // A source that cannot be opened right now (storage hiccup, corrupt
    // local snapshot) leaves the claim Pending and is retried; returning
    // here would strand the message unchecked forever.
    let source = loop {
        match inner.cache.load(&source_id).await {
            Ok(handle) => break handle,
            Err(e) => {
                log::warn!(
                    "inbox message {}: cannot open source {source_id}: {e}, retrying",
                    msg.id
                );
                tokio::time::sleep(SOURCE_RETRY).await;
            }
        }
    };

    let mut updates = source.resource().subscribe();
    loop {
        let verdict = evaluate(&msg, inner.owner.id(), &inner.def, source.resource());
        match verdict {
            Evaluation::Valid => {
                inner.set_state(msg.id, MessageState::Valid);
            }
            Evaluation::Invalid => {
                inner.set_state(msg.id, MessageState::Invalid);
                return;
            }
            Evaluation::Wait => {}
        }
        match updates.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
