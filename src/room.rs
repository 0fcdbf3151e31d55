//! Remote room service boundary.
//!
//! The remote side is an ordered, append-only message log per room, with
//! alias resolution, paginated history, long-poll delivery, and per-user
//! write permission. Everything the sync adapter needs is behind the
//! [`RoomService`] trait; [`MemoryRoom`] is the in-process implementation
//! used by tests and demos, with switches for simulating revoked write
//! access and transport loss.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

pub type RoomId = String;

/// Message payload carried by a room event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Incremental document update from one replica
    Update { replica: u64, update: Vec<u8> },
    /// Compaction snapshot; late joiners replay from the newest one
    Snapshot { update: Vec<u8> },
}

/// One entry in a room's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub sender: String,
    pub payload: Payload,
}

/// One page of history, newest first.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    /// Events in this page, newest first
    pub events: Vec<RoomEvent>,
    /// Token for the next (older) page; `None` at the log start
    pub next: Option<u64>,
    /// Log length at call time; the forward token after catch-up
    pub head: u64,
}

/// Events delivered by a long poll.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<RoomEvent>,
    /// Token covering everything delivered so far
    pub token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone)]
pub enum RoomError {
    NotFound(String),
    AlreadyExists(String),
    PermissionDenied(String),
    Offline,
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::NotFound(what) => write!(f, "Not found: {what}"),
            RoomError::AlreadyExists(what) => write!(f, "Already exists: {what}"),
            RoomError::PermissionDenied(what) => write!(f, "Permission denied: {what}"),
            RoomError::Offline => write!(f, "Transport offline"),
        }
    }
}

impl std::error::Error for RoomError {}

/// The remote message transport as the sync adapter sees it.
#[async_trait]
pub trait RoomService: Send + Sync {
    /// Resolve a human-readable alias to a stable room id.
    async fn resolve_alias(&self, alias: &str) -> Result<RoomId, RoomError>;

    /// Create a room under an alias. The creator joins with write access.
    async fn create_room(
        &self,
        alias: &str,
        visibility: Visibility,
        creator: &str,
    ) -> Result<RoomId, RoomError>;

    /// Fetch a page of history ending before `before` (`None` = log end).
    async fn history(
        &self,
        room: &RoomId,
        before: Option<u64>,
        limit: usize,
    ) -> Result<HistoryPage, RoomError>;

    /// Append a message to the room log.
    async fn send(&self, room: &RoomId, sender: &str, payload: Payload) -> Result<(), RoomError>;

    /// Long-poll for events after `token`, waiting up to `wait`.
    /// An empty batch on timeout is not an error.
    async fn events_since(
        &self,
        room: &RoomId,
        token: u64,
        wait: Duration,
    ) -> Result<EventBatch, RoomError>;

    /// Join a room. Joining a public room grants write access unless the
    /// user's access was explicitly revoked.
    async fn join(&self, room: &RoomId, user: &str) -> Result<(), RoomError>;

    /// Whether `user` may currently append to the room.
    async fn can_write(&self, room: &RoomId, user: &str) -> Result<bool, RoomError>;
}

// ─── In-memory implementation ─────────────────────────────────────────

struct RoomState {
    alias: String,
    visibility: Visibility,
    log: Vec<RoomEvent>,
    members: HashSet<String>,
    writers: HashSet<String>,
    /// Users whose write access was explicitly revoked; joining does not
    /// restore it
    revoked: HashSet<String>,
    notify: Arc<Notify>,
    join_attempts: u64,
}

struct MemoryRoomInner {
    aliases: HashMap<String, RoomId>,
    rooms: HashMap<RoomId, RoomState>,
}

/// In-process room service with an event log per room.
pub struct MemoryRoom {
    inner: StdMutex<MemoryRoomInner>,
    offline: AtomicBool,
}

impl Default for MemoryRoom {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRoom {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(MemoryRoomInner {
                aliases: HashMap::new(),
                rooms: HashMap::new(),
            }),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate transport loss for every operation.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Grant or revoke a user's write access. Revocation sticks across
    /// rejoin attempts until explicitly restored.
    pub fn set_writable(&self, room: &RoomId, user: &str, writable: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.rooms.get_mut(room) {
            if writable {
                state.revoked.remove(user);
                state.writers.insert(user.to_string());
            } else {
                state.writers.remove(user);
                state.revoked.insert(user.to_string());
            }
        }
    }

    /// Number of events in a room's log (test hook).
    pub fn log_len(&self, room: &RoomId) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.rooms.get(room).map(|s| s.log.len()).unwrap_or(0)
    }

    /// Number of join calls seen by a room (test hook).
    pub fn join_attempts(&self, room: &RoomId) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.rooms.get(room).map(|s| s.join_attempts).unwrap_or(0)
    }

    fn check_online(&self) -> Result<(), RoomError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RoomError::Offline)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RoomService for MemoryRoom {
    async fn resolve_alias(&self, alias: &str) -> Result<RoomId, RoomError> {
        self.check_online()?;
        let inner = self.inner.lock().unwrap();
        inner
            .aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(alias.to_string()))
    }

    async fn create_room(
        &self,
        alias: &str,
        visibility: Visibility,
        creator: &str,
    ) -> Result<RoomId, RoomError> {
        self.check_online()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.aliases.contains_key(alias) {
            return Err(RoomError::AlreadyExists(alias.to_string()));
        }
        let id: RoomId = format!("!{}", Uuid::new_v4());
        inner.aliases.insert(alias.to_string(), id.clone());
        inner.rooms.insert(
            id.clone(),
            RoomState {
                alias: alias.to_string(),
                visibility,
                log: Vec::new(),
                members: HashSet::from([creator.to_string()]),
                writers: HashSet::from([creator.to_string()]),
                revoked: HashSet::new(),
                notify: Arc::new(Notify::new()),
                join_attempts: 0,
            },
        );
        log::debug!("Created room {id} for alias {alias}");
        Ok(id)
    }

    async fn history(
        &self,
        room: &RoomId,
        before: Option<u64>,
        limit: usize,
    ) -> Result<HistoryPage, RoomError> {
        self.check_online()?;
        let inner = self.inner.lock().unwrap();
        let state = inner
            .rooms
            .get(room)
            .ok_or_else(|| RoomError::NotFound(room.clone()))?;
        let head = state.log.len() as u64;
        let end = before.unwrap_or(head).min(head) as usize;
        let start = end.saturating_sub(limit.max(1));
        let mut events: Vec<RoomEvent> = state.log[start..end].to_vec();
        events.reverse();
        Ok(HistoryPage {
            events,
            next: (start > 0).then_some(start as u64),
            head,
        })
    }

    async fn send(&self, room: &RoomId, sender: &str, payload: Payload) -> Result<(), RoomError> {
        self.check_online()?;
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .rooms
            .get_mut(room)
            .ok_or_else(|| RoomError::NotFound(room.clone()))?;
        if !state.writers.contains(sender) {
            return Err(RoomError::PermissionDenied(format!(
                "{sender} cannot write to {}",
                state.alias
            )));
        }
        state.log.push(RoomEvent {
            sender: sender.to_string(),
            payload,
        });
        state.notify.notify_waiters();
        Ok(())
    }

    async fn events_since(
        &self,
        room: &RoomId,
        token: u64,
        wait: Duration,
    ) -> Result<EventBatch, RoomError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            self.check_online()?;
            let notify = {
                let inner = self.inner.lock().unwrap();
                let state = inner
                    .rooms
                    .get(room)
                    .ok_or_else(|| RoomError::NotFound(room.clone()))?;
                state.notify.clone()
            };

            // Register interest before re-checking the log, otherwise an
            // append between the check and the wait is a missed wakeup.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock().unwrap();
                let state = inner
                    .rooms
                    .get(room)
                    .ok_or_else(|| RoomError::NotFound(room.clone()))?;
                let from = (token as usize).min(state.log.len());
                if state.log.len() > from {
                    return Ok(EventBatch {
                        events: state.log[from..].to_vec(),
                        token: state.log.len() as u64,
                    });
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(EventBatch {
                    events: Vec::new(),
                    token,
                });
            }
        }
    }

    async fn join(&self, room: &RoomId, user: &str) -> Result<(), RoomError> {
        self.check_online()?;
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .rooms
            .get_mut(room)
            .ok_or_else(|| RoomError::NotFound(room.clone()))?;
        state.join_attempts += 1;
        if state.visibility == Visibility::Private && !state.members.contains(user) {
            return Err(RoomError::PermissionDenied(format!(
                "{user} cannot join private room {}",
                state.alias
            )));
        }
        state.members.insert(user.to_string());
        if !state.revoked.contains(user) {
            state.writers.insert(user.to_string());
        }
        Ok(())
    }

    async fn can_write(&self, room: &RoomId, user: &str) -> Result<bool, RoomError> {
        self.check_online()?;
        let inner = self.inner.lock().unwrap();
        let state = inner
            .rooms
            .get(room)
            .ok_or_else(|| RoomError::NotFound(room.clone()))?;
        Ok(state.writers.contains(user))
    }
}
