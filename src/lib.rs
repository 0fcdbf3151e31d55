//! Offline-first document synchronization with validated cross-document
//! references.
//!
//! Documents are CRDT-backed resources identified as `@owner/name` and
//! replicated through per-document rooms on a message transport. Local
//! persistence is authoritative: every edit lands on disk first and
//! reaches the remote when it can.
//!
//! ```text
//!   application
//!        │
//!        ▼
//!   ConnectionCache ──── one live Resource per document id
//!        │                    │
//!        │              SyncManager ── RoomReader (long poll)
//!        │                    │     └─ ThrottledWriter (batched flush)
//!        ▼                    ▼
//!   LocalDocumentStore   RoomService (remote rooms)
//!
//!   InboxValidator ── resolves backreference claims against sources
//!   BackgroundSyncer ─ finishes uploads no open connection will
//! ```
//!
//! References between documents are stored on the referring side only;
//! the referenced document receives an untrusted inbox notice that the
//! [`inbox::InboxValidator`] checks against the actual source.

pub mod cache;
pub mod fractional;
pub mod inbox;
pub mod resource;
pub mod room;
pub mod store;
pub mod sync;
pub mod syncer;

pub use cache::{CacheError, ConnectionCache, ConnectionHandle, CreateOutcome, Session};
pub use inbox::{evaluate, Evaluation, InboxMessage, InboxValidator, MessageState};
pub use resource::{
    DocId, Ref, RefDef, Relation, Resource, ResourceError, ResourceUpdate, UpdateOrigin,
};
pub use room::{
    EventBatch, HistoryPage, MemoryRoom, Payload, RoomError, RoomEvent, RoomId, RoomService,
    Visibility,
};
pub use store::{CreateSource, DocMeta, LocalDocumentStore, StoreConfig, StoreError};
pub use sync::{DocStatus, SyncConfig, SyncManager};
pub use syncer::BackgroundSyncer;
