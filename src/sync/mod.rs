//! Remote sync adapter.
//!
//! Three cooperating pieces per attached document:
//!
//! ```text
//!                 ┌──────────────┐   long-poll    ┌─────────────┐
//!                 │  RoomReader  │◄───────────────┤             │
//!  Resource ◄─────┤  (catch-up,  │                │ RoomService │
//!     │           │   poll loop) │                │  (rooms,    │
//!     │ local     └──────────────┘                │   history,  │
//!     │ updates   ┌──────────────┐   throttled    │   perms)    │
//!     └──────────►│ThrottledWriter├───────────────►│             │
//!                 └──────────────┘   batches      └─────────────┘
//!                        ▲
//!                 SyncManager orchestrates hydrate / reconcile /
//!                 live sync and owns both pieces
//! ```
//!
//! Reference: Kleppmann, Chapter 5 (Replication).

mod manager;
mod reader;
mod writer;

pub use manager::{DocStatus, SyncManager};
pub use reader::{catch_up, CatchUp, RoomReader};
pub use writer::ThrottledWriter;

use std::time::Duration;

/// Timing and batching knobs for the sync adapter.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Long-poll timeout window
    pub poll_timeout: Duration,
    /// Backoff after a failed poll
    pub poll_retry_backoff: Duration,
    /// Throttle window before a batched flush
    pub flush_interval: Duration,
    /// Throttle window while write permission is denied
    pub denied_flush_interval: Duration,
    /// Retry period while the remote document is absent
    pub not_found_retry: Duration,
    /// Retry period while the transport is offline
    pub offline_retry: Duration,
    /// Every n-th update-bearing event elects a compaction snapshot
    pub snapshot_interval: u64,
    /// History page size during catch-up
    pub history_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            poll_retry_backoff: Duration::from_secs(5),
            flush_interval: Duration::from_millis(500),
            denied_flush_interval: Duration::from_secs(30),
            not_found_retry: Duration::from_secs(60),
            offline_retry: Duration::from_secs(5),
            snapshot_interval: 100,
            history_page_size: 50,
        }
    }
}

impl SyncConfig {
    /// Millisecond-scale intervals for tests.
    pub fn for_testing() -> Self {
        Self {
            poll_timeout: Duration::from_millis(200),
            poll_retry_backoff: Duration::from_millis(40),
            flush_interval: Duration::from_millis(25),
            denied_flush_interval: Duration::from_millis(80),
            not_found_retry: Duration::from_millis(120),
            offline_retry: Duration::from_millis(50),
            snapshot_interval: 5,
            history_page_size: 4,
        }
    }
}

/// The v1 encoding of an update containing nothing at all.
pub(crate) fn is_empty_update(update: &[u8]) -> bool {
    update == [0, 0]
}
