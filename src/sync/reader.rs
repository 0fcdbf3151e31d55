//! Room reader: history catch-up and the long-poll loop.

use std::sync::Arc;
use std::time::Duration;

use crate::room::{Payload, RoomError, RoomEvent, RoomId, RoomService};
use crate::sync::SyncConfig;

/// Result of a history catch-up.
#[derive(Debug)]
pub struct CatchUp {
    /// Events to replay, oldest first, starting at the most recent
    /// snapshot (inclusive) or the log start
    pub events: Vec<RoomEvent>,
    /// Forward token for the subsequent long-poll
    pub token: u64,
    /// Update-bearing events observed since the last snapshot, the seed
    /// for the snapshot election counter
    pub updates_since_snapshot: u64,
}

/// Page backwards through room history until the most recent snapshot
/// event (or the log start), then reverse into replay order.
pub async fn catch_up(
    svc: &dyn RoomService,
    room: &RoomId,
    page_size: usize,
) -> Result<CatchUp, RoomError> {
    let mut collected: Vec<RoomEvent> = Vec::new();
    let mut before: Option<u64> = None;
    let mut token = 0;

    loop {
        let page = svc.history(room, before, page_size).await?;
        if before.is_none() {
            token = page.head;
        }
        let mut done = page.next.is_none();
        for event in page.events {
            let is_snapshot = matches!(event.payload, Payload::Snapshot { .. });
            collected.push(event);
            if is_snapshot {
                done = true;
                break;
            }
        }
        if done {
            break;
        }
        before = page.next;
    }

    collected.reverse();
    let updates_since_snapshot = collected
        .iter()
        .filter(|e| matches!(e.payload, Payload::Update { .. }))
        .count() as u64;
    log::debug!(
        "{room}: caught up {} events ({} updates since snapshot), token {token}",
        collected.len(),
        updates_since_snapshot
    );
    Ok(CatchUp {
        events: collected,
        token,
        updates_since_snapshot,
    })
}

/// The live long-poll loop over one room.
///
/// `next` re-issues the poll immediately after a successful response and
/// backs off on transport failure; it only ever returns a non-empty
/// batch.
pub struct RoomReader {
    svc: Arc<dyn RoomService>,
    room: RoomId,
    token: u64,
    poll_timeout: Duration,
    retry_backoff: Duration,
}

impl RoomReader {
    pub fn new(svc: Arc<dyn RoomService>, room: RoomId, token: u64, cfg: &SyncConfig) -> Self {
        Self {
            svc,
            room,
            token,
            poll_timeout: cfg.poll_timeout,
            retry_backoff: cfg.poll_retry_backoff,
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub async fn next(&mut self) -> Vec<RoomEvent> {
        loop {
            match self
                .svc
                .events_since(&self.room, self.token, self.poll_timeout)
                .await
            {
                Ok(batch) => {
                    self.token = batch.token;
                    if !batch.events.is_empty() {
                        return batch.events;
                    }
                    // Timed-out poll: re-issue immediately, never idle.
                }
                Err(RoomError::Offline) => {
                    log::debug!("{}: poll offline, backing off", self.room);
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => {
                    log::warn!("{}: poll failed: {e}", self.room);
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }
}
