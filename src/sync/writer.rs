//! Throttled writer: batches local update fragments and flushes them as
//! one merged blob per throttle window.
//!
//! Permission denial flips the shared `can_write` flag, switches to the
//! long throttle window, and triggers a join attempt; a successful join
//! that restores write access retries immediately instead of waiting the
//! window out. Fragments are never dropped, a failed flush keeps them
//! queued for the next attempt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::room::{Payload, RoomError, RoomId, RoomService};
use crate::sync::SyncConfig;

pub struct ThrottledWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    queued: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl ThrottledWriter {
    /// Spawn the flush task.
    ///
    /// `can_write_tx` is flipped as permission state changes; `flushed_tx`
    /// fires once per confirmed flush so the orchestrator can persist and
    /// mark the document synced.
    pub fn spawn(
        svc: Arc<dyn RoomService>,
        room: RoomId,
        user: String,
        replica: u64,
        cfg: &SyncConfig,
        can_write_tx: Arc<watch::Sender<bool>>,
        flushed_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(flush_loop(
            svc,
            room,
            user,
            replica,
            cfg.clone(),
            can_write_tx,
            flushed_tx,
            rx,
            queued.clone(),
        ));
        Self { tx, queued, task }
    }

    /// Queue an update fragment for the next flush.
    pub fn enqueue(&self, update: Vec<u8>) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(update).is_err() {
            log::debug!("writer task gone, dropping fragment");
        }
    }

    /// Fragments accepted but not yet confirmed flushed.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

impl Drop for ThrottledWriter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn flush_loop(
    svc: Arc<dyn RoomService>,
    room: RoomId,
    user: String,
    replica: u64,
    cfg: SyncConfig,
    can_write_tx: Arc<watch::Sender<bool>>,
    flushed_tx: mpsc::UnboundedSender<()>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    queued: Arc<AtomicUsize>,
) {
    let mut pending: Vec<Vec<u8>> = Vec::new();
    let mut retry_now = false;

    loop {
        if pending.is_empty() {
            match rx.recv().await {
                Some(fragment) => pending.push(fragment),
                None => return,
            }
        }

        if !retry_now {
            let window = if *can_write_tx.borrow() {
                cfg.flush_interval
            } else {
                cfg.denied_flush_interval
            };
            tokio::time::sleep(window).await;
        }
        retry_now = false;

        // Everything queued during the window joins this flush.
        while let Ok(fragment) = rx.try_recv() {
            pending.push(fragment);
        }

        let blob = match merge_fragments(&pending) {
            Some(blob) => blob,
            None => {
                // Merge failure leaves the fragments to be sent one by
                // one; the remote log merges commutatively anyway.
                let mut sent = 0;
                for fragment in &pending {
                    let payload = Payload::Update {
                        replica,
                        update: fragment.clone(),
                    };
                    if svc.send(&room, &user, payload).await.is_err() {
                        break;
                    }
                    sent += 1;
                }
                queued.fetch_sub(sent, Ordering::SeqCst);
                pending.drain(..sent);
                if sent > 0 {
                    let _ = flushed_tx.send(());
                }
                continue;
            }
        };

        match svc
            .send(
                &room,
                &user,
                Payload::Update {
                    replica,
                    update: blob,
                },
            )
            .await
        {
            Ok(()) => {
                queued.fetch_sub(pending.len(), Ordering::SeqCst);
                pending.clear();
                set_can_write(&can_write_tx, true);
                let _ = flushed_tx.send(());
            }
            Err(RoomError::PermissionDenied(_)) => {
                log::info!("{room}: write denied, {} fragments held", pending.len());
                set_can_write(&can_write_tx, false);
                match svc.join(&room, &user).await {
                    Ok(()) => {
                        if svc.can_write(&room, &user).await.unwrap_or(false) {
                            log::info!("{room}: joined with write access, retrying now");
                            set_can_write(&can_write_tx, true);
                            retry_now = true;
                        }
                    }
                    Err(e) => log::debug!("{room}: join failed: {e}"),
                }
            }
            Err(RoomError::Offline) => {
                log::debug!("{room}: flush offline, {} fragments held", pending.len());
            }
            Err(e) => {
                log::warn!("{room}: flush failed: {e}");
            }
        }
    }
}

fn set_can_write(tx: &watch::Sender<bool>, value: bool) {
    tx.send_if_modified(|current| {
        if *current != value {
            *current = value;
            true
        } else {
            false
        }
    });
}

/// Merge pending fragments into a single update blob.
fn merge_fragments(pending: &[Vec<u8>]) -> Option<Vec<u8>> {
    if pending.len() == 1 {
        return Some(pending[0].clone());
    }
    let refs: Vec<&[u8]> = pending.iter().map(|u| u.as_slice()).collect();
    match yrs::merge_updates_v1(&refs) {
        Ok(merged) => Some(merged),
        Err(e) => {
            log::error!("update merge failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::room::{MemoryRoom, Visibility};
    use std::time::Duration;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    struct Fixture {
        svc: Arc<MemoryRoom>,
        room: RoomId,
        writer: ThrottledWriter,
        can_write: watch::Receiver<bool>,
        flushed: mpsc::UnboundedReceiver<()>,
    }

    async fn fixture() -> Fixture {
        let svc = Arc::new(MemoryRoom::new());
        let room = svc
            .create_room("@alice/doc", Visibility::Public, "alice")
            .await
            .unwrap();
        let can_write_tx = Arc::new(watch::channel(true).0);
        let can_write = can_write_tx.subscribe();
        let (flushed_tx, flushed) = mpsc::unbounded_channel();
        let writer = ThrottledWriter::spawn(
            svc.clone(),
            room.clone(),
            "alice".to_string(),
            1,
            &SyncConfig::for_testing(),
            can_write_tx,
            flushed_tx,
        );
        Fixture {
            svc,
            room,
            writer,
            can_write,
            flushed,
        }
    }

    /// Three real update fragments from one document.
    fn fragments() -> Vec<Vec<u8>> {
        let r = Resource::new("@alice/doc".parse().unwrap()).unwrap();
        let mut rx = r.subscribe();
        r.set_meta("a", "1");
        r.set_meta("b", "2");
        r.set_meta("c", "3");
        let mut out = Vec::new();
        while let Ok(u) = rx.try_recv() {
            out.push(u.update);
        }
        assert_eq!(out.len(), 3);
        out
    }

    #[tokio::test]
    async fn test_fragments_batched_into_one_message() {
        let mut fx = fixture().await;
        for f in fragments() {
            fx.writer.enqueue(f);
        }
        fx.flushed.recv().await.unwrap();
        assert_eq!(fx.svc.log_len(&fx.room), 1);
        assert_eq!(fx.writer.queued(), 0);
    }

    #[tokio::test]
    async fn test_denied_holds_queue_and_flips_flag() {
        let mut fx = fixture().await;
        fx.svc.set_writable(&fx.room, "alice", false);

        fx.writer.enqueue(vec![1, 2, 3]);
        fx.can_write.changed().await.unwrap();
        assert!(!*fx.can_write.borrow());
        assert_eq!(fx.writer.queued(), 1);
        assert_eq!(fx.svc.log_len(&fx.room), 0);
        // A join was attempted on the denial.
        wait_until(|| fx.svc.join_attempts(&fx.room) > 0).await;

        fx.svc.set_writable(&fx.room, "alice", true);
        fx.flushed.recv().await.unwrap();
        assert!(*fx.can_write.borrow());
        assert_eq!(fx.svc.log_len(&fx.room), 1);
        assert_eq!(fx.writer.queued(), 0);
    }

    #[tokio::test]
    async fn test_offline_retries_until_online() {
        let mut fx = fixture().await;
        fx.svc.set_offline(true);
        fx.writer.enqueue(vec![9]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.writer.queued(), 1);

        fx.svc.set_offline(false);
        fx.flushed.recv().await.unwrap();
        assert_eq!(fx.svc.log_len(&fx.room), 1);
        assert_eq!(fx.writer.queued(), 0);
    }

    #[tokio::test]
    async fn test_late_fragments_join_current_window() {
        let mut fx = fixture().await;
        let frags = fragments();
        fx.writer.enqueue(frags[0].clone());
        // Enqueued before the window closes, so still one room message.
        tokio::time::sleep(Duration::from_millis(5)).await;
        fx.writer.enqueue(frags[1].clone());
        fx.flushed.recv().await.unwrap();
        assert_eq!(fx.svc.log_len(&fx.room), 1);
    }
}
