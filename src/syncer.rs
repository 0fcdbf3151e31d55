//! Background syncer: finishes uploads no open connection will.
//!
//! Documents can end up persisted-but-unsynced with nothing driving
//! them: created while offline, written through a transient connection
//! that was torn down before its flush window, or restored from a
//! migrated store. This task sweeps the store index and holds a cache
//! connection open for every document that still owes the remote
//! something, releasing it once the document is clean and published.

use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::ConnectionCache;
use crate::cache::ConnectionHandle;
use crate::resource::DocId;
use crate::store::DocMeta;

pub struct BackgroundSyncer {
    task: JoinHandle<()>,
}

impl BackgroundSyncer {
    /// Start sweeping `cache`'s store every `tick`. The first sweep is
    /// deferred by one tick so application startup stays cheap.
    pub fn spawn(cache: ConnectionCache, tick: Duration) -> Self {
        Self {
            task: tokio::spawn(run(cache, tick)),
        }
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for BackgroundSyncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn wants_sync(meta: &DocMeta) -> bool {
    meta.needs_save_since.is_some() || !meta.exists_at_remote
}

async fn run(cache: ConnectionCache, tick: Duration) {
    let mut tracked: HashMap<DocId, ConnectionHandle> = HashMap::new();
    let mut index_rx = cache.store().subscribe();
    tokio::time::sleep(tick).await;
    loop {
        sweep(&cache, &mut tracked).await;
        tokio::select! {
            changed = index_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(tick) => {}
        }
    }
}

async fn sweep(cache: &ConnectionCache, tracked: &mut HashMap<DocId, ConnectionHandle>) {
    let index = cache.store().index();
    for meta in &index {
        if !wants_sync(meta) {
            continue;
        }
        let Ok(id) = meta.id.parse::<DocId>() else {
            continue;
        };
        if tracked.contains_key(&id) {
            continue;
        }
        match cache.load(&id).await {
            Ok(handle) => {
                log::debug!("background sync picked up {id}");
                tracked.insert(id, handle);
            }
            Err(e) => log::warn!("background sync cannot open {id}: {e}"),
        }
    }
    // Release documents that are clean and published; the handle drop
    // tears the connection down unless someone else holds it.
    tracked.retain(|id, _| {
        let keep = cache
            .store()
            .meta(id)
            .map(|meta| wants_sync(&meta))
            .unwrap_or(false);
        if !keep {
            log::debug!("background sync released {id}");
        }
        keep
    });
}
