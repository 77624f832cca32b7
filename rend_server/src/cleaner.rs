//! Background task that deletes records past their deadline.

use crate::expiry::ExpiryIndex;
use crate::metrics::ServerMetrics;
use rend_core::time::now_nanos;
use rend_store::RecordStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to the periodic expiry task. Cancelling stops the loop at a
/// tick boundary; a sweep that has started always finishes.
pub(crate) struct Cleaner {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Cleaner {
    pub(crate) fn spawn(
        store: RecordStore,
        index: Arc<ExpiryIndex>,
        metrics: Arc<dyn ServerMetrics>,
        period: Duration,
    ) -> Cleaner {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                sweep(&store, &index, metrics.as_ref()).await;
            }
        });
        Cleaner { token, handle }
    }

    /// Signals the loop and waits for it to exit.
    pub(crate) async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// Pops everything due and deletes it from the store, unless the
/// stored deadline is newer than the popped one: re-registering a key
/// leaves a stale heap entry behind, and deleting on its account would
/// kill the refreshed record. Delete failures are logged and counted;
/// the affected key simply stays until a later registration replaces
/// it.
pub(crate) async fn sweep(store: &RecordStore, index: &ExpiryIndex, metrics: &dyn ServerMetrics) {
    let now = now_nanos();
    let due = index.pop_due(now);
    if due.is_empty() {
        return;
    }
    debug!(count = due.len(), "expiring records");
    for entry in due {
        match store.deadline_of(&entry.key).await {
            // Already gone; nothing to do.
            Ok(None) => {}
            // Refreshed since this entry was pushed.
            Ok(Some(stored)) if stored > entry.deadline_ns => {}
            Ok(Some(_)) => match store.remove_by_key(&entry.key).await {
                Ok(true) => metrics.remove_active_registration(&entry.key.topic_lossy()),
                Ok(false) => {}
                Err(e) => {
                    warn!(key = ?entry.key, "failed to delete expired record: {e}");
                    metrics.count_error("cleaner.delete");
                }
            },
            Err(e) => {
                warn!(key = ?entry.key, "failed to read expired record: {e}");
                metrics.count_error("cleaner.read");
            }
        }
    }
}
