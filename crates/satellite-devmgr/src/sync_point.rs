//! Phase barrier for dispatch work.
//!
//! Parties that take part in a dispatch register before they start and
//! arrive when they are done. The device manager awaits the point before it
//! answers the requesters and removes deleted objects.

use tokio::sync::watch;
use tracing::trace;

/// Counts registered parties that have not yet arrived.
#[derive(Debug)]
pub struct SyncPoint {
    pending: watch::Sender<usize>,
}

impl SyncPoint {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self { pending }
    }

    pub fn register(&self) {
        self.pending.send_modify(|count| *count += 1);
    }

    /// Marks one registered party as done.
    pub fn arrive(&self) {
        self.pending.send_modify(|count| *count = count.saturating_sub(1));
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Waits until every registered party has arrived.
    pub async fn await_idle(&self) {
        let mut rx = self.pending.subscribe();
        if rx.wait_for(|count| *count == 0).await.is_err() {
            // the sender lives in self, so the channel cannot close here
            trace!("Sync point channel closed");
        }
    }
}

impl Default for SyncPoint {
    fn default() -> Self {
        Self::new()
    }
}
