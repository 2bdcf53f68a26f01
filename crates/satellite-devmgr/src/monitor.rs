//! Full sync and update id tracking.
//!
//! Every full sync started by the controller gets a new id. Incremental
//! updates are numbered within the current full sync. The device manager
//! does not request updates while the current full sync has not been
//! applied yet.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct MonitorState {
    full_sync_id: u64,
    full_sync_applied: bool,
    update_id: u64,
}

/// Tracks the state of the controller's full sync.
#[derive(Debug)]
pub struct UpdateMonitor {
    state: Mutex<MonitorState>,
    wakeup: Arc<Notify>,
}

impl UpdateMonitor {
    /// Creates a monitor that wakes `wakeup` when a full sync was applied.
    pub fn new(wakeup: Arc<Notify>) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            wakeup,
        }
    }

    /// Starts a new full sync and returns its id.
    pub fn start_full_sync(&self) -> u64 {
        let mut state = self.state.lock();
        state.full_sync_id += 1;
        state.full_sync_applied = false;
        state.update_id = 0;
        debug!(full_sync_id = state.full_sync_id, "Full sync started");
        state.full_sync_id
    }

    /// Marks the current full sync as applied and wakes the waiting loop.
    pub fn set_full_sync_applied(&self) {
        {
            let mut state = self.state.lock();
            state.full_sync_applied = true;
            debug!(full_sync_id = state.full_sync_id, "Full sync applied");
        }
        self.wakeup.notify_one();
    }

    pub fn is_current_full_sync_applied(&self) -> bool {
        self.state.lock().full_sync_applied
    }

    pub fn current_full_sync_id(&self) -> u64 {
        self.state.lock().full_sync_id
    }

    /// Returns the id for the next incremental update of the current full
    /// sync.
    pub fn next_update_id(&self) -> u64 {
        let mut state = self.state.lock();
        state.update_id += 1;
        state.update_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_full_sync_cycle() {
        let monitor = UpdateMonitor::new(Arc::new(Notify::new()));
        assert!(!monitor.is_current_full_sync_applied());

        assert_eq!(monitor.start_full_sync(), 1);
        assert_eq!(monitor.next_update_id(), 1);
        assert_eq!(monitor.next_update_id(), 2);

        monitor.set_full_sync_applied();
        assert!(monitor.is_current_full_sync_applied());

        assert_eq!(monitor.start_full_sync(), 2);
        assert!(!monitor.is_current_full_sync_applied());
        assert_eq!(monitor.next_update_id(), 1);
        assert_eq!(monitor.current_full_sync_id(), 2);
    }

    #[tokio::test]
    async fn test_applied_wakes_loop() {
        let wakeup = Arc::new(Notify::new());
        let monitor = UpdateMonitor::new(wakeup.clone());
        monitor.set_full_sync_applied();
        tokio::time::timeout(Duration::from_secs(1), wakeup.notified())
            .await
            .unwrap();
    }
}
