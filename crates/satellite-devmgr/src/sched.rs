//! The cycle monitor ("sched") and its pending bookkeeping.
//!
//! All state shared between the device manager loop and the threads that
//! deliver notifications lives in [`SchedState`] behind one mutex. The mutex
//! is only held for short, non-blocking bookkeeping: never across an
//! `.await` and never while object graph locks are acquired.
//!
//! Waiting works with a single-consumer [`Notify`]: mutators call
//! [`Scheduler::notify`] after changing state, the loop re-checks its
//! condition and awaits the next notification. A notification sent while
//! the loop is not waiting is stored as a permit, so no wake-up is lost.

use parking_lot::{Mutex, MutexGuard};
use satellite_common::{
    ApiCallRc, NodeName, ResourceName, ResponseSink, SnapshotKey, UpdateBundle, UpdateNotification,
    VolumeKey,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Flags read by the loop without taking the monitor.
#[derive(Debug)]
pub struct LoopFlags {
    pub running: AtomicBool,
    /// Cleared to interrupt the current wait
    pub svc_cond: AtomicBool,
    /// Whether collecting notifications may block
    pub wait_upd: AtomicBool,
    /// Set when a full sync was applied and everything must be dispatched
    pub full_sync: AtomicBool,
    pub shutdown: AtomicBool,
    /// Makes one blocking notification collection return
    pub force_wake: AtomicBool,
    /// Stops enqueueing further resources into the running dispatch
    pub abort_dev_hnd: AtomicBool,
    /// Replication state tracking is available
    pub state_available: AtomicBool,
}

impl Default for LoopFlags {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            svc_cond: AtomicBool::new(false),
            wait_upd: AtomicBool::new(true),
            full_sync: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            force_wake: AtomicBool::new(false),
            abort_dev_hnd: AtomicBool::new(false),
            state_available: AtomicBool::new(false),
        }
    }
}

impl LoopFlags {
    pub fn get(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    /// True while the current wait may continue.
    pub fn keep_waiting(&self) -> bool {
        Self::get(&self.svc_cond) && !Self::get(&self.shutdown)
    }
}

/// Pending objects and the sinks waiting for their outcome.
pub type PendingMap<K> = BTreeMap<K, Vec<ResponseSink>>;

/// State shared between the loop and notification producers.
#[derive(Debug, Default)]
pub struct SchedState {
    /// Notifications collected since the last cycle
    pub cached: UpdateBundle,
    /// Updates still to be requested
    pub upd_pending: UpdateBundle,
    /// Updates requested but not yet applied
    pub rcv_pending: UpdateBundle,

    pub pending_dispatch_rscs: PendingMap<ResourceName>,
    pub pending_dispatch_snaps: PendingMap<SnapshotKey>,
    pub pending_dispatch_nodes: PendingMap<NodeName>,
    /// Every sink of the pending dispatch, each completed once
    pub pending_response_sinks: Vec<ResponseSink>,

    pub dispatch_rsc_responses: BTreeMap<ResourceName, ApiCallRc>,
    pub dispatch_snap_responses: BTreeMap<SnapshotKey, ApiCallRc>,
    pub dispatch_node_responses: BTreeMap<NodeName, ApiCallRc>,

    pub deleted_rscs: BTreeSet<ResourceName>,
    pub deleted_vlms: BTreeSet<VolumeKey>,
    pub deleted_snaps: BTreeSet<SnapshotKey>,
}

/// Everything taken out of [`SchedState`] for one dispatch.
#[derive(Debug, Default)]
pub struct DispatchRequest {
    pub rscs: PendingMap<ResourceName>,
    pub snaps: PendingMap<SnapshotKey>,
    pub nodes: PendingMap<NodeName>,
    pub sinks: Vec<ResponseSink>,
}

impl DispatchRequest {
    /// True if there is nothing to dispatch and no sink to complete.
    pub fn is_empty(&self) -> bool {
        self.rscs.is_empty() && self.snaps.is_empty() && self.nodes.is_empty() && self.sinks.is_empty()
    }
}

/// Deleted objects recorded during a dispatch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeletedObjects {
    pub rscs: BTreeSet<ResourceName>,
    pub vlms: BTreeSet<VolumeKey>,
    pub snaps: BTreeSet<SnapshotKey>,
}

impl SchedState {
    /// Queues resources for dispatch with the sinks of `notification`.
    pub fn mark_pending_rsc_dispatch<'a>(
        &mut self,
        notification: Option<&UpdateNotification>,
        rscs: impl IntoIterator<Item = &'a ResourceName>,
    ) {
        let sinks = sinks_of(notification);
        for rsc in rscs {
            mark_pending(
                &mut self.pending_dispatch_rscs,
                &mut self.pending_response_sinks,
                rsc.clone(),
                &sinks,
            );
        }
    }

    pub fn mark_pending_snap_dispatch<'a>(
        &mut self,
        notification: Option<&UpdateNotification>,
        snaps: impl IntoIterator<Item = &'a SnapshotKey>,
    ) {
        let sinks = sinks_of(notification);
        for snap in snaps {
            mark_pending(
                &mut self.pending_dispatch_snaps,
                &mut self.pending_response_sinks,
                snap.clone(),
                &sinks,
            );
        }
    }

    pub fn mark_pending_node_dispatch(
        &mut self,
        notification: Option<&UpdateNotification>,
        node: &NodeName,
    ) {
        let sinks = sinks_of(notification);
        mark_pending(
            &mut self.pending_dispatch_nodes,
            &mut self.pending_response_sinks,
            node.clone(),
            &sinks,
        );
    }

    /// Keeps the sinks of `notification` so the next dispatch completes
    /// them, even when no object was queued for it.
    pub fn retain_response_sinks(&mut self, notification: Option<&UpdateNotification>) {
        for sink in sinks_of(notification) {
            remember_sink(&mut self.pending_response_sinks, sink);
        }
    }

    /// Moves the pending dispatch out of the monitor.
    pub fn take_dispatch(&mut self) -> DispatchRequest {
        DispatchRequest {
            rscs: std::mem::take(&mut self.pending_dispatch_rscs),
            snaps: std::mem::take(&mut self.pending_dispatch_snaps),
            nodes: std::mem::take(&mut self.pending_dispatch_nodes),
            sinks: std::mem::take(&mut self.pending_response_sinks),
        }
    }

    pub fn take_deleted(&mut self) -> DeletedObjects {
        DeletedObjects {
            rscs: std::mem::take(&mut self.deleted_rscs),
            vlms: std::mem::take(&mut self.deleted_vlms),
            snaps: std::mem::take(&mut self.deleted_snaps),
        }
    }

    /// Drops every notification and update request; used when the
    /// controller re-sent its whole state.
    pub fn clear_bundles(&mut self) {
        self.upd_pending.clear();
        self.rcv_pending.clear();
    }
}

fn sinks_of(notification: Option<&UpdateNotification>) -> Vec<ResponseSink> {
    notification
        .map(|n| n.response_sinks().to_vec())
        .unwrap_or_default()
}

fn mark_pending<K: Ord>(
    map: &mut PendingMap<K>,
    all_sinks: &mut Vec<ResponseSink>,
    key: K,
    sinks: &[ResponseSink],
) {
    map.entry(key).or_default().extend(sinks.iter().cloned());
    for sink in sinks {
        remember_sink(all_sinks, sink.clone());
    }
}

fn remember_sink(all_sinks: &mut Vec<ResponseSink>, sink: ResponseSink) {
    if !all_sinks.iter().any(|known| known.same_channel(&sink)) {
        all_sinks.push(sink);
    }
}

/// The monitor plus the loop's flags and wake-up signal.
#[derive(Debug)]
pub struct Scheduler {
    state: Mutex<SchedState>,
    wakeup: Arc<Notify>,
    pub flags: LoopFlags,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedState::default()),
            wakeup: Arc::new(Notify::new()),
            flags: LoopFlags::default(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock()
    }

    /// Wakes the loop if it waits, or lets its next wait return at once.
    pub fn notify(&self) {
        self.wakeup.notify_one();
    }

    /// The wake-up signal, shared with the update monitor.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    /// Waits for the next notification.
    pub async fn wait(&self) {
        self.wakeup.notified().await;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use satellite_common::response_channel;
    use std::time::Duration;
    use uuid::Uuid;

    fn notification_with_sink() -> (UpdateNotification, ResponseSink) {
        let (sink, _stream) = response_channel();
        let mut notification = UpdateNotification::new(Uuid::new_v4());
        notification.add_response_sink(sink.clone());
        (notification, sink)
    }

    #[test]
    fn test_mark_pending_collects_sinks_once() {
        let mut state = SchedState::default();
        let (notification, sink) = notification_with_sink();
        let rscs = [ResourceName::from("a"), ResourceName::from("b")];

        state.mark_pending_rsc_dispatch(Some(&notification), rscs.iter());
        state.mark_pending_node_dispatch(Some(&notification), &NodeName::from("n1"));

        assert_eq!(state.pending_dispatch_rscs.len(), 2);
        assert_eq!(state.pending_dispatch_rscs[&rscs[0]].len(), 1);
        assert_eq!(state.pending_response_sinks.len(), 1);
        assert!(state.pending_response_sinks[0].same_channel(&sink));
    }

    #[test]
    fn test_mark_without_notification() {
        let mut state = SchedState::default();
        let key = SnapshotKey::new("a", "s1");
        state.mark_pending_snap_dispatch(None, [&key]);
        assert!(state.pending_dispatch_snaps[&key].is_empty());
        assert!(state.pending_response_sinks.is_empty());
    }

    #[test]
    fn test_retained_sinks_keep_dispatch_alive() {
        let mut state = SchedState::default();
        let (notification, _sink) = notification_with_sink();
        state.retain_response_sinks(Some(&notification));
        state.retain_response_sinks(Some(&notification));

        let request = state.take_dispatch();
        assert!(request.rscs.is_empty());
        assert_eq!(request.sinks.len(), 1);
        assert!(!request.is_empty());
    }

    #[test]
    fn test_take_dispatch_empties_state() {
        let mut state = SchedState::default();
        state.mark_pending_rsc_dispatch(None, [&ResourceName::from("a")]);
        let request = state.take_dispatch();
        assert!(!request.is_empty());
        assert!(state.take_dispatch().is_empty());
    }

    #[test]
    fn test_take_deleted() {
        let mut state = SchedState::default();
        state.deleted_rscs.insert(ResourceName::from("a"));
        let deleted = state.take_deleted();
        assert_eq!(deleted.rscs.len(), 1);
        assert_eq!(state.take_deleted(), DeletedObjects::default());
    }

    #[test]
    fn test_flag_defaults() {
        let flags = LoopFlags::default();
        assert!(LoopFlags::get(&flags.wait_upd));
        assert!(!flags.keep_waiting());
        LoopFlags::set(&flags.svc_cond, true);
        assert!(flags.keep_waiting());
        LoopFlags::set(&flags.shutdown, true);
        assert!(!flags.keep_waiting());
    }

    #[tokio::test]
    async fn test_notify_before_wait_is_not_lost() {
        let sched = Scheduler::new();
        sched.notify();
        tokio::time::timeout(Duration::from_secs(1), sched.wait())
            .await
            .unwrap();
    }
}
