//! Outcome notifications from the device handler.
//!
//! Dispatch responses and deleted objects are remembered in the scheduler
//! and acted upon after the dispatch finished; applied/failed resources and
//! free space changes go straight to the controller.

use crate::sched::Scheduler;
use satellite_common::{
    ApiCallRc, ControllerPeerConnector, ResourceKey, ResourceName, SnapshotKey, SpaceInfoMap,
    VolumeKey,
};
use std::sync::Arc;
use tracing::debug;

/// Receives the outcome of device handler work.
pub trait NotificationListener: Send + Sync {
    fn notify_resource_dispatch_response(&self, rsc_name: &ResourceName, response: ApiCallRc);

    fn notify_snapshot_dispatch_response(&self, key: &SnapshotKey, response: ApiCallRc);

    fn notify_resource_applied(&self, key: &ResourceKey, space_info: &SpaceInfoMap);

    fn notify_resource_failed(&self, key: &ResourceKey, response: &ApiCallRc);

    fn notify_resource_deleted(&self, rsc_name: &ResourceName);

    fn notify_volume_deleted(&self, key: &VolumeKey);

    fn notify_snapshot_deleted(&self, key: &SnapshotKey);

    fn notify_free_spaces_changed(&self, space_info: &SpaceInfoMap);
}

/// Listener of the device manager.
pub struct DispatchListener {
    sched: Arc<Scheduler>,
    connector: Arc<dyn ControllerPeerConnector>,
}

impl DispatchListener {
    pub fn new(sched: Arc<Scheduler>, connector: Arc<dyn ControllerPeerConnector>) -> Self {
        Self { sched, connector }
    }
}

impl NotificationListener for DispatchListener {
    // Later responses of the same dispatch are appended, the first outcome stays visible.
    fn notify_resource_dispatch_response(&self, rsc_name: &ResourceName, response: ApiCallRc) {
        self.sched
            .lock()
            .dispatch_rsc_responses
            .entry(rsc_name.clone())
            .or_default()
            .add_entries(response);
    }

    fn notify_snapshot_dispatch_response(&self, key: &SnapshotKey, response: ApiCallRc) {
        self.sched
            .lock()
            .dispatch_snap_responses
            .entry(key.clone())
            .or_default()
            .add_entries(response);
    }

    fn notify_resource_applied(&self, key: &ResourceKey, space_info: &SpaceInfoMap) {
        match self.connector.controller_peer() {
            Some(peer) => peer.notify_resource_applied(key, space_info),
            None => debug!("No controller connection, not sending applied notification for {}", key),
        }
    }

    fn notify_resource_failed(&self, key: &ResourceKey, response: &ApiCallRc) {
        if let Some(peer) = self.connector.controller_peer() {
            peer.notify_resource_failed(key, response);
        }
    }

    fn notify_resource_deleted(&self, rsc_name: &ResourceName) {
        self.sched.lock().deleted_rscs.insert(rsc_name.clone());
    }

    fn notify_volume_deleted(&self, key: &VolumeKey) {
        self.sched.lock().deleted_vlms.insert(key.clone());
    }

    fn notify_snapshot_deleted(&self, key: &SnapshotKey) {
        self.sched.lock().deleted_snaps.insert(key.clone());
    }

    fn notify_free_spaces_changed(&self, space_info: &SpaceInfoMap) {
        if let Some(peer) = self.connector.controller_peer() {
            peer.notify_free_spaces_changed(space_info);
        }
    }
}
