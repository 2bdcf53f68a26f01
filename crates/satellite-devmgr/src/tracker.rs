//! Notification ingress.
//!
//! The controller announces changed objects by UUID. Each announcement is
//! recorded in the scheduler's notification bundle together with a fresh
//! response sink; the caller receives the matching stream and learns the
//! outcome once the device manager dispatched the change.

use crate::sched::Scheduler;
use satellite_common::{
    response_channel, NodeName, ResourceKey, ResourceName, ResponseStream, SnapshotKey,
    SnapshotName, StorPoolName, UpdateBundle, UpdateNotification,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

/// Records controller notifications for the next device manager cycle.
#[derive(Debug, Clone)]
pub struct UpdateTracker {
    sched: Arc<Scheduler>,
}

impl UpdateTracker {
    pub(crate) fn new(sched: Arc<Scheduler>) -> Self {
        Self { sched }
    }

    /// The controller's own configuration changed.
    pub fn update_controller(&self) -> ResponseStream {
        self.track(|bundle, notification| match &mut bundle.controller_update {
            Some(existing) => existing.merge(notification),
            None => bundle.controller_update = Some(notification),
        })
    }

    pub fn update_node(&self, uuid: Uuid, node_name: NodeName) -> ResponseStream {
        trace!("Update notification for node '{}'", node_name);
        self.track_keyed(uuid, node_name, |bundle| &mut bundle.node_updates)
    }

    pub fn update_resource(
        &self,
        uuid: Uuid,
        rsc_name: ResourceName,
        node_name: NodeName,
    ) -> ResponseStream {
        trace!("Update notification for resource '{}' on node '{}'", rsc_name, node_name);
        self.track_keyed(uuid, ResourceKey::new(node_name, rsc_name), |bundle| {
            &mut bundle.rsc_updates
        })
    }

    pub fn update_stor_pool(&self, uuid: Uuid, stor_pool_name: StorPoolName) -> ResponseStream {
        self.track_keyed(uuid, stor_pool_name, |bundle| &mut bundle.stor_pool_updates)
    }

    pub fn update_snapshot(
        &self,
        uuid: Uuid,
        rsc_name: ResourceName,
        snapshot_name: SnapshotName,
    ) -> ResponseStream {
        self.track_keyed(uuid, SnapshotKey::new(rsc_name, snapshot_name), |bundle| {
            &mut bundle.snapshot_updates
        })
    }

    fn track_keyed<K: Ord>(
        &self,
        uuid: Uuid,
        key: K,
        map: impl FnOnce(&mut UpdateBundle) -> &mut BTreeMap<K, UpdateNotification>,
    ) -> ResponseStream {
        let (sink, stream) = response_channel();
        let mut notification = UpdateNotification::new(uuid);
        notification.add_response_sink(sink);
        {
            let mut sched = self.sched.lock();
            let entries = map(&mut sched.cached);
            match entries.get_mut(&key) {
                Some(existing) => existing.merge(notification),
                None => {
                    entries.insert(key, notification);
                }
            }
        }
        self.sched.notify();
        stream
    }

    fn track(&self, apply: impl FnOnce(&mut UpdateBundle, UpdateNotification)) -> ResponseStream {
        let (sink, stream) = response_channel();
        let mut notification = UpdateNotification::new(Uuid::nil());
        notification.add_response_sink(sink);
        apply(&mut self.sched.lock().cached, notification);
        self.sched.notify();
        stream
    }
}
