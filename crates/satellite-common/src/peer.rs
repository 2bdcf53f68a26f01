//! Controller-facing contracts.
//!
//! The device manager never talks to the network itself. Outgoing update
//! requests go through an [`UpdateRequester`], notifications about applied or
//! failed resources through a [`ControllerPeer`] obtained from a
//! [`ControllerPeerConnector`]. All calls are expected to enqueue and return
//! without blocking on the device manager.

use crate::api_call_rc::ApiCallRc;
use crate::identifiers::{NodeName, ResourceKey, SnapshotKey, StorPoolName};
use crate::layer::LocalPropsChange;
use crate::objects::SpaceInfo;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Free space per storage pool, sent along with "resource applied".
pub type SpaceInfoMap = BTreeMap<StorPoolName, SpaceInfo>;

/// Requests authoritative object data from the controller.
///
/// The answers arrive asynchronously and are applied to the object graph by
/// the caller, which then reports them through the device manager's
/// `*_update_applied` callbacks. An implementation may answer from within
/// the request call.
pub trait UpdateRequester: Send + Sync {
    fn request_controller_update(&self);

    fn request_node_update(&self, uuid: Uuid, node_name: &NodeName);

    fn request_rsc_update(&self, uuid: Uuid, key: &ResourceKey);

    fn request_stor_pool_update(&self, uuid: Uuid, stor_pool_name: &StorPoolName);

    fn request_snapshot_update(&self, uuid: Uuid, key: &SnapshotKey);
}

/// Connection to the controller.
pub trait ControllerPeer: Send + Sync {
    /// A resource was adjusted successfully.
    fn notify_resource_applied(&self, key: &ResourceKey, space_info: &SpaceInfoMap);

    /// Processing a resource failed.
    fn notify_resource_failed(&self, key: &ResourceKey, response: &ApiCallRc);

    /// Free space of storage pools changed.
    fn notify_free_spaces_changed(&self, space_info: &SpaceInfoMap);

    /// One device manager cycle finished.
    fn notify_dev_mgr_run_completed(&self, cycle: u64);

    /// Local node or storage pool properties changed on the satellite.
    fn send_props_change(&self, change: &LocalPropsChange);
}

/// Provides the current controller connection, if any.
pub trait ControllerPeerConnector: Send + Sync {
    fn controller_peer(&self) -> Option<Arc<dyn ControllerPeer>>;

    /// Name of the node this satellite runs on.
    fn local_node_name(&self) -> NodeName;
}
