//! Object model and capability contracts of the satellite device manager.
//!
//! This crate provides the types the device manager core consumes and
//! produces:
//!
//! - [`ObjectGraph`]: nodes, resource definitions and storage pools behind
//!   their lock set
//! - [`RscLayerData`]: the per-resource layer-data tree
//! - [`DeviceLayer`]: the capability contract of one device layer
//! - [`UpdateBundle`]: pending update notifications per object class
//! - [`ResponseSink`] / [`ResponseStream`]: completion channels back to the
//!   requester of a change
//! - [`UpdateRequester`], [`ControllerPeer`]: the controller side
//!
//! # Architecture
//!
//! 1. The controller announces changed objects (by UUID)
//! 2. The device manager requests the changed objects
//! 3. The received objects are applied to the [`ObjectGraph`]
//! 4. The device manager dispatches the affected resources to the layers
//! 5. Outcomes flow back through response sinks and [`ControllerPeer`]

mod api_call_rc;
mod flags;
mod graph;
mod identifiers;
mod layer;
mod layer_data;
mod objects;
mod peer;
mod response;
mod security;
mod update;

pub use api_call_rc::{rc, ApiCallRc, RcEntry};
pub use flags::{RscFlag, SnapshotFlag, StateFlags, VlmDfnFlag, VlmFlag};
pub use graph::{GraphWriteGuard, NodesMap, ObjectGraph, RscDfnMap, StorPoolDfnMap};
pub use identifiers::{
    NodeName, ResourceKey, ResourceName, SnapshotKey, SnapshotName, StorPoolName, VolumeKey,
    VolumeNumber,
};
pub use layer::{
    DeviceLayer, ErrorTexts, LayerContext, LayerDataRef, LayerError, LayerResult,
    LayerSplitTracker, LocalPropsChange, NoLayerSplitTracking,
};
pub use layer_data::{
    DeviceLayerKind, LayerDataId, LayerPath, LayerTreeError, RscLayerData, VlmLayerData, WalkOrder,
};
pub use objects::{
    Node, Props, ProviderKind, Resource, ResourceDefinition, Snapshot, SnapshotDefinition,
    SpaceInfo, StorPool, StorPoolDefinition, Volume, VolumeDefinition,
};
pub use peer::{ControllerPeer, ControllerPeerConnector, SpaceInfoMap, UpdateRequester};
pub use response::{response_channel, ResponseSink, ResponseStream};
pub use security::SecurityObjects;
pub use update::{UpdateBundle, UpdateNotification};
