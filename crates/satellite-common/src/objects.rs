//! In-memory satellite objects: nodes, resource definitions, resources,
//! volumes, snapshots and storage pools.
//!
//! The objects are owned by the object graph ([`crate::ObjectGraph`]); the
//! device manager reads them and only removes them in its deferred cleanup.

use crate::flags::{RscFlag, SnapshotFlag, StateFlags, VlmDfnFlag, VlmFlag};
use crate::identifiers::{
    NodeName, ResourceKey, ResourceName, SnapshotKey, SnapshotName, StorPoolName, VolumeNumber,
};
use crate::layer_data::{DeviceLayerKind, RscLayerData};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Property container of nodes and other objects.
pub type Props = BTreeMap<String, String>;

/// A volume of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub vlm_nr: VolumeNumber,
    pub flags: StateFlags<VlmFlag>,
    /// Size of the volume definition, in KiB
    pub size_kib: u64,
}

impl Volume {
    pub fn new(vlm_nr: VolumeNumber, size_kib: u64) -> Self {
        Self {
            vlm_nr,
            flags: StateFlags::new(),
            size_kib,
        }
    }
}

/// A resource definition deployed on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: ResourceName,
    pub node_name: NodeName,
    pub flags: StateFlags<RscFlag>,
    pub volumes: BTreeMap<VolumeNumber, Volume>,
    /// Resource this one is stacked into, if any
    pub parent: Option<ResourceName>,
    /// Resources stacked below this one; they must exist before it
    pub children: BTreeSet<ResourceName>,
    pub layer_data: RscLayerData,
}

impl Resource {
    pub fn new(
        name: impl Into<ResourceName>,
        node_name: impl Into<NodeName>,
        layer_data: RscLayerData,
    ) -> Self {
        Self {
            name: name.into(),
            node_name: node_name.into(),
            flags: StateFlags::new(),
            volumes: BTreeMap::new(),
            parent: None,
            children: BTreeSet::new(),
            layer_data,
        }
    }

    pub fn with_flag(mut self, flag: RscFlag) -> Self {
        self.flags.enable(flag);
        self
    }

    pub fn with_volume(mut self, vlm: Volume) -> Self {
        self.volumes.insert(vlm.vlm_nr, vlm);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<ResourceName>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_child(mut self, child: impl Into<ResourceName>) -> Self {
        self.children.insert(child.into());
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.node_name.clone(), self.name.clone())
    }

    /// Kind of the outermost layer of the resource.
    pub fn layer_kind(&self) -> DeviceLayerKind {
        self.layer_data.kind
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(RscFlag::Delete)
    }

    pub fn is_inactive(&self) -> bool {
        self.flags.is_some_set(&[RscFlag::Inactive, RscFlag::Inactivating])
    }
}

/// A volume definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDefinition {
    pub vlm_nr: VolumeNumber,
    pub size_kib: u64,
    pub flags: StateFlags<VlmDfnFlag>,
}

impl VolumeDefinition {
    pub fn new(vlm_nr: VolumeNumber, size_kib: u64) -> Self {
        Self {
            vlm_nr,
            size_kib,
            flags: StateFlags::new(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.is_set(VlmDfnFlag::Encrypted)
    }
}

/// A snapshot of a resource on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub rsc_name: ResourceName,
    pub snapshot_name: SnapshotName,
    pub node_name: NodeName,
    pub flags: StateFlags<SnapshotFlag>,
    pub layer_data: RscLayerData,
}

impl Snapshot {
    pub fn new(
        rsc_name: impl Into<ResourceName>,
        snapshot_name: impl Into<SnapshotName>,
        node_name: impl Into<NodeName>,
        layer_data: RscLayerData,
    ) -> Self {
        Self {
            rsc_name: rsc_name.into(),
            snapshot_name: snapshot_name.into(),
            node_name: node_name.into(),
            flags: StateFlags::new(),
            layer_data,
        }
    }

    pub fn with_flag(mut self, flag: SnapshotFlag) -> Self {
        self.flags.enable(flag);
        self
    }

    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::new(self.rsc_name.clone(), self.snapshot_name.clone())
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(SnapshotFlag::Delete)
    }
}

/// A snapshot definition with its per-node snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDefinition {
    pub name: SnapshotName,
    pub snapshots: BTreeMap<NodeName, Snapshot>,
}

impl SnapshotDefinition {
    pub fn new(name: impl Into<SnapshotName>) -> Self {
        Self {
            name: name.into(),
            snapshots: BTreeMap::new(),
        }
    }

    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshots.insert(snapshot.node_name.clone(), snapshot);
        self
    }
}

/// A resource definition with its resources, volume definitions and
/// snapshot definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDefinition {
    pub name: ResourceName,
    pub resources: BTreeMap<NodeName, Resource>,
    pub volume_dfns: BTreeMap<VolumeNumber, VolumeDefinition>,
    pub snapshot_dfns: BTreeMap<SnapshotName, SnapshotDefinition>,
}

impl ResourceDefinition {
    pub fn new(name: impl Into<ResourceName>) -> Self {
        Self {
            name: name.into(),
            resources: BTreeMap::new(),
            volume_dfns: BTreeMap::new(),
            snapshot_dfns: BTreeMap::new(),
        }
    }

    pub fn with_resource(mut self, rsc: Resource) -> Self {
        self.resources.insert(rsc.node_name.clone(), rsc);
        self
    }

    pub fn with_volume_dfn(mut self, vlm_dfn: VolumeDefinition) -> Self {
        self.volume_dfns.insert(vlm_dfn.vlm_nr, vlm_dfn);
        self
    }

    pub fn with_snapshot_dfn(mut self, snap_dfn: SnapshotDefinition) -> Self {
        self.snapshot_dfns.insert(snap_dfn.name.clone(), snap_dfn);
        self
    }

    pub fn resource(&self, node_name: &NodeName) -> Option<&Resource> {
        self.resources.get(node_name)
    }

    pub fn has_encrypted_volumes(&self) -> bool {
        self.volume_dfns.values().any(VolumeDefinition::is_encrypted)
    }

    pub fn snapshot(&self, snapshot_name: &SnapshotName, node_name: &NodeName) -> Option<&Snapshot> {
        self.snapshot_dfns
            .get(snapshot_name)
            .and_then(|snap_dfn| snap_dfn.snapshots.get(node_name))
    }
}

/// Provider technology backing a storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    Diskless,
    Lvm,
    LvmThin,
    Zfs,
    ZfsThin,
    File,
    FileThin,
}

/// A storage pool of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorPool {
    pub name: StorPoolName,
    pub node_name: NodeName,
    pub provider: ProviderKind,
    pub props: Props,
}

impl StorPool {
    pub fn new(
        name: impl Into<StorPoolName>,
        node_name: impl Into<NodeName>,
        provider: ProviderKind,
    ) -> Self {
        Self {
            name: name.into(),
            node_name: node_name.into(),
            provider,
            props: Props::new(),
        }
    }
}

/// Capacity information of a storage pool, in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub total_capacity_kib: u64,
    pub free_capacity_kib: u64,
}

/// Cluster-wide definition of a storage pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorPoolDefinition {
    pub name: StorPoolName,
    pub props: Props,
}

/// A cluster node as known to this satellite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: NodeName,
    pub props: Props,
    pub stor_pools: BTreeMap<StorPoolName, StorPool>,
}

impl Node {
    pub fn new(name: impl Into<NodeName>) -> Self {
        Self {
            name: name.into(),
            props: Props::new(),
            stor_pools: BTreeMap::new(),
        }
    }

    pub fn with_stor_pool(mut self, stor_pool: StorPool) -> Self {
        self.stor_pools.insert(stor_pool.name.clone(), stor_pool);
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }
}
