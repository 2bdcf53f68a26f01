//! Layer-data tree of resources and snapshots.
//!
//! Every resource carries one [`RscLayerData`] tree mirroring its device
//! layer stack, e.g. a DRBD node whose child is a storage node. Each tree node
//! owns the per-volume provider state ([`VlmLayerData`]) of its layer.
//!
//! Walks over the tree never recurse: they use an explicit stack (or queue)
//! and a set of visited node ids. A tree that reaches an id twice is corrupt
//! and the walk fails with [`LayerTreeError::DuplicateNode`].

use crate::identifiers::{ResourceName, StorPoolName, VolumeNumber};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use thiserror::Error;

/// Supported device layer technologies.
///
/// The declaration order is the fixed enumeration order used wherever layers
/// are ordered (batching, prepare order, tie-breaks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceLayerKind {
    /// Replication over the network
    Drbd,
    /// Encryption
    Luks,
    /// NVMe-oF target/initiator
    Nvme,
    /// dm-writecache
    Writecache,
    /// dm-cache
    Cache,
    /// bcache
    Bcache,
    /// Backing storage (LVM, ZFS, files, ...)
    Storage,
}

impl DeviceLayerKind {
    /// All kinds in enumeration order.
    pub const ALL: [DeviceLayerKind; 7] = [
        DeviceLayerKind::Drbd,
        DeviceLayerKind::Luks,
        DeviceLayerKind::Nvme,
        DeviceLayerKind::Writecache,
        DeviceLayerKind::Cache,
        DeviceLayerKind::Bcache,
        DeviceLayerKind::Storage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceLayerKind::Drbd => "DRBD",
            DeviceLayerKind::Luks => "LUKS",
            DeviceLayerKind::Nvme => "NVME",
            DeviceLayerKind::Writecache => "WRITECACHE",
            DeviceLayerKind::Cache => "CACHE",
            DeviceLayerKind::Bcache => "BCACHE",
            DeviceLayerKind::Storage => "STORAGE",
        }
    }
}

impl fmt::Display for DeviceLayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric identity of one layer-data node.
pub type LayerDataId = u32;

/// Child-index path from the root of a layer-data tree to one node.
///
/// The root has the empty path.
pub type LayerPath = Vec<usize>;

/// Order in which [`RscLayerData::walk_paths`] reports nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOrder {
    /// Parent before its children
    PreOrder,
    /// Children before their parent
    PostOrder,
}

/// Errors raised while walking a layer-data tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerTreeError {
    #[error("Layer data {id} of resource '{rsc_name}' was reached twice while walking its layer tree")]
    DuplicateNode { id: LayerDataId, rsc_name: String },
}

/// Per-volume state owned by one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlmLayerData {
    pub vlm_nr: VolumeNumber,
    /// Whether the device of this layer exists on the host
    pub exists: bool,
    /// Size the layer offers to the layer above, in KiB
    pub usable_size_kib: Option<u64>,
    /// Size the layer needs from the layer below (usable plus metadata), in KiB
    pub allocated_size_kib: Option<u64>,
    pub stor_pool: Option<StorPoolName>,
    pub device_path: Option<String>,
}

impl VlmLayerData {
    pub fn new(vlm_nr: VolumeNumber) -> Self {
        Self {
            vlm_nr,
            exists: false,
            usable_size_kib: None,
            allocated_size_kib: None,
            stor_pool: None,
            device_path: None,
        }
    }

    pub fn with_stor_pool(mut self, stor_pool: impl Into<StorPoolName>) -> Self {
        self.stor_pool = Some(stor_pool.into());
        self
    }
}

/// One node of a layer-data tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RscLayerData {
    pub id: LayerDataId,
    pub kind: DeviceLayerKind,
    pub rsc_name: ResourceName,
    /// Suffix distinguishing sibling sub-resources (e.g. ".meta")
    pub suffix: String,
    pub children: Vec<RscLayerData>,
    pub volumes: BTreeMap<VolumeNumber, VlmLayerData>,
    /// Desired I/O suspension (e.g. while a snapshot is taken)
    pub should_suspend_io: bool,
    /// Live suspension state as last reported by the layer, if known
    pub suspended: Option<bool>,
    failed: bool,
}

impl RscLayerData {
    pub fn new(id: LayerDataId, kind: DeviceLayerKind, rsc_name: impl Into<ResourceName>) -> Self {
        Self {
            id,
            kind,
            rsc_name: rsc_name.into(),
            suffix: String::new(),
            children: Vec::new(),
            volumes: BTreeMap::new(),
            should_suspend_io: false,
            suspended: None,
            failed: false,
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_child(mut self, child: RscLayerData) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_volume(mut self, vlm: VlmLayerData) -> Self {
        self.volumes.insert(vlm.vlm_nr, vlm);
        self
    }

    /// Resource name including the sub-resource suffix.
    pub fn suffixed_name(&self) -> String {
        format!("{}{}", self.rsc_name, self.suffix)
    }

    /// Returns true if any volume of this layer exists on the host.
    pub fn exists(&self) -> bool {
        self.volumes.values().any(|vlm| vlm.exists)
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Marks this layer as failed. The device handler stops processing the
    /// layers above it.
    pub fn set_failed(&mut self, failed: bool) {
        self.failed = failed;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.unwrap_or(false)
    }

    /// Returns the node at `path`, if any.
    pub fn node(&self, path: &[usize]) -> Option<&RscLayerData> {
        let mut cur = self;
        for idx in path {
            cur = cur.children.get(*idx)?;
        }
        Some(cur)
    }

    /// Returns the node at `path` mutably, if any.
    pub fn node_mut(&mut self, path: &[usize]) -> Option<&mut RscLayerData> {
        let mut cur = self;
        for idx in path {
            cur = cur.children.get_mut(*idx)?;
        }
        Some(cur)
    }

    /// Kinds of the ancestors of the node at `path`, nearest first.
    pub fn ancestor_kinds(&self, path: &[usize]) -> Vec<DeviceLayerKind> {
        (0..path.len())
            .rev()
            .filter_map(|len| self.node(&path[..len]).map(|node| node.kind))
            .collect()
    }

    /// All nodes of the tree, breadth first, root included.
    pub fn breadth_first(&self) -> Result<Vec<&RscLayerData>, LayerTreeError> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([self]);
        let mut out = Vec::new();
        while let Some(node) = queue.pop_front() {
            if !visited.insert(node.id) {
                return Err(self.duplicate(node.id));
            }
            queue.extend(node.children.iter());
            out.push(node);
        }
        Ok(out)
    }

    /// Paths of all nodes in the requested order, root included.
    pub fn walk_paths(&self, order: WalkOrder) -> Result<Vec<LayerPath>, LayerTreeError> {
        let mut visited = BTreeSet::new();
        let mut out = Vec::new();
        // (path, children already pushed)
        let mut stack: Vec<(LayerPath, bool)> = vec![(Vec::new(), false)];

        while let Some((path, expanded)) = stack.pop() {
            if expanded {
                out.push(path);
                continue;
            }
            let Some(node) = self.node(&path) else {
                continue;
            };
            if !visited.insert(node.id) {
                return Err(self.duplicate(node.id));
            }
            match order {
                WalkOrder::PreOrder => out.push(path.clone()),
                WalkOrder::PostOrder => stack.push((path.clone(), true)),
            }
            for idx in (0..node.children.len()).rev() {
                let mut child_path = path.clone();
                child_path.push(idx);
                stack.push((child_path, false));
            }
        }
        Ok(out)
    }

    /// Returns true if the layer or any layer below it has failed.
    pub fn any_failed(&self) -> bool {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.failed {
                return true;
            }
            stack.extend(node.children.iter());
        }
        false
    }

    /// Removes the volume from this layer and every layer below it.
    pub fn remove_volume(&mut self, vlm_nr: VolumeNumber) {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            node.volumes.remove(&vlm_nr);
            stack.extend(node.children.iter_mut());
        }
    }

    fn duplicate(&self, id: LayerDataId) -> LayerTreeError {
        LayerTreeError::DuplicateNode {
            id,
            rsc_name: self.suffixed_name(),
        }
    }
}
