//! Processing order of resources across device layers.
//!
//! Resources may be stacked: a resource can have child resources that must
//! exist before it (creation is bottom-up) and that must survive until it is
//! gone (deletion is top-down). A [`TraverseOrder`] partitions the resources
//! to process into batches per outermost layer kind and decides which
//! resources of a batch are processable given what is still pending.
//!
//! [`plan_waves`] repeatedly picks the batch with the most processable
//! resources across all kinds and emits those resources as one wave, until
//! nothing is left.

use crate::error::{DevMgrError, DevMgrResult};
use satellite_common::{DeviceLayerKind, Resource, ResourceName};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::trace;

/// Direction of a traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversePhase {
    /// Children before parents (create, adjust)
    BottomUp,
    /// Parents before children (delete)
    TopDown,
}

impl fmt::Display for TraversePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraversePhase::BottomUp => write!(f, "bottom-up"),
            TraversePhase::TopDown => write!(f, "top-down"),
        }
    }
}

/// Relations of one resource, detached from the object graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraverseNode {
    pub name: ResourceName,
    pub kind: DeviceLayerKind,
    pub parent: Option<ResourceName>,
    pub children: BTreeSet<ResourceName>,
}

impl TraverseNode {
    pub fn of(rsc: &Resource) -> Self {
        Self {
            name: rsc.name.clone(),
            kind: rsc.layer_kind(),
            parent: rsc.parent.clone(),
            children: rsc.children.clone(),
        }
    }
}

/// Resource relations of the local node, by resource name.
///
/// Built from every local resource (not only the ones being dispatched) so
/// dependency checks see objects that are about to be deleted as well.
#[derive(Debug, Clone, Default)]
pub struct ResourceIndex {
    nodes: BTreeMap<ResourceName, TraverseNode>,
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_resources<'a>(rscs: impl IntoIterator<Item = &'a Resource>) -> Self {
        let mut index = Self::new();
        for rsc in rscs {
            index.insert(TraverseNode::of(rsc));
        }
        index
    }

    pub fn insert(&mut self, node: TraverseNode) {
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn get(&self, name: &ResourceName) -> Option<&TraverseNode> {
        self.nodes.get(name)
    }

    fn require(&self, name: &ResourceName) -> DevMgrResult<&TraverseNode> {
        self.get(name).ok_or_else(|| {
            DevMgrError::implementation(format!("Resource '{}' is not indexed", name))
        })
    }
}

/// Resources of one outermost layer kind.
pub type Batch = (DeviceLayerKind, Vec<ResourceName>);

/// Resources handled together in one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave {
    pub kind: DeviceLayerKind,
    pub resources: Vec<ResourceName>,
}

/// Ordering strategy for one traversal direction.
pub trait TraverseOrder: Send + Sync {
    fn phase(&self) -> TraversePhase;

    /// Groups `rscs` by outermost layer kind.
    ///
    /// Returns one batch per known kind, empty ones included, in kind
    /// enumeration order.
    fn get_all_batches(&self, index: &ResourceIndex, rscs: &[ResourceName]) -> DevMgrResult<Vec<Batch>> {
        let mut batches: Vec<Batch> = DeviceLayerKind::ALL
            .iter()
            .map(|kind| (*kind, Vec::new()))
            .collect();
        for name in rscs {
            let kind = index.require(name)?.kind;
            if let Some((_, batch)) = batches.iter_mut().find(|(k, _)| *k == kind) {
                batch.push(name.clone());
            }
        }
        Ok(batches)
    }

    /// Returns true if no dependency of `rsc` is still in `to_process`.
    ///
    /// Fails if the walk over the relation reaches a resource twice.
    fn is_processable(
        &self,
        index: &ResourceIndex,
        rsc: &ResourceName,
        to_process: &BTreeSet<ResourceName>,
    ) -> DevMgrResult<bool>;

    /// Counts the processable resources of `candidates`.
    fn get_processable_count(
        &self,
        index: &ResourceIndex,
        candidates: &[ResourceName],
        to_process: &BTreeSet<ResourceName>,
    ) -> DevMgrResult<usize> {
        let mut count = 0;
        for rsc in candidates {
            if self.is_processable(index, rsc, to_process)? {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Creation order: a resource waits for all resources below it.
#[derive(Debug, Clone, Copy, Default)]
pub struct BottomUp;

/// Deletion order: a resource waits for all resources above it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopDown;

impl TraverseOrder for BottomUp {
    fn phase(&self) -> TraversePhase {
        TraversePhase::BottomUp
    }

    fn is_processable(
        &self,
        index: &ResourceIndex,
        rsc: &ResourceName,
        to_process: &BTreeSet<ResourceName>,
    ) -> DevMgrResult<bool> {
        let mut visited = BTreeSet::from([rsc.clone()]);
        let mut stack: Vec<&ResourceName> = index.require(rsc)?.children.iter().collect();

        while let Some(child) = stack.pop() {
            if !visited.insert(child.clone()) {
                return Err(cyclic(rsc, child));
            }
            if to_process.contains(child) {
                return Ok(false);
            }
            if let Some(node) = index.get(child) {
                stack.extend(node.children.iter());
            }
        }
        Ok(true)
    }
}

impl TraverseOrder for TopDown {
    fn phase(&self) -> TraversePhase {
        TraversePhase::TopDown
    }

    fn is_processable(
        &self,
        index: &ResourceIndex,
        rsc: &ResourceName,
        to_process: &BTreeSet<ResourceName>,
    ) -> DevMgrResult<bool> {
        let mut visited = BTreeSet::from([rsc.clone()]);
        let mut parent = index.require(rsc)?.parent.as_ref();

        while let Some(cur) = parent {
            if !visited.insert(cur.clone()) {
                return Err(cyclic(rsc, cur));
            }
            if to_process.contains(cur) {
                return Ok(false);
            }
            parent = index.get(cur).and_then(|node| node.parent.as_ref());
        }
        Ok(true)
    }
}

fn cyclic(start: &ResourceName, revisited: &ResourceName) -> DevMgrError {
    DevMgrError::implementation(format!(
        "Cyclic resource relation detected: resource '{}' reached '{}' twice",
        start, revisited
    ))
}

/// Splits `rscs` into waves that respect the order's dependencies.
///
/// Each step compares the processable counts of all kind batches over the
/// entire remaining set and takes the largest one; on a tie the kind that
/// comes first in enumeration order wins. Only the processable resources of
/// the chosen batch form the wave.
pub fn plan_waves(
    order: &dyn TraverseOrder,
    index: &ResourceIndex,
    rscs: &[ResourceName],
) -> DevMgrResult<Vec<Wave>> {
    let mut remaining: Vec<ResourceName> = rscs.to_vec();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let to_process: BTreeSet<ResourceName> = remaining.iter().cloned().collect();
        let batches = order.get_all_batches(index, &remaining)?;

        let mut best: Option<(DeviceLayerKind, Vec<ResourceName>)> = None;
        for (kind, batch) in batches {
            let mut processable = Vec::new();
            for rsc in &batch {
                if order.is_processable(index, rsc, &to_process)? {
                    processable.push(rsc.clone());
                }
            }
            let better = best
                .as_ref()
                .map_or(true, |(_, cur)| processable.len() > cur.len());
            if better {
                best = Some((kind, processable));
            }
        }

        let (kind, resources) = match best {
            Some((kind, resources)) if !resources.is_empty() => (kind, resources),
            _ => {
                return Err(DevMgrError::implementation(format!(
                    "No processable resource among {} remaining in {} order",
                    remaining.len(),
                    order.phase()
                )))
            }
        };

        trace!(phase = %order.phase(), %kind, count = resources.len(), "Planned wave");
        remaining.retain(|rsc| !resources.contains(rsc));
        waves.push(Wave { kind, resources });
    }
    Ok(waves)
}
