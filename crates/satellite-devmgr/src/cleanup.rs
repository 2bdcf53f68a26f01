//! Removal of deleted objects from the object graph.
//!
//! Runs after a dispatch, once every requester has been answered. Objects
//! the device handler reported as deleted are dropped together with whatever
//! only existed because of them: peer resources of a deleted resource, the
//! resource definition itself and peer nodes that no longer share a
//! resource with the local node.

use crate::sched::DeletedObjects;
use satellite_common::{GraphWriteGuard, NodeName, ResourceKey};
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// What a cleanup removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub snapshot_dfns: usize,
    pub rsc_dfns: usize,
    pub resources: usize,
    pub volume_dfns: usize,
    pub nodes: Vec<NodeName>,
}

impl CleanupSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Removes deleted snapshots, resources, volumes and the objects depending
/// on them. `remote_deletions` are peer resources flagged for deletion that
/// were seen while collecting the dispatch.
pub fn deleted_objects_cleanup(
    graph: &mut GraphWriteGuard<'_>,
    deleted: &DeletedObjects,
    remote_deletions: &[ResourceKey],
) -> CleanupSummary {
    let local_node_name = graph.local_node_name().clone();
    let rsc_dfns = &mut *graph.rsc_dfns;
    let mut summary = CleanupSummary::default();
    let mut peer_nodes: BTreeSet<NodeName> = BTreeSet::new();

    for key in &deleted.snaps {
        let Some(rsc_dfn) = rsc_dfns.get_mut(&key.rsc_name) else {
            continue;
        };
        if rsc_dfn.snapshot_dfns.remove(&key.snapshot_name).is_some() {
            trace!("Removed snapshot definition {}", key);
            summary.snapshot_dfns += 1;
        }
        if rsc_dfn.resources.is_empty() && rsc_dfn.snapshot_dfns.is_empty() {
            rsc_dfns.remove(&key.rsc_name);
            summary.rsc_dfns += 1;
        }
    }

    for rsc_name in &deleted.rscs {
        let Some(rsc_dfn) = rsc_dfns.get_mut(rsc_name) else {
            continue;
        };
        // the resource is gone locally, its peers are of no interest anymore
        let nodes = std::mem::take(&mut rsc_dfn.resources);
        summary.resources += nodes.len();
        peer_nodes.extend(nodes.into_keys().filter(|node| *node != local_node_name));

        if rsc_dfn.snapshot_dfns.is_empty() {
            rsc_dfns.remove(rsc_name);
            summary.rsc_dfns += 1;
        }
    }

    for key in remote_deletions {
        let Some(rsc_dfn) = rsc_dfns.get_mut(&key.rsc_name) else {
            continue;
        };
        if rsc_dfn.resources.remove(&key.node_name).is_some() {
            trace!("Removed remote resource {}", key);
            summary.resources += 1;
            peer_nodes.insert(key.node_name.clone());
        }
    }

    for key in &deleted.vlms {
        let Some(rsc_dfn) = rsc_dfns.get_mut(&key.rsc_name) else {
            continue;
        };
        if rsc_dfn.volume_dfns.remove(&key.vlm_nr).is_some() {
            summary.volume_dfns += 1;
        }
        for rsc in rsc_dfn.resources.values_mut() {
            rsc.volumes.remove(&key.vlm_nr);
            rsc.layer_data.remove_volume(key.vlm_nr);
        }
    }

    for node_name in peer_nodes {
        let still_used = rsc_dfns
            .values()
            .any(|rsc_dfn| rsc_dfn.resources.contains_key(&node_name));
        if !still_used && graph.nodes.remove(&node_name).is_some() {
            debug!("Removed peer node '{}' without shared resources", node_name);
            summary.nodes.push(node_name);
        }
    }

    summary
}
