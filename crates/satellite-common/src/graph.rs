//! In-memory object graph and its lock set.
//!
//! The graph is guarded by four reader/writer locks. Code that needs more
//! than one of them must acquire them in declaration order:
//! reconfiguration, nodes, resource definitions, storage pool definitions.
//! [`ObjectGraph::write_all`] does exactly that.

use crate::identifiers::{NodeName, ResourceName, StorPoolName};
use crate::objects::{Node, ResourceDefinition, StorPool, StorPoolDefinition};
use log::debug;
use std::collections::BTreeMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub type NodesMap = BTreeMap<NodeName, Node>;
pub type RscDfnMap = BTreeMap<ResourceName, ResourceDefinition>;
pub type StorPoolDfnMap = BTreeMap<StorPoolName, StorPoolDefinition>;

/// The satellite's view of the cluster.
#[derive(Debug)]
pub struct ObjectGraph {
    local_node_name: NodeName,
    reconfiguration: RwLock<()>,
    nodes: RwLock<NodesMap>,
    rsc_dfns: RwLock<RscDfnMap>,
    stor_pool_dfns: RwLock<StorPoolDfnMap>,
}

/// Write access to the whole graph, holding every lock of the set.
pub struct GraphWriteGuard<'a> {
    _reconfiguration: RwLockWriteGuard<'a, ()>,
    pub nodes: RwLockWriteGuard<'a, NodesMap>,
    pub rsc_dfns: RwLockWriteGuard<'a, RscDfnMap>,
    pub stor_pool_dfns: RwLockWriteGuard<'a, StorPoolDfnMap>,
    local_node_name: &'a NodeName,
}

impl ObjectGraph {
    pub fn new(local_node_name: impl Into<NodeName>) -> Self {
        Self {
            local_node_name: local_node_name.into(),
            reconfiguration: RwLock::new(()),
            nodes: RwLock::new(NodesMap::new()),
            rsc_dfns: RwLock::new(RscDfnMap::new()),
            stor_pool_dfns: RwLock::new(StorPoolDfnMap::new()),
        }
    }

    pub fn local_node_name(&self) -> &NodeName {
        &self.local_node_name
    }

    /// Acquires every lock of the set for writing, in lock order.
    pub async fn write_all(&self) -> GraphWriteGuard<'_> {
        let reconfiguration = self.reconfiguration.write().await;
        let nodes = self.nodes.write().await;
        let rsc_dfns = self.rsc_dfns.write().await;
        let stor_pool_dfns = self.stor_pool_dfns.write().await;
        GraphWriteGuard {
            _reconfiguration: reconfiguration,
            nodes,
            rsc_dfns,
            stor_pool_dfns,
            local_node_name: &self.local_node_name,
        }
    }

    pub async fn read_nodes(&self) -> RwLockReadGuard<'_, NodesMap> {
        self.nodes.read().await
    }

    pub async fn read_rsc_dfns(&self) -> RwLockReadGuard<'_, RscDfnMap> {
        self.rsc_dfns.read().await
    }

    /// Names of all known resource definitions.
    pub async fn rsc_dfn_names(&self) -> Vec<ResourceName> {
        self.rsc_dfns.read().await.keys().cloned().collect()
    }

    /// Inserts or replaces a node.
    pub async fn put_node(&self, node: Node) {
        debug!("Object graph: put node '{}'", node.name);
        self.nodes.write().await.insert(node.name.clone(), node);
    }

    /// Inserts or replaces a resource definition.
    pub async fn put_rsc_dfn(&self, rsc_dfn: ResourceDefinition) {
        debug!("Object graph: put resource definition '{}'", rsc_dfn.name);
        self.rsc_dfns
            .write()
            .await
            .insert(rsc_dfn.name.clone(), rsc_dfn);
    }

    /// Inserts or replaces a storage pool definition.
    pub async fn put_stor_pool_dfn(&self, stor_pool_dfn: StorPoolDefinition) {
        debug!("Object graph: put storage pool definition '{}'", stor_pool_dfn.name);
        self.stor_pool_dfns
            .write()
            .await
            .insert(stor_pool_dfn.name.clone(), stor_pool_dfn);
    }

    /// Copies the storage pools of the local node.
    pub async fn local_stor_pools(&self) -> Vec<StorPool> {
        self.nodes
            .read()
            .await
            .get(&self.local_node_name)
            .map(|node| node.stor_pools.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl GraphWriteGuard<'_> {
    pub fn local_node_name(&self) -> &NodeName {
        self.local_node_name
    }

    pub fn local_node(&self) -> Option<&Node> {
        self.nodes.get(self.local_node_name)
    }

    /// Storage pools of the local node.
    pub fn local_stor_pools(&self) -> Vec<StorPool> {
        self.local_node()
            .map(|node| node.stor_pools.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer_data::{DeviceLayerKind, RscLayerData};
    use crate::objects::{ProviderKind, Resource};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_write_all_sees_inserted_objects() {
        let graph = ObjectGraph::new("n1");
        graph
            .put_node(Node::new("n1").with_stor_pool(StorPool::new("pool", "n1", ProviderKind::Lvm)))
            .await;
        graph
            .put_rsc_dfn(ResourceDefinition::new("r1").with_resource(Resource::new(
                "r1",
                "n1",
                RscLayerData::new(1, DeviceLayerKind::Storage, "r1"),
            )))
            .await;

        {
            let mut guard = graph.write_all().await;
            assert_eq!(guard.local_node_name(), &NodeName::from("n1"));
            assert!(guard.local_node().is_some());
            assert_eq!(guard.local_stor_pools().len(), 1);
            guard.rsc_dfns.remove(&ResourceName::from("r1"));
        }

        assert!(graph.rsc_dfn_names().await.is_empty());
        assert_eq!(graph.local_stor_pools().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_local_node() {
        let graph = ObjectGraph::new("missing");
        assert!(graph.local_stor_pools().await.is_empty());
        assert!(graph.read_nodes().await.is_empty());
    }
}
