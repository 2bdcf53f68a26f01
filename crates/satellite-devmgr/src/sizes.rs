//! Gross size propagation down a layer-data tree.
//!
//! The root layer offers the size of the volume definition. Walking
//! parent-first, every layer derives its gross (allocated) size from what it
//! has to offer, and the layer below offers that gross size in turn.

use crate::error::{DevMgrError, DevMgrResult};
use crate::registry::LayerRegistry;
use satellite_common::{RscLayerData, VolumeNumber, WalkOrder};
use std::collections::BTreeMap;

/// Recomputes the sizes of every volume in `tree`.
///
/// `volume_sizes` holds the net size of each volume in KiB; volumes without
/// an entry keep whatever usable size their root layer already has.
pub fn update_gross_sizes(
    registry: &LayerRegistry,
    tree: &mut RscLayerData,
    volume_sizes: &BTreeMap<VolumeNumber, u64>,
) -> DevMgrResult<()> {
    for path in tree.walk_paths(WalkOrder::PreOrder)? {
        let parent_vlms = match path.split_last() {
            Some((_, parent_path)) => tree.node(parent_path).map(|parent| parent.volumes.clone()),
            None => None,
        };
        let node = tree.node_mut(&path).ok_or_else(|| {
            DevMgrError::implementation(format!("Layer path {:?} vanished during size update", path))
        })?;
        let layer = registry.get(node.kind)?;

        for (vlm_nr, vlm) in node.volumes.iter_mut() {
            let parent_vlm = parent_vlms.as_ref().and_then(|vlms| vlms.get(vlm_nr));
            if parent_vlm.is_none() {
                if let Some(size) = volume_sizes.get(vlm_nr) {
                    vlm.usable_size_kib = Some(*size);
                }
            }
            layer.update_gross_size(vlm, parent_vlm);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use satellite_common::{
        ApiCallRc, DeviceLayer, DeviceLayerKind, LayerContext, LayerDataRef, LayerResult,
        VlmLayerData,
    };
    use std::sync::Arc;

    /// Adds a fixed amount of metadata on top of the usable size.
    struct MetadataLayer {
        kind: DeviceLayerKind,
        overhead_kib: u64,
    }

    #[async_trait]
    impl DeviceLayer for MetadataLayer {
        fn name(&self) -> &str {
            "metadata"
        }
        fn kind(&self) -> DeviceLayerKind {
            self.kind
        }
        async fn prepare(&self, _: &[LayerDataRef<'_>], _: &[LayerDataRef<'_>]) -> LayerResult<()> {
            Ok(())
        }
        async fn process_resource(&self, _: &LayerContext, _: &mut RscLayerData, _: &mut ApiCallRc) -> LayerResult<()> {
            Ok(())
        }
        async fn process_snapshot(&self, _: &LayerContext, _: &mut RscLayerData, _: &mut ApiCallRc) -> LayerResult<()> {
            Ok(())
        }
        fn update_gross_size(&self, vlm: &mut VlmLayerData, parent: Option<&VlmLayerData>) {
            if let Some(size) = parent.and_then(|p| p.allocated_size_kib) {
                vlm.usable_size_kib = Some(size);
            }
            vlm.allocated_size_kib = vlm.usable_size_kib.map(|s| s + self.overhead_kib);
        }
    }

    fn registry() -> LayerRegistry {
        LayerRegistry::new()
            .with_layer(Arc::new(MetadataLayer { kind: DeviceLayerKind::Drbd, overhead_kib: 40 }))
            .unwrap()
            .with_layer(Arc::new(MetadataLayer { kind: DeviceLayerKind::Storage, overhead_kib: 4 }))
            .unwrap()
    }

    #[test]
    fn test_sizes_propagate_downwards() {
        let mut tree = RscLayerData::new(1, DeviceLayerKind::Drbd, "rsc")
            .with_volume(VlmLayerData::new(VolumeNumber(0)))
            .with_child(
                RscLayerData::new(2, DeviceLayerKind::Storage, "rsc")
                    .with_volume(VlmLayerData::new(VolumeNumber(0))),
            );

        let sizes = BTreeMap::from([(VolumeNumber(0), 1000)]);
        update_gross_sizes(&registry(), &mut tree, &sizes).unwrap();

        let root = &tree.volumes[&VolumeNumber(0)];
        assert_eq!(root.usable_size_kib, Some(1000));
        assert_eq!(root.allocated_size_kib, Some(1040));

        let storage = &tree.children[0].volumes[&VolumeNumber(0)];
        assert_eq!(storage.usable_size_kib, Some(1040));
        assert_eq!(storage.allocated_size_kib, Some(1044));
    }

    #[test]
    fn test_missing_layer_fails() {
        let mut tree = RscLayerData::new(1, DeviceLayerKind::Luks, "rsc")
            .with_volume(VlmLayerData::new(VolumeNumber(0)));
        assert!(update_gross_sizes(&registry(), &mut tree, &BTreeMap::new()).is_err());
    }
}
