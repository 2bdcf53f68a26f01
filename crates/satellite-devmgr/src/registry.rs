//! Registered device layers by kind.

use crate::error::{DevMgrError, DevMgrResult};
use satellite_common::{DeviceLayer, DeviceLayerKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Device layers known to the device handler, ordered by kind.
#[derive(Default, Clone)]
pub struct LayerRegistry {
    layers: BTreeMap<DeviceLayerKind, Arc<dyn DeviceLayer>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a layer. Each kind can be registered once.
    pub fn register(&mut self, layer: Arc<dyn DeviceLayer>) -> DevMgrResult<()> {
        let kind = layer.kind();
        if self.layers.contains_key(&kind) {
            return Err(DevMgrError::implementation(format!(
                "A layer for kind {} is already registered",
                kind
            )));
        }
        info!("Registered device layer '{}' for kind {}", layer.name(), kind);
        self.layers.insert(kind, layer);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_layer(mut self, layer: Arc<dyn DeviceLayer>) -> DevMgrResult<Self> {
        self.register(layer)?;
        Ok(self)
    }

    pub fn get(&self, kind: DeviceLayerKind) -> DevMgrResult<&Arc<dyn DeviceLayer>> {
        self.layers.get(&kind).ok_or_else(|| {
            DevMgrError::implementation(format!("No device layer registered for kind {}", kind))
        })
    }

    /// The layer managing backing storage.
    pub fn storage_layer(&self) -> DevMgrResult<&Arc<dyn DeviceLayer>> {
        self.get(DeviceLayerKind::Storage)
    }

    /// All layers in kind order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DeviceLayer>> {
        self.layers.values()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl std::fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.layers.keys()).finish()
    }
}
