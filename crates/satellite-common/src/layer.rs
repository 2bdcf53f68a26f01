//! Device layer capability contract.
//!
//! A [`DeviceLayer`] implements one technology tier of a resource's device
//! stack (replication, encryption, caching, backing storage). The device
//! handler drives layers through the phases of a dispatch:
//!
//! 1. `prepare` once per layer with every layer-data node of that layer
//! 2. `update_gross_size` while sizes are propagated down the stack
//! 3. suspend-I/O management on the root layer, then on child layers
//! 4. `process_resource` / `process_snapshot` per layer-data node
//! 5. `clear_cache` once per prepared layer

use crate::api_call_rc::ApiCallRc;
use crate::identifiers::{NodeName, ResourceName, SnapshotName, StorPoolName, VolumeNumber};
use crate::layer_data::{DeviceLayerKind, RscLayerData, VlmLayerData};
use crate::objects::{Props, Resource, Snapshot, SpaceInfo, StorPool};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Optional explanation texts attached to a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorTexts {
    pub cause: Option<String>,
    pub correction: Option<String>,
    pub details: Option<String>,
}

/// Error raised by a device layer.
#[derive(Debug, Clone, Error)]
pub enum LayerError {
    /// Backing storage operation failed
    #[error("{message}")]
    Storage { message: String, texts: ErrorTexts },

    /// Resource level operation failed
    #[error("{message}")]
    Resource { message: String, texts: ErrorTexts },

    /// Volume level operation failed
    #[error("{message}")]
    Volume { message: String, texts: ErrorTexts },

    /// The layer was denied access to an object
    #[error("Access denied: {message}")]
    AccessDenied { message: String },

    /// Persisting object state failed
    #[error("Database error: {message}")]
    Database { message: String },
}

impl LayerError {
    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        LayerError::Storage {
            message: message.into(),
            texts: ErrorTexts::default(),
        }
    }

    /// Creates a resource error.
    pub fn resource(message: impl Into<String>) -> Self {
        LayerError::Resource {
            message: message.into(),
            texts: ErrorTexts::default(),
        }
    }

    /// Creates a volume error.
    pub fn volume(message: impl Into<String>) -> Self {
        LayerError::Volume {
            message: message.into(),
            texts: ErrorTexts::default(),
        }
    }

    /// Creates an access denied error.
    pub fn access_denied(message: impl Into<String>) -> Self {
        LayerError::AccessDenied {
            message: message.into(),
        }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        LayerError::Database {
            message: message.into(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        if let Some(texts) = self.texts_mut() {
            texts.cause = Some(cause.into());
        }
        self
    }

    pub fn with_correction(mut self, correction: impl Into<String>) -> Self {
        if let Some(texts) = self.texts_mut() {
            texts.correction = Some(correction.into());
        }
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        if let Some(texts) = self.texts_mut() {
            texts.details = Some(details.into());
        }
        self
    }

    /// Cause, correction and details texts; empty for fatal errors.
    pub fn texts(&self) -> ErrorTexts {
        match self {
            LayerError::Storage { texts, .. }
            | LayerError::Resource { texts, .. }
            | LayerError::Volume { texts, .. } => texts.clone(),
            LayerError::AccessDenied { .. } | LayerError::Database { .. } => ErrorTexts::default(),
        }
    }

    /// Returns true for errors that indicate a broken invariant rather than
    /// a failure of a single object.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LayerError::AccessDenied { .. } | LayerError::Database { .. }
        )
    }

    fn texts_mut(&mut self) -> Option<&mut ErrorTexts> {
        match self {
            LayerError::Storage { texts, .. }
            | LayerError::Resource { texts, .. }
            | LayerError::Volume { texts, .. } => Some(texts),
            LayerError::AccessDenied { .. } | LayerError::Database { .. } => None,
        }
    }
}

/// Result type for layer operations.
pub type LayerResult<T> = Result<T, LayerError>;

/// Properties a layer wants to change on the controller side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalPropsChange {
    pub changed_node_props: Props,
    pub deleted_node_props: BTreeSet<String>,
    pub changed_stor_pool_props: BTreeMap<StorPoolName, Props>,
}

impl LocalPropsChange {
    pub fn is_empty(&self) -> bool {
        self.changed_node_props.is_empty()
            && self.deleted_node_props.is_empty()
            && self.changed_stor_pool_props.is_empty()
    }

    /// Merges another change into this one; later values win.
    pub fn merge(&mut self, other: LocalPropsChange) {
        self.changed_node_props.extend(other.changed_node_props);
        self.deleted_node_props.extend(other.deleted_node_props);
        for (pool, props) in other.changed_stor_pool_props {
            self.changed_stor_pool_props
                .entry(pool)
                .or_default()
                .extend(props);
        }
    }
}

/// Facts about the resource or snapshot a layer-data node belongs to.
///
/// Built once per object before its layer data is borrowed mutably, so a
/// layer can see the object's flags while changing its layer state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerContext {
    pub rsc_name: ResourceName,
    pub node_name: NodeName,
    /// Set when the layer data belongs to a snapshot
    pub snapshot_name: Option<SnapshotName>,
    pub deleting: bool,
    pub inactive: bool,
    /// Volumes flagged for deletion
    pub deleting_volumes: BTreeSet<VolumeNumber>,
}

impl LayerContext {
    pub fn for_resource(rsc: &Resource) -> Self {
        Self {
            rsc_name: rsc.name.clone(),
            node_name: rsc.node_name.clone(),
            snapshot_name: None,
            deleting: rsc.is_deleting(),
            inactive: rsc.is_inactive(),
            deleting_volumes: rsc
                .volumes
                .values()
                .filter(|vlm| vlm.flags.is_set(crate::flags::VlmFlag::Delete))
                .map(|vlm| vlm.vlm_nr)
                .collect(),
        }
    }

    pub fn for_snapshot(snap: &Snapshot) -> Self {
        Self {
            rsc_name: snap.rsc_name.clone(),
            node_name: snap.node_name.clone(),
            snapshot_name: Some(snap.snapshot_name.clone()),
            deleting: snap.is_deleting(),
            inactive: false,
            deleting_volumes: BTreeSet::new(),
        }
    }

    /// Human readable description for log messages.
    pub fn describe(&self) -> String {
        match &self.snapshot_name {
            Some(snap) => format!("snapshot '{}' of resource '{}'", snap, self.rsc_name),
            None => format!("resource '{}'", self.rsc_name),
        }
    }
}

/// A layer-data node handed to [`DeviceLayer::prepare`].
#[derive(Debug, Clone, Copy)]
pub struct LayerDataRef<'a> {
    pub context: &'a LayerContext,
    pub data: &'a RscLayerData,
}

/// Capability contract of one device layer.
///
/// Methods with a default body are optional capabilities.
#[async_trait]
pub trait DeviceLayer: Send + Sync {
    /// Returns the display name of the layer.
    fn name(&self) -> &str;

    /// Returns the kind of layer data this layer is responsible for.
    fn kind(&self) -> DeviceLayerKind;

    /// Called once before the first dispatch.
    fn initialize(&self) {}

    /// Computes sizes and metadata for all layer data of this layer.
    ///
    /// Expected to be free of external calls; the device handler does not
    /// verify this.
    async fn prepare(&self, rscs: &[LayerDataRef<'_>], snaps: &[LayerDataRef<'_>]) -> LayerResult<()>;

    /// Brings the host devices of one resource layer in line with the
    /// desired state. Responses for the requester go into `rc`; a layer that
    /// cannot continue marks `data` failed or returns an error.
    async fn process_resource(
        &self,
        ctx: &LayerContext,
        data: &mut RscLayerData,
        rc: &mut ApiCallRc,
    ) -> LayerResult<()>;

    /// Same as [`process_resource`](Self::process_resource) for snapshot layer data.
    async fn process_snapshot(
        &self,
        ctx: &LayerContext,
        data: &mut RscLayerData,
        rc: &mut ApiCallRc,
    ) -> LayerResult<()>;

    /// Drops per-dispatch caches.
    async fn clear_cache(&self) -> LayerResult<()> {
        Ok(())
    }

    /// Computes the gross (allocated) size of `vlm` from its usable size.
    ///
    /// `parent` is the volume data of the layer above, if any. The default
    /// passes sizes through unchanged.
    fn update_gross_size(&self, vlm: &mut VlmLayerData, parent: Option<&VlmLayerData>) {
        if let Some(parent_size) = parent.and_then(|p| p.allocated_size_kib) {
            vlm.usable_size_kib = Some(parent_size);
        }
        vlm.allocated_size_kib = vlm.usable_size_kib;
    }

    fn is_suspend_io_supported(&self) -> bool {
        false
    }

    /// Refreshes `data.suspended` from the live device state.
    async fn update_suspend_state(&self, _data: &mut RscLayerData) -> LayerResult<()> {
        Ok(())
    }

    async fn suspend_io(&self, _data: &mut RscLayerData) -> LayerResult<()> {
        Ok(())
    }

    async fn resume_io(&self, _data: &mut RscLayerData) -> LayerResult<()> {
        Ok(())
    }

    /// Hook for non-root layers, run after all root layers changed their
    /// suspend state.
    async fn manage_post_root_suspend(&self, _data: &mut RscLayerData) -> LayerResult<()> {
        Ok(())
    }

    /// Receives the local node's properties; returns changes the controller
    /// should apply.
    fn set_local_node_props(&self, _props: &Props) -> LayerResult<Option<LocalPropsChange>> {
        Ok(None)
    }

    /// Storage pools whose free space changed since the last call.
    fn changed_stor_pools(&self) -> Vec<StorPoolName> {
        Vec::new()
    }

    /// Verifies the configuration of a storage pool.
    async fn check_stor_pool(
        &self,
        _stor_pool: &StorPool,
        _update: bool,
    ) -> LayerResult<Option<LocalPropsChange>> {
        Ok(None)
    }

    /// Queries capacity and free space of a storage pool.
    async fn stor_pool_space_info(&self, stor_pool: &StorPool) -> LayerResult<SpaceInfo> {
        Err(LayerError::storage(format!(
            "Layer '{}' does not manage storage pool '{}'",
            self.name(),
            stor_pool.name
        )))
    }
}

/// Remembers how resources were split into layer-specific data while the
/// layers work through a dispatch.
///
/// The device handler calls [`cleanup`](Self::cleanup) once after every
/// dispatch, following the layers' cache clearing.
pub trait LayerSplitTracker: Send + Sync {
    fn cleanup(&self) -> LayerResult<()>;
}

/// [`LayerSplitTracker`] for setups whose layers keep no splitting state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLayerSplitTracking;

impl LayerSplitTracker for NoLayerSplitTracking {
    fn cleanup(&self) -> LayerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{RscFlag, VlmFlag};
    use crate::objects::Volume;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_texts() {
        let err = LayerError::storage("lvcreate failed")
            .with_cause("volume group full")
            .with_correction("extend the volume group")
            .with_details("vg0");
        assert_eq!(err.to_string(), "lvcreate failed");
        assert!(!err.is_fatal());

        let texts = err.texts();
        assert_eq!(texts.cause.as_deref(), Some("volume group full"));
        assert_eq!(texts.correction.as_deref(), Some("extend the volume group"));
        assert_eq!(texts.details.as_deref(), Some("vg0"));
    }

    #[test]
    fn test_fatal_errors_carry_no_texts() {
        let err = LayerError::access_denied("no privileges").with_cause("ignored");
        assert!(err.is_fatal());
        assert_eq!(err.texts(), ErrorTexts::default());
        assert_eq!(err.to_string(), "Access denied: no privileges");
        assert!(LayerError::database("commit").is_fatal());
    }

    #[test]
    fn test_props_change_merge() {
        let mut change = LocalPropsChange::default();
        assert!(change.is_empty());

        let mut other = LocalPropsChange::default();
        other.changed_node_props.insert("a".into(), "1".into());
        other.deleted_node_props.insert("b".into());
        change.merge(other);

        assert!(!change.is_empty());
        assert_eq!(change.changed_node_props["a"], "1");
    }

    #[test]
    fn test_context_for_resource() {
        let mut vlm = Volume::new(VolumeNumber(1), 100);
        vlm.flags.enable(VlmFlag::Delete);
        let rsc = Resource::new(
            "r1",
            "n1",
            RscLayerData::new(1, DeviceLayerKind::Storage, "r1"),
        )
        .with_flag(RscFlag::Delete)
        .with_volume(vlm)
        .with_volume(Volume::new(VolumeNumber(0), 100));

        let ctx = LayerContext::for_resource(&rsc);
        assert!(ctx.deleting);
        assert_eq!(ctx.deleting_volumes, BTreeSet::from([VolumeNumber(1)]));
        assert_eq!(ctx.describe(), "resource 'r1'");
    }
}
