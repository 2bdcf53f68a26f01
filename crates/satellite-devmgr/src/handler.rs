//! Device handler: drives the device layers for one dispatch.
//!
//! A dispatch runs in these steps:
//!
//! 1. every layer prepares the layer data it is responsible for; if one
//!    layer fails, nothing is processed and every object is answered
//! 2. gross sizes are propagated down each layer-data tree
//! 3. root layers change their suspend state
//! 4. deleting snapshots, then resources (deletions top-down, the rest
//!    bottom-up), then the remaining snapshots are processed
//! 5. applied and deleted objects are reported, free space is refreshed
//!    once for the whole dispatch, layer caches are cleared and the
//!    [`LayerSplitTracker`] drops its per-dispatch state
//!
//! A failure of one object is turned into a response for that object and
//! never stops the others. Only fatal errors end the dispatch early. Every
//! resource handed to a dispatch is processed; aborting only keeps the
//! device manager from handing over further resources.

use crate::error::{DevMgrError, DevMgrResult};
use crate::listener::NotificationListener;
use crate::registry::LayerRegistry;
use crate::reporter::ErrorReporter;
use crate::sizes::update_gross_sizes;
use crate::suspend::SuspendManager;
use crate::sync_point::SyncPoint;
use crate::traverse::{plan_waves, BottomUp, ResourceIndex, TopDown, TraverseOrder};
use async_trait::async_trait;
use satellite_common::{
    rc, ApiCallRc, ControllerPeerConnector, DeviceLayerKind, ErrorTexts, LayerContext,
    LayerDataRef, LayerError, LayerSplitTracker, LocalPropsChange, Node, Props, RcEntry, Resource, ResourceKey,
    ResourceName, RscLayerData, Snapshot, SnapshotKey, SpaceInfo, SpaceInfoMap, StorPool,
    VolumeKey, VolumeNumber, WalkOrder,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The objects handed to one dispatch.
pub struct DispatchSet<'a> {
    /// Local resources to process
    pub resources: Vec<&'a mut Resource>,
    /// Local snapshots to process
    pub snapshots: Vec<&'a mut Snapshot>,
    /// Net volume sizes per resource definition, used for snapshot trees
    pub volume_sizes: BTreeMap<ResourceName, BTreeMap<VolumeNumber, u64>>,
    /// Relations of every local resource, dispatched or not
    pub index: ResourceIndex,
    /// Storage pools of the local node
    pub stor_pools: Vec<StorPool>,
}

/// Processes resources and snapshots on behalf of the device manager.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// Called once before the first dispatch.
    fn initialize(&self);

    /// Processes every object of `set`. Outcomes are reported through the
    /// notification listener; only fatal errors are returned.
    async fn dispatch_resources(&self, set: &mut DispatchSet<'_>) -> DevMgrResult<()>;

    /// The controller re-sent its whole state.
    async fn full_sync_applied(&self, local_node: &Node) -> DevMgrResult<()>;

    /// Hands the local node's properties to every layer.
    async fn local_node_props_changed(&self, props: &Props) -> DevMgrResult<()>;

    /// Checks a storage pool and queries its space.
    async fn get_space_info(&self, stor_pool: &StorPool, update: bool) -> DevMgrResult<SpaceInfo>;
}

/// Failure while processing one object.
#[derive(Debug)]
enum ProcessError {
    /// Only the object at hand is affected
    Failed { message: String, texts: ErrorTexts },
    /// Stops the whole dispatch
    Fatal(DevMgrError),
}

impl ProcessError {
    fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            texts: ErrorTexts::default(),
        }
    }
}

impl From<LayerError> for ProcessError {
    fn from(err: LayerError) -> Self {
        if err.is_fatal() {
            Self::Fatal(err.into())
        } else {
            Self::Failed {
                message: err.to_string(),
                texts: err.texts(),
            }
        }
    }
}

impl From<DevMgrError> for ProcessError {
    fn from(err: DevMgrError) -> Self {
        Self::Fatal(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Resource,
    /// Snapshot of a resource in the same dispatch
    Snapshot,
    /// Snapshot whose resource is not dispatched; only storage runs
    SnapshotStorageOnly,
}

/// Layer data of one kind handed to `prepare`.
#[derive(Default)]
struct LayerGroup<'a> {
    rscs: Vec<LayerDataRef<'a>>,
    snaps: Vec<LayerDataRef<'a>>,
}

/// What happened to the resources of a dispatch.
#[derive(Default)]
struct Outcomes {
    failed: BTreeMap<ResourceName, ApiCallRc>,
    applied: Vec<ResourceKey>,
    deleted_rscs: Vec<ResourceName>,
    deleted_vlms: Vec<VolumeKey>,
    deleted_snaps: Vec<SnapshotKey>,
}

/// [`DeviceHandler`] working through the registered device layers.
pub struct LayeredDeviceHandler {
    registry: LayerRegistry,
    split_tracker: Arc<dyn LayerSplitTracker>,
    suspend: SuspendManager,
    listener: Arc<dyn NotificationListener>,
    connector: Arc<dyn ControllerPeerConnector>,
    reporter: Arc<ErrorReporter>,
    sync_point: Arc<SyncPoint>,
}

impl LayeredDeviceHandler {
    pub fn new(
        registry: LayerRegistry,
        split_tracker: Arc<dyn LayerSplitTracker>,
        listener: Arc<dyn NotificationListener>,
        connector: Arc<dyn ControllerPeerConnector>,
        reporter: Arc<ErrorReporter>,
        sync_point: Arc<SyncPoint>,
    ) -> Self {
        Self {
            suspend: SuspendManager::new(registry.clone()),
            registry,
            split_tracker,
            listener,
            connector,
            reporter,
            sync_point,
        }
    }

    async fn dispatch(&self, set: &mut DispatchSet<'_>) -> DevMgrResult<()> {
        let rsc_ctx: Vec<LayerContext> = set
            .resources
            .iter()
            .map(|rsc| LayerContext::for_resource(rsc))
            .collect();
        let snap_ctx: Vec<LayerContext> = set
            .snapshots
            .iter()
            .map(|snap| LayerContext::for_snapshot(snap))
            .collect();

        let (rscs_by_kind, prepare_failure) = self.prepare_layers(set, &rsc_ctx, &snap_ctx).await?;

        if let Some((kind, err)) = prepare_failure {
            self.answer_prepare_failure(set, kind, &err, &rscs_by_kind);
            trace!("Prepare step failed. Checking if devices need resume-io");
            self.suspend
                .manage_suspend_io(&mut set.resources, true, |rsc, err| {
                    self.handle_exception(&rsc.key(), &err.to_string(), err.texts())
                })
                .await?;
            return Ok(());
        }

        let DispatchSet {
            resources,
            snapshots,
            volume_sizes,
            index,
            stor_pools,
        } = set;

        for rsc in resources.iter_mut() {
            let sizes: BTreeMap<VolumeNumber, u64> = rsc
                .volumes
                .values()
                .map(|vlm| (vlm.vlm_nr, vlm.size_kib))
                .collect();
            update_gross_sizes(&self.registry, &mut rsc.layer_data, &sizes)?;
        }
        for snap in snapshots.iter_mut() {
            let sizes = volume_sizes.get(&snap.rsc_name).cloned().unwrap_or_default();
            update_gross_sizes(&self.registry, &mut snap.layer_data, &sizes)?;
        }

        let batch_rscs: BTreeSet<ResourceName> = resources.iter().map(|rsc| rsc.name.clone()).collect();
        let mut outcomes = Outcomes::default();

        // deleting snapshots first, a resource with snapshots may not be deletable
        self.process_snapshots(snapshots, &snap_ctx, true, &batch_rscs, &mut outcomes)
            .await?;
        self.process_resources(resources, &rsc_ctx, index, &mut outcomes)
            .await?;
        self.process_snapshots(snapshots, &snap_ctx, false, &batch_rscs, &mut outcomes)
            .await?;

        if !outcomes.applied.is_empty() && self.connector.controller_peer().is_some() {
            let space_info = self.query_space_info(stor_pools).await?;
            for key in &outcomes.applied {
                self.listener.notify_resource_applied(key, &space_info);
            }
        }

        for vlm in &outcomes.deleted_vlms {
            self.listener.notify_volume_deleted(vlm);
        }
        for rsc in &outcomes.deleted_rscs {
            self.listener.notify_resource_deleted(rsc);
        }
        for snap in &outcomes.deleted_snaps {
            self.listener.notify_snapshot_deleted(snap);
        }

        self.update_changed_free_spaces(stor_pools).await?;
        self.clear_layer_caches(&rscs_by_kind).await?;
        self.cleanup_split_tracker();
        Ok(())
    }

    /// Runs `prepare` of every involved layer in kind order.
    ///
    /// Returns the resource names per layer kind and the first recoverable
    /// prepare failure, if any.
    #[allow(clippy::type_complexity)]
    async fn prepare_layers(
        &self,
        set: &DispatchSet<'_>,
        rsc_ctx: &[LayerContext],
        snap_ctx: &[LayerContext],
    ) -> DevMgrResult<(
        BTreeMap<DeviceLayerKind, BTreeSet<ResourceName>>,
        Option<(DeviceLayerKind, LayerError)>,
    )> {
        let mut groups: BTreeMap<DeviceLayerKind, LayerGroup<'_>> = BTreeMap::new();
        for (rsc, ctx) in set.resources.iter().zip(rsc_ctx) {
            for data in rsc.layer_data.breadth_first()? {
                groups.entry(data.kind).or_default().rscs.push(LayerDataRef { context: ctx, data });
            }
        }
        for (snap, ctx) in set.snapshots.iter().zip(snap_ctx) {
            for data in snap.layer_data.breadth_first()? {
                groups.entry(data.kind).or_default().snaps.push(LayerDataRef { context: ctx, data });
            }
        }

        let rscs_by_kind = groups
            .iter()
            .map(|(kind, group)| {
                let names = group.rscs.iter().map(|r| r.context.rsc_name.clone()).collect();
                (*kind, names)
            })
            .collect();

        for (kind, group) in &groups {
            let layer = self.registry.get(*kind)?;
            trace!(
                "Layer '{}' preparing {} resources, {} snapshots",
                layer.name(),
                group.rscs.len(),
                group.snaps.len()
            );
            match layer.prepare(&group.rscs, &group.snaps).await {
                Ok(()) => trace!("Layer '{}' finished preparing", layer.name()),
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => return Ok((rscs_by_kind, Some((*kind, err)))),
            }
        }
        Ok((rscs_by_kind, None))
    }

    fn answer_prepare_failure(
        &self,
        set: &DispatchSet<'_>,
        kind: DeviceLayerKind,
        err: &LayerError,
        rscs_by_kind: &BTreeMap<DeviceLayerKind, BTreeSet<ResourceName>>,
    ) {
        let layer_name = self.layer_name(kind);
        let message = format!("Preparing resources for layer {} failed", layer_name);
        let error_id = self.reporter.report_error(err, Some(&message));
        let failure = failure_response(&message, err.texts(), Some(error_id));
        let skipped_cause = format!("Layer {} failed to prepare", layer_name);

        let failed_rscs = rscs_by_kind.get(&kind);
        for rsc in &set.resources {
            if failed_rscs.is_some_and(|names| names.contains(&rsc.name)) {
                self.listener.notify_resource_failed(&rsc.key(), &failure);
                self.listener
                    .notify_resource_dispatch_response(&rsc.name, failure.clone());
            } else {
                let skipped = ApiCallRc::singleton(
                    RcEntry::new(
                        rc::WARN_SKIPPED,
                        format!("Skipping processing of resource '{}'", rsc.name),
                    )
                    .with_cause(Some(skipped_cause.clone())),
                );
                self.listener.notify_resource_dispatch_response(&rsc.name, skipped);
            }
        }
        for snap in &set.snapshots {
            let skipped = ApiCallRc::singleton(
                RcEntry::new(
                    rc::WARN_SKIPPED,
                    format!(
                        "Skipping processing of snapshot '{}' of resource '{}'",
                        snap.snapshot_name, snap.rsc_name
                    ),
                )
                .with_cause(Some(skipped_cause.clone())),
            );
            self.listener.notify_snapshot_dispatch_response(&snap.key(), skipped);
        }
    }

    async fn process_resources(
        &self,
        resources: &mut Vec<&mut Resource>,
        rsc_ctx: &[LayerContext],
        index: &ResourceIndex,
        outcomes: &mut Outcomes,
    ) -> DevMgrResult<()> {
        let suspend_failures = self
            .suspend
            .manage_suspend_io(resources, false, |rsc, err| {
                self.handle_exception(&rsc.key(), &err.to_string(), err.texts())
            })
            .await?;
        outcomes.failed.extend(suspend_failures);

        let mut deleting = Vec::new();
        let mut others = Vec::new();
        for rsc in resources.iter() {
            if rsc.is_deleting() {
                deleting.push(rsc.name.clone());
            } else {
                others.push(rsc.name.clone());
            }
        }

        let orders: [(&dyn TraverseOrder, Vec<ResourceName>); 2] =
            [(&TopDown, deleting), (&BottomUp, others)];
        for (order, names) in orders {
            for wave in plan_waves(order, index, &names)? {
                debug!(phase = %order.phase(), kind = %wave.kind, "Processing {} resources", wave.resources.len());
                for name in &wave.resources {
                    let Some(pos) = resources.iter().position(|rsc| &rsc.name == name) else {
                        continue;
                    };
                    let suspend_failure = outcomes.failed.get(name).cloned();
                    let response = match suspend_failure {
                        Some(failure) => failure,
                        None => {
                            self.process_resource(&mut *resources[pos], &rsc_ctx[pos], outcomes)
                                .await?
                        }
                    };
                    self.listener.notify_resource_dispatch_response(name, response);
                }
            }
        }
        Ok(())
    }

    /// Processes one resource and records its outcome. Returns the response
    /// for the requester.
    async fn process_resource(
        &self,
        rsc: &mut Resource,
        ctx: &LayerContext,
        outcomes: &mut Outcomes,
    ) -> DevMgrResult<ApiCallRc> {
        let mut response = ApiCallRc::new();
        match self.process_adjust(rsc, ctx, &mut response).await {
            Ok(deleted_vlms) => {
                outcomes.deleted_vlms.extend(deleted_vlms);
                if rsc.is_deleting() {
                    outcomes.deleted_rscs.push(rsc.name.clone());
                } else {
                    outcomes.applied.push(rsc.key());
                }
                Ok(response)
            }
            Err(ProcessError::Fatal(err)) => Err(err),
            Err(ProcessError::Failed { message, texts }) => {
                let failure = self.handle_exception(&rsc.key(), &message, texts);
                outcomes.failed.insert(rsc.name.clone(), failure.clone());
                Ok(failure)
            }
        }
    }

    /// Runs the layers over the resource and verifies deleted volumes.
    async fn process_adjust(
        &self,
        rsc: &mut Resource,
        ctx: &LayerContext,
        response: &mut ApiCallRc,
    ) -> Result<Vec<VolumeKey>, ProcessError> {
        self.process_layers(&mut rsc.layer_data, ctx, response, Target::Resource)
            .await?;

        let deleting = rsc.is_deleting();
        let mut deleted_vlms = Vec::new();
        for vlm_nr in rsc.volumes.keys() {
            if deleting || ctx.deleting_volumes.contains(vlm_nr) {
                ensure_volume_deleted(&rsc.layer_data, *vlm_nr)?;
                deleted_vlms.push(VolumeKey::new(rsc.name.clone(), *vlm_nr));
            }
        }
        Ok(deleted_vlms)
    }

    async fn process_snapshots(
        &self,
        snapshots: &mut [&mut Snapshot],
        snap_ctx: &[LayerContext],
        deleting: bool,
        batch_rscs: &BTreeSet<ResourceName>,
        outcomes: &mut Outcomes,
    ) -> DevMgrResult<()> {
        for (snap, ctx) in snapshots.iter_mut().zip(snap_ctx) {
            if snap.is_deleting() != deleting {
                continue;
            }
            let key = snap.key();
            let (process, mut response) = match outcomes.failed.get(&snap.rsc_name) {
                Some(failure) => (!failure.has_errors(), failure.clone()),
                None => (true, ApiCallRc::new()),
            };

            if process {
                let target = if batch_rscs.contains(&snap.rsc_name) {
                    Target::Snapshot
                } else {
                    Target::SnapshotStorageOnly
                };
                match self
                    .process_layers(&mut snap.layer_data, ctx, &mut response, target)
                    .await
                {
                    Ok(()) => {
                        if snap.is_deleting() {
                            outcomes.deleted_snaps.push(key.clone());
                        }
                    }
                    Err(ProcessError::Fatal(err)) => return Err(err),
                    Err(ProcessError::Failed { message, texts }) => {
                        let context = format!("An error occurred while processing {}", ctx.describe());
                        let error_id = self.reporter.report_error(&message, Some(&context));
                        response = failure_response(&message, texts, Some(error_id));
                    }
                }
            }
            self.listener.notify_snapshot_dispatch_response(&key, response);
        }
        Ok(())
    }

    /// Walks one layer-data tree: children first when creating or
    /// adjusting, parents first when deleting.
    async fn process_layers(
        &self,
        tree: &mut RscLayerData,
        ctx: &LayerContext,
        response: &mut ApiCallRc,
        target: Target,
    ) -> Result<(), ProcessError> {
        let order = if ctx.deleting {
            WalkOrder::PreOrder
        } else {
            WalkOrder::PostOrder
        };
        let paths = tree.walk_paths(order).map_err(DevMgrError::from)?;

        for path in paths {
            let node = tree.node_mut(&path).ok_or_else(|| {
                DevMgrError::implementation(format!("Layer path {:?} vanished while processing", path))
            })?;
            if target == Target::SnapshotStorageOnly && node.kind != DeviceLayerKind::Storage {
                continue;
            }
            let layer = self.registry.get(node.kind)?;
            trace!("Layer '{}' processing {}", layer.name(), ctx.describe());

            match target {
                Target::Resource => layer.process_resource(ctx, node, response).await?,
                Target::Snapshot | Target::SnapshotStorageOnly => {
                    layer.process_snapshot(ctx, node, response).await?
                }
            }

            if node.has_failed() {
                let message = format!(
                    "Layer '{}' failed to process resource '{}'",
                    node.kind,
                    node.suffixed_name()
                );
                let above: Vec<String> = tree
                    .ancestor_kinds(&path)
                    .into_iter()
                    .map(|kind| self.layer_name(kind))
                    .collect();
                return Err(ProcessError::Failed {
                    message,
                    texts: ErrorTexts {
                        details: Some(format!("Skipping layers above [{}]", above.join(", "))),
                        ..ErrorTexts::default()
                    },
                });
            }
            trace!("Layer '{}' finished processing {}", layer.name(), ctx.describe());
        }
        Ok(())
    }

    /// Space info of every local storage pool, queried once.
    async fn query_space_info(&self, stor_pools: &[StorPool]) -> DevMgrResult<SpaceInfoMap> {
        let mut space_info = SpaceInfoMap::new();
        let Ok(storage) = self.registry.storage_layer() else {
            return Ok(space_info);
        };
        for stor_pool in stor_pools {
            match storage.stor_pool_space_info(stor_pool).await {
                Ok(info) => {
                    space_info.insert(stor_pool.name.clone(), info);
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                // already reported by the storage layer
                Err(err) => debug!("No space info for storage pool '{}': {}", stor_pool.name, err),
            }
        }
        Ok(space_info)
    }

    async fn update_changed_free_spaces(&self, stor_pools: &[StorPool]) -> DevMgrResult<()> {
        let Ok(storage) = self.registry.storage_layer() else {
            return Ok(());
        };
        let changed = storage.changed_stor_pools();
        let mut free_spaces = SpaceInfoMap::new();
        for stor_pool in stor_pools.iter().filter(|sp| changed.contains(&sp.name)) {
            match storage.stor_pool_space_info(stor_pool).await {
                Ok(info) => {
                    free_spaces.insert(stor_pool.name.clone(), info);
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => warn!(
                    "Failed to query free space or capacity of storage pool '{}': {}",
                    stor_pool.name, err
                ),
            }
        }
        self.listener.notify_free_spaces_changed(&free_spaces);
        Ok(())
    }

    async fn clear_layer_caches(
        &self,
        rscs_by_kind: &BTreeMap<DeviceLayerKind, BTreeSet<ResourceName>>,
    ) -> DevMgrResult<()> {
        for (kind, rsc_names) in rscs_by_kind {
            let layer = self.registry.get(*kind)?;
            match layer.clear_cache().await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    let message = format!("An error occurred while cleaning up layer '{}'", layer.name());
                    let error_id = self.reporter.report_error(&err, Some(&message));
                    let response = failure_response(&message, err.texts(), Some(error_id));
                    for rsc_name in rsc_names {
                        self.listener
                            .notify_resource_dispatch_response(rsc_name, response.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn cleanup_split_tracker(&self) {
        if let Err(err) = self.split_tracker.cleanup() {
            self.reporter
                .report_error(&err, Some("Failed to clean up layer splitting state"));
        }
    }

    /// Reports a failed resource and builds the response for it.
    fn handle_exception(&self, key: &ResourceKey, message: &str, texts: ErrorTexts) -> ApiCallRc {
        let context = format!("An error occurred while processing resource '{}'", key);
        let error_id = self.reporter.report_error(&message, Some(&context));
        let response = failure_response(message, texts, Some(error_id));
        self.listener.notify_resource_failed(key, &response);
        response
    }

    fn layer_name(&self, kind: DeviceLayerKind) -> String {
        self.registry
            .get(kind)
            .map(|layer| layer.name().to_string())
            .unwrap_or_else(|_| kind.to_string())
    }

    fn send_props_change(&self, change: &LocalPropsChange) {
        if change.is_empty() {
            return;
        }
        match self.connector.controller_peer() {
            Some(peer) => peer.send_props_change(change),
            None => debug!("No controller connection, dropping local property changes"),
        }
    }
}

#[async_trait]
impl DeviceHandler for LayeredDeviceHandler {
    fn initialize(&self) {
        for layer in self.registry.iter() {
            layer.initialize();
        }
    }

    async fn dispatch_resources(&self, set: &mut DispatchSet<'_>) -> DevMgrResult<()> {
        self.sync_point.register();
        let result = self.dispatch(set).await;
        self.sync_point.arrive();
        result
    }

    async fn full_sync_applied(&self, local_node: &Node) -> DevMgrResult<()> {
        self.local_node_props_changed(&local_node.props).await?;

        let Ok(storage) = self.registry.storage_layer() else {
            return Ok(());
        };
        let mut change = LocalPropsChange::default();
        for stor_pool in local_node.stor_pools.values() {
            match storage.check_stor_pool(stor_pool, false).await {
                Ok(Some(pool_change)) => change.merge(pool_change),
                Ok(None) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => warn!("Storage pool '{}' failed its check: {}", stor_pool.name, err),
            }
        }
        self.send_props_change(&change);
        Ok(())
    }

    async fn local_node_props_changed(&self, props: &Props) -> DevMgrResult<()> {
        let mut collected = LocalPropsChange::default();
        for layer in self.registry.iter() {
            if let Some(change) = layer.set_local_node_props(props)? {
                collected.merge(change);
            }
        }
        self.send_props_change(&collected);
        Ok(())
    }

    async fn get_space_info(&self, stor_pool: &StorPool, update: bool) -> DevMgrResult<SpaceInfo> {
        let storage = self.registry.storage_layer()?;
        let change = storage.check_stor_pool(stor_pool, update).await?;
        let space_info = storage.stor_pool_space_info(stor_pool).await?;
        if let Some(change) = change {
            self.send_props_change(&change);
        }
        Ok(space_info)
    }
}

fn failure_response(message: &str, texts: ErrorTexts, error_id: Option<String>) -> ApiCallRc {
    let mut entry = RcEntry::new(rc::FAIL_UNKNOWN_ERROR, message)
        .with_cause(texts.cause)
        .with_correction(texts.correction)
        .with_details(texts.details);
    if let Some(id) = error_id {
        entry = entry.with_error_id(id);
    }
    ApiCallRc::singleton(entry)
}

/// Fails if any layer still has the volume.
fn ensure_volume_deleted(tree: &RscLayerData, vlm_nr: VolumeNumber) -> Result<(), ProcessError> {
    for node in tree.breadth_first().map_err(DevMgrError::from)? {
        if node.volumes.get(&vlm_nr).is_some_and(|vlm| vlm.exists) {
            return Err(ProcessError::failed(format!(
                "Layer '{}' did not delete the volume {} of resource {} properly",
                node.kind,
                vlm_nr,
                node.suffixed_name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use satellite_common::{
        ControllerPeer, DeviceLayer, LayerResult, NoLayerSplitTracking, NodeName, ProviderKind,
        RscFlag, SnapshotFlag, VlmLayerData, Volume,
    };

    type Log = Arc<Mutex<Vec<String>>>;

    struct TestLayer {
        kind: DeviceLayerKind,
        log: Log,
        fail_prepare: bool,
        fail_rsc: Option<&'static str>,
        mark_failed: Option<&'static str>,
        keep_devices: bool,
    }

    impl TestLayer {
        fn new(kind: DeviceLayerKind, log: &Log) -> Self {
            Self {
                kind,
                log: log.clone(),
                fail_prepare: false,
                fail_rsc: None,
                mark_failed: None,
                keep_devices: false,
            }
        }
    }

    #[async_trait]
    impl DeviceLayer for TestLayer {
        fn name(&self) -> &str {
            self.kind.as_str()
        }

        fn kind(&self) -> DeviceLayerKind {
            self.kind
        }

        async fn prepare(&self, _: &[LayerDataRef<'_>], _: &[LayerDataRef<'_>]) -> LayerResult<()> {
            if self.fail_prepare {
                return Err(LayerError::resource("drbdadm adjust failed").with_cause("kernel module missing"));
            }
            Ok(())
        }

        async fn process_resource(
            &self,
            ctx: &LayerContext,
            data: &mut RscLayerData,
            _response: &mut ApiCallRc,
        ) -> LayerResult<()> {
            let name = data.suffixed_name();
            self.log.lock().push(format!("{} rsc {}", self.kind, name));
            if self.fail_rsc == Some(name.as_str()) {
                return Err(LayerError::storage("lvcreate failed").with_cause("volume group full"));
            }
            if self.mark_failed == Some(name.as_str()) {
                data.set_failed(true);
                return Ok(());
            }
            for vlm in data.volumes.values_mut() {
                vlm.exists = !ctx.deleting || self.keep_devices;
            }
            Ok(())
        }

        async fn process_snapshot(
            &self,
            ctx: &LayerContext,
            _data: &mut RscLayerData,
            _response: &mut ApiCallRc,
        ) -> LayerResult<()> {
            let snap = ctx.snapshot_name.as_ref().map(|s| s.to_string()).unwrap_or_default();
            self.log
                .lock()
                .push(format!("{} snap {}/{}", self.kind, ctx.rsc_name, snap));
            Ok(())
        }

        async fn clear_cache(&self) -> LayerResult<()> {
            self.log.lock().push(format!("{} clear", self.kind));
            Ok(())
        }

        async fn stor_pool_space_info(&self, _stor_pool: &StorPool) -> LayerResult<SpaceInfo> {
            Ok(SpaceInfo {
                total_capacity_kib: 100,
                free_capacity_kib: 50,
            })
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        rsc_responses: Mutex<BTreeMap<ResourceName, ApiCallRc>>,
        snap_responses: Mutex<BTreeMap<SnapshotKey, ApiCallRc>>,
        events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn response(&self, rsc: &str) -> ApiCallRc {
            self.rsc_responses
                .lock()
                .get(&ResourceName::from(rsc))
                .cloned()
                .unwrap_or_else(|| panic!("no response for {}", rsc))
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl NotificationListener for RecordingListener {
        fn notify_resource_dispatch_response(&self, rsc_name: &ResourceName, response: ApiCallRc) {
            self.rsc_responses.lock().insert(rsc_name.clone(), response);
        }
        fn notify_snapshot_dispatch_response(&self, key: &SnapshotKey, response: ApiCallRc) {
            self.snap_responses.lock().insert(key.clone(), response);
        }
        fn notify_resource_applied(&self, key: &ResourceKey, space_info: &SpaceInfoMap) {
            self.events
                .lock()
                .push(format!("applied {} ({} pools)", key.rsc_name, space_info.len()));
        }
        fn notify_resource_failed(&self, key: &ResourceKey, _: &ApiCallRc) {
            self.events.lock().push(format!("failed {}", key.rsc_name));
        }
        fn notify_resource_deleted(&self, rsc_name: &ResourceName) {
            self.events.lock().push(format!("deleted {}", rsc_name));
        }
        fn notify_volume_deleted(&self, key: &VolumeKey) {
            self.events.lock().push(format!("deleted volume {}", key));
        }
        fn notify_snapshot_deleted(&self, key: &SnapshotKey) {
            self.events.lock().push(format!("deleted snapshot {}", key));
        }
        fn notify_free_spaces_changed(&self, _: &SpaceInfoMap) {}
    }

    struct TestSplitTracker {
        log: Log,
        fail: bool,
    }

    impl LayerSplitTracker for TestSplitTracker {
        fn cleanup(&self) -> LayerResult<()> {
            self.log.lock().push("split cleanup".to_string());
            if self.fail {
                return Err(LayerError::storage("split state is corrupt"));
            }
            Ok(())
        }
    }

    struct NullPeer;

    impl ControllerPeer for NullPeer {
        fn notify_resource_applied(&self, _: &ResourceKey, _: &SpaceInfoMap) {}
        fn notify_resource_failed(&self, _: &ResourceKey, _: &ApiCallRc) {}
        fn notify_free_spaces_changed(&self, _: &SpaceInfoMap) {}
        fn notify_dev_mgr_run_completed(&self, _: u64) {}
        fn send_props_change(&self, _: &LocalPropsChange) {}
    }

    struct Connector;

    impl ControllerPeerConnector for Connector {
        fn controller_peer(&self) -> Option<Arc<dyn ControllerPeer>> {
            Some(Arc::new(NullPeer))
        }
        fn local_node_name(&self) -> NodeName {
            NodeName::from("n1")
        }
    }

    fn handler_with(layers: Vec<TestLayer>) -> (LayeredDeviceHandler, Arc<RecordingListener>) {
        handler_with_tracker(layers, Arc::new(NoLayerSplitTracking))
    }

    fn handler_with_tracker(
        layers: Vec<TestLayer>,
        split_tracker: Arc<dyn LayerSplitTracker>,
    ) -> (LayeredDeviceHandler, Arc<RecordingListener>) {
        let mut registry = LayerRegistry::new();
        for layer in layers {
            registry.register(Arc::new(layer)).unwrap();
        }
        let listener = Arc::new(RecordingListener::default());
        let handler = LayeredDeviceHandler::new(
            registry,
            split_tracker,
            listener.clone(),
            Arc::new(Connector),
            Arc::new(ErrorReporter::new()),
            Arc::new(SyncPoint::new()),
        );
        (handler, listener)
    }

    fn storage_tree(name: &str, id: u32) -> RscLayerData {
        RscLayerData::new(id, DeviceLayerKind::Storage, name)
            .with_volume(VlmLayerData::new(VolumeNumber(0)).with_stor_pool("pool"))
    }

    fn storage_rsc(name: &str) -> Resource {
        Resource::new(name, "n1", storage_tree(name, 1)).with_volume(Volume::new(VolumeNumber(0), 1024))
    }

    fn drbd_rsc(name: &str) -> Resource {
        let tree = RscLayerData::new(1, DeviceLayerKind::Drbd, name)
            .with_volume(VlmLayerData::new(VolumeNumber(0)))
            .with_child(storage_tree(name, 2));
        Resource::new(name, "n1", tree).with_volume(Volume::new(VolumeNumber(0), 1024))
    }

    async fn dispatch(
        handler: &LayeredDeviceHandler,
        rscs: &mut [Resource],
        snaps: &mut [Snapshot],
    ) -> DevMgrResult<()> {
        let index = ResourceIndex::from_resources(rscs.iter());
        let mut set = DispatchSet {
            resources: rscs.iter_mut().collect(),
            snapshots: snaps.iter_mut().collect(),
            volume_sizes: BTreeMap::new(),
            index,
            stor_pools: vec![StorPool::new("pool", "n1", ProviderKind::Lvm)],
        };
        handler.dispatch_resources(&mut set).await
    }

    #[tokio::test]
    async fn test_failure_of_one_resource_is_isolated() {
        let log = Log::default();
        let mut storage = TestLayer::new(DeviceLayerKind::Storage, &log);
        storage.fail_rsc = Some("b");
        let (handler, listener) = handler_with(vec![storage]);
        let mut rscs = vec![storage_rsc("a"), storage_rsc("b"), storage_rsc("c")];

        dispatch(&handler, &mut rscs, &mut []).await.unwrap();

        assert!(!listener.response("a").has_errors());
        assert!(!listener.response("c").has_errors());
        let failure = listener.response("b");
        let entry = &failure.entries()[0];
        assert_eq!(entry.return_code, rc::FAIL_UNKNOWN_ERROR);
        assert_eq!(entry.message, "lvcreate failed");
        assert_eq!(entry.cause.as_deref(), Some("volume group full"));
        assert_eq!(entry.error_ids.len(), 1);

        assert_eq!(
            listener.events(),
            vec!["failed b", "applied a (1 pools)", "applied c (1 pools)"]
        );
        assert_eq!(log.lock().last().map(String::as_str), Some("STORAGE clear"));
    }

    #[tokio::test]
    async fn test_prepare_failure_answers_every_resource() {
        let log = Log::default();
        let mut drbd = TestLayer::new(DeviceLayerKind::Drbd, &log);
        drbd.fail_prepare = true;
        let (handler, listener) =
            handler_with(vec![drbd, TestLayer::new(DeviceLayerKind::Storage, &log)]);
        let mut rscs = vec![drbd_rsc("a"), storage_rsc("b")];

        dispatch(&handler, &mut rscs, &mut []).await.unwrap();

        let failed = listener.response("a");
        assert_eq!(failed.entries()[0].message, "Preparing resources for layer DRBD failed");
        assert_eq!(failed.entries()[0].cause.as_deref(), Some("kernel module missing"));
        let skipped = listener.response("b");
        assert_eq!(skipped.entries()[0].return_code, rc::WARN_SKIPPED);
        assert!(!skipped.has_errors());

        assert!(log.lock().is_empty());
        assert_eq!(listener.events(), vec!["failed a"]);
    }

    #[tokio::test]
    async fn test_failed_layer_skips_layers_above() {
        let log = Log::default();
        let mut storage = TestLayer::new(DeviceLayerKind::Storage, &log);
        storage.mark_failed = Some("a");
        let (handler, listener) =
            handler_with(vec![TestLayer::new(DeviceLayerKind::Drbd, &log), storage]);
        let mut rscs = vec![drbd_rsc("a")];

        dispatch(&handler, &mut rscs, &mut []).await.unwrap();

        let entry = listener.response("a").entries()[0].clone();
        assert_eq!(entry.message, "Layer 'STORAGE' failed to process resource 'a'");
        assert_eq!(entry.details.as_deref(), Some("Skipping layers above [DRBD]"));
        assert!(!log.lock().contains(&"DRBD rsc a".to_string()));
    }

    #[tokio::test]
    async fn test_deletions_first_then_children_before_parents() {
        let log = Log::default();
        let (handler, listener) = handler_with(vec![
            TestLayer::new(DeviceLayerKind::Drbd, &log),
            TestLayer::new(DeviceLayerKind::Storage, &log),
        ]);
        let mut rscs = vec![
            drbd_rsc("a").with_child("c"),
            storage_rsc("b").with_flag(RscFlag::Delete),
            storage_rsc("c").with_parent("a"),
        ];

        dispatch(&handler, &mut rscs, &mut []).await.unwrap();

        let processed: Vec<String> = log
            .lock()
            .iter()
            .filter(|line| line.contains(" rsc "))
            .cloned()
            .collect();
        assert_eq!(
            processed,
            vec!["STORAGE rsc b", "STORAGE rsc c", "STORAGE rsc a", "DRBD rsc a"]
        );
        let events = listener.events();
        assert!(events.contains(&"deleted b".to_string()));
        assert!(events.contains(&"deleted volume b/0".to_string()));
        assert!(!events.iter().any(|e| e.starts_with("applied b")));
    }

    #[tokio::test]
    async fn test_volume_left_behind_fails_deletion() {
        let log = Log::default();
        let mut storage = TestLayer::new(DeviceLayerKind::Storage, &log);
        storage.keep_devices = true;
        let (handler, listener) = handler_with(vec![storage]);
        let mut rscs = vec![storage_rsc("d").with_flag(RscFlag::Delete)];

        dispatch(&handler, &mut rscs, &mut []).await.unwrap();

        assert_eq!(
            listener.response("d").entries()[0].message,
            "Layer 'STORAGE' did not delete the volume 0 of resource d properly"
        );
        assert_eq!(listener.events(), vec!["failed d"]);
    }

    #[tokio::test]
    async fn test_snapshot_order_and_storage_only() {
        let log = Log::default();
        let (handler, listener) = handler_with(vec![
            TestLayer::new(DeviceLayerKind::Drbd, &log),
            TestLayer::new(DeviceLayerKind::Storage, &log),
        ]);
        let mut rscs = vec![storage_rsc("a")];
        let drbd_snap_tree = RscLayerData::new(1, DeviceLayerKind::Drbd, "x")
            .with_child(storage_tree("x", 2));
        let mut snaps = vec![
            Snapshot::new("a", "old", "n1", storage_tree("a", 1)).with_flag(SnapshotFlag::Delete),
            Snapshot::new("x", "new", "n1", drbd_snap_tree),
        ];

        dispatch(&handler, &mut rscs, &mut snaps).await.unwrap();

        let processed: Vec<String> = log
            .lock()
            .iter()
            .filter(|line| !line.ends_with("clear"))
            .cloned()
            .collect();
        assert_eq!(
            processed,
            vec!["STORAGE snap a/old", "STORAGE rsc a", "STORAGE snap x/new"]
        );
        assert_eq!(listener.snap_responses.lock().len(), 2);
        assert!(listener.events().contains(&"deleted snapshot a/old".to_string()));
    }

    #[tokio::test]
    async fn test_every_dispatched_resource_is_answered() {
        let log = Log::default();
        let (handler, listener) = handler_with(vec![
            TestLayer::new(DeviceLayerKind::Drbd, &log),
            TestLayer::new(DeviceLayerKind::Storage, &log),
        ]);
        let mut rscs = vec![
            drbd_rsc("a").with_child("b"),
            storage_rsc("b").with_parent("a"),
            storage_rsc("c").with_flag(RscFlag::Delete),
        ];

        dispatch(&handler, &mut rscs, &mut []).await.unwrap();

        let answered: Vec<String> = listener
            .rsc_responses
            .lock()
            .keys()
            .map(ToString::to_string)
            .collect();
        assert_eq!(answered, vec!["a", "b", "c"]);
        assert_eq!(
            log.lock().iter().filter(|line| line.contains(" rsc ")).count(),
            4
        );
    }

    #[tokio::test]
    async fn test_split_tracker_cleanup_follows_cache_clear() {
        let log = Log::default();
        let tracker = Arc::new(TestSplitTracker {
            log: log.clone(),
            fail: false,
        });
        let (handler, _listener) = handler_with_tracker(
            vec![TestLayer::new(DeviceLayerKind::Storage, &log)],
            tracker,
        );

        dispatch(&handler, &mut [storage_rsc("a")], &mut [])
            .await
            .unwrap();

        let tail: Vec<String> = log.lock().iter().rev().take(2).rev().cloned().collect();
        assert_eq!(tail, vec!["STORAGE clear", "split cleanup"]);
    }

    #[tokio::test]
    async fn test_split_tracker_failure_is_swallowed() {
        let log = Log::default();
        let tracker = Arc::new(TestSplitTracker {
            log: log.clone(),
            fail: true,
        });
        let (handler, listener) = handler_with_tracker(
            vec![TestLayer::new(DeviceLayerKind::Storage, &log)],
            tracker,
        );

        dispatch(&handler, &mut [storage_rsc("a")], &mut [])
            .await
            .unwrap();

        assert!(!listener.response("a").has_errors());
        assert_eq!(log.lock().last().map(String::as_str), Some("split cleanup"));
    }

    #[tokio::test]
    async fn test_sync_point_is_released() {
        let log = Log::default();
        let sync_point = Arc::new(SyncPoint::new());
        let mut registry = LayerRegistry::new();
        registry
            .register(Arc::new(TestLayer::new(DeviceLayerKind::Storage, &log)))
            .unwrap();
        let handler = LayeredDeviceHandler::new(
            registry,
            Arc::new(NoLayerSplitTracking),
            Arc::new(RecordingListener::default()),
            Arc::new(Connector),
            Arc::new(ErrorReporter::new()),
            sync_point.clone(),
        );

        dispatch(&handler, &mut [storage_rsc("a")], &mut [])
            .await
            .unwrap();
        assert_eq!(sync_point.pending(), 0);
    }
}
