//! The device manager service.
//!
//! A single tokio task runs the reconciliation loop. Each cycle either
//! dispatches every known resource (after a full sync) or walks through the
//! incremental phases:
//!
//! 1. collect update notifications from the tracker
//! 2. wait until the current full sync has been applied
//! 3. request the announced objects from the controller
//! 4. wait until every requested object was received and applied
//!
//! and then dispatches the pending resources, snapshots and nodes to the
//! device handler while holding the whole object graph for writing.
//! Responses are sent to the requesters, deleted objects are removed from
//! the graph and the controller is told that the cycle completed.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::cleanup::deleted_objects_cleanup;
use crate::config::DeviceManagerConfig;
use crate::error::{DevMgrError, DevMgrResult};
use crate::handler::{DeviceHandler, DispatchSet, LayeredDeviceHandler};
use crate::listener::{DispatchListener, NotificationListener};
use crate::monitor::UpdateMonitor;
use crate::registry::LayerRegistry;
use crate::reporter::ErrorReporter;
use crate::sched::{DispatchRequest, LoopFlags, PendingMap, Scheduler};
use crate::sync_point::SyncPoint;
use crate::tracker::UpdateTracker;
use crate::traverse::ResourceIndex;
use parking_lot::{Mutex, RwLock};
use satellite_common::{
    rc, ApiCallRc, ControllerPeerConnector, GraphWriteGuard, LayerSplitTracker, Node, NodeName,
    ObjectGraph, Props, RcEntry, ResourceDefinition, ResourceKey, ResourceName, SecurityObjects,
    SnapshotKey, SpaceInfo, StorPool, StorPoolName, UpdateRequester, VolumeNumber,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Collaborators of the device manager.
pub struct DeviceManagerDeps {
    pub graph: Arc<ObjectGraph>,
    pub registry: LayerRegistry,
    /// Use [`NoLayerSplitTracking`](satellite_common::NoLayerSplitTracking)
    /// when no layer splits resources
    pub split_tracker: Arc<dyn LayerSplitTracker>,
    pub requester: Arc<dyn UpdateRequester>,
    pub connector: Arc<dyn ControllerPeerConnector>,
    pub security: Arc<SecurityObjects>,
}

/// Data copied out of the object graph after every dispatch, readable
/// without taking graph locks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOnlyData {
    pub stor_pools: Vec<StorPool>,
}

struct Inner {
    config: DeviceManagerConfig,
    graph: Arc<ObjectGraph>,
    requester: Arc<dyn UpdateRequester>,
    connector: Arc<dyn ControllerPeerConnector>,
    security: Arc<SecurityObjects>,
    sched: Arc<Scheduler>,
    listener: Arc<dyn NotificationListener>,
    handler: Arc<dyn DeviceHandler>,
    sync_point: Arc<SyncPoint>,
    reporter: Arc<ErrorReporter>,
    monitor: Arc<UpdateMonitor>,
    read_only: RwLock<Arc<ReadOnlyData>>,
    cycle: AtomicU64,
}

/// Reconciles the satellite's devices with the state the controller sent.
pub struct DeviceManager {
    inner: Arc<Inner>,
    tracker: UpdateTracker,
    task: Mutex<Option<JoinHandle<()>>>,
    handler_initialized: std::sync::atomic::AtomicBool,
}

impl DeviceManager {
    pub fn new(config: DeviceManagerConfig, deps: DeviceManagerDeps) -> Self {
        let sched = Arc::new(Scheduler::new());
        let listener: Arc<dyn NotificationListener> =
            Arc::new(DispatchListener::new(sched.clone(), deps.connector.clone()));
        let sync_point = Arc::new(SyncPoint::new());
        let reporter = Arc::new(ErrorReporter::new());
        let monitor = Arc::new(UpdateMonitor::new(sched.wakeup()));
        let handler = Arc::new(LayeredDeviceHandler::new(
            deps.registry,
            deps.split_tracker,
            listener.clone(),
            deps.connector.clone(),
            reporter.clone(),
            sync_point.clone(),
        ));

        Self {
            tracker: UpdateTracker::new(sched.clone()),
            inner: Arc::new(Inner {
                config,
                graph: deps.graph,
                requester: deps.requester,
                connector: deps.connector,
                security: deps.security,
                sched,
                listener,
                handler,
                sync_point,
                reporter,
                monitor,
                read_only: RwLock::new(Arc::new(ReadOnlyData::default())),
                cycle: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
            handler_initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Starts the loop task. Starting a running device manager does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let flags = &self.inner.sched.flags;
        LoopFlags::set(&flags.shutdown, false);
        if flags
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if !self.handler_initialized.swap(true, Ordering::SeqCst) {
            self.inner.handler.initialize();
        }

        let inner = self.inner.clone();
        *self.task.lock() = Some(tokio::spawn(async move { inner.run().await }));

        info!("{} started", self.inner.config.instance_name);
        crate::audit_log!(AuditRecord::new(
            AuditCategory::Lifecycle,
            &self.inner.config.instance_name,
            "start"
        )
        .with_outcome(AuditOutcome::Success));
    }

    /// Asks the loop to stop and aborts running device handlers. Returns
    /// immediately; see [`DeviceManager::await_shutdown`].
    pub fn shutdown(&self) {
        let flags = &self.inner.sched.flags;
        LoopFlags::set(&flags.abort_dev_hnd, true);
        LoopFlags::set(&flags.shutdown, true);
        LoopFlags::set(&flags.svc_cond, false);
        self.inner.sched.notify();

        crate::audit_log!(AuditRecord::new(
            AuditCategory::Lifecycle,
            &self.inner.config.instance_name,
            "shutdown"
        ));
    }

    /// Waits up to `timeout` for the loop task to end. Returns false if it
    /// is still running.
    pub async fn await_shutdown(&self, timeout: Duration) -> bool {
        let handle = self.task.lock().take();
        let Some(mut handle) = handle else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => {
                if let Err(err) = joined {
                    warn!("{} task ended abnormally: {}", self.inner.config.instance_name, err);
                }
                crate::audit_log!(AuditRecord::new(
                    AuditCategory::Lifecycle,
                    &self.inner.config.instance_name,
                    "shutdown"
                )
                .with_outcome(AuditOutcome::Success));
                true
            }
            Err(_) => {
                *self.task.lock() = Some(handle);
                false
            }
        }
    }

    /// [`DeviceManager::await_shutdown`] with the configured timeout.
    pub async fn await_shutdown_default(&self) -> bool {
        self.await_shutdown(self.inner.config.shutdown_timeout()).await
    }

    pub fn is_started(&self) -> bool {
        LoopFlags::get(&self.inner.sched.flags.running)
    }

    /// Number of the cycle currently running or next to run.
    pub fn cycle_count(&self) -> u64 {
        self.inner.cycle.load(Ordering::SeqCst)
    }

    // ---- service conditions ----------------------------------------------

    pub fn replication_state_available(&self) {
        let flags = &self.inner.sched.flags;
        LoopFlags::set(&flags.state_available, true);
        LoopFlags::set(&flags.wait_upd, false);
        LoopFlags::set(&flags.svc_cond, true);
        self.inner.sched.notify();
    }

    pub fn replication_state_unavailable(&self) {
        LoopFlags::set(&self.inner.sched.flags.state_available, false);
    }

    /// Interrupts the current wait. The loop resumes after the next full
    /// sync.
    pub fn controller_connection_lost(&self) {
        LoopFlags::set(&self.inner.sched.flags.svc_cond, false);
        self.inner.sched.notify();
    }

    /// Makes a blocking notification collection return once.
    pub fn force_wake_update_notifications(&self) {
        LoopFlags::set(&self.inner.sched.flags.force_wake, true);
        self.inner.sched.notify();
    }

    /// Stops enqueueing further resources into the running dispatch.
    pub fn abort_device_handlers(&self) {
        LoopFlags::set(&self.inner.sched.flags.abort_dev_hnd, true);
        crate::audit_log!(AuditRecord::new(
            AuditCategory::Abort,
            &self.inner.config.instance_name,
            "abort_device_handlers"
        )
        .with_outcome(AuditOutcome::Success));
    }

    // ---- full sync and properties ------------------------------------------

    /// The controller's whole state was applied to the object graph. Drops
    /// outstanding update requests, lets the next cycle dispatch every
    /// resource and hands the local node's properties to the layers.
    pub async fn full_sync_applied(&self, local_node: &Node) -> DevMgrResult<()> {
        self.inner.sched.lock().clear_bundles();
        let flags = &self.inner.sched.flags;
        LoopFlags::set(&flags.full_sync, true);
        LoopFlags::set(&flags.svc_cond, true);
        LoopFlags::set(&flags.force_wake, true);
        self.inner.sched.notify();
        self.inner.monitor.set_full_sync_applied();

        crate::audit_log!(AuditRecord::new(
            AuditCategory::FullSync,
            &self.inner.config.instance_name,
            "full_sync_applied"
        )
        .with_object_id(local_node.name.to_string())
        .with_details(serde_json::json!({
            "full_sync_id": self.inner.monitor.current_full_sync_id(),
        }))
        .with_outcome(AuditOutcome::Success));

        self.inner.handler.local_node_props_changed(&local_node.props).await
    }

    pub async fn apply_changed_node_props(&self, props: &Props) -> DevMgrResult<()> {
        self.inner.handler.local_node_props_changed(props).await
    }

    /// Checks a storage pool and returns its space information.
    pub async fn get_space_info(&self, stor_pool: &StorPool, update: bool) -> DevMgrResult<SpaceInfo> {
        self.inner.handler.get_space_info(stor_pool, update).await
    }

    // ---- accessors -------------------------------------------------------

    pub fn update_tracker(&self) -> &UpdateTracker {
        &self.tracker
    }

    pub fn update_monitor(&self) -> &Arc<UpdateMonitor> {
        &self.inner.monitor
    }

    pub fn read_only_data(&self) -> Arc<ReadOnlyData> {
        self.inner.read_only.read().clone()
    }

    pub fn clear_read_only_info(&self) {
        *self.inner.read_only.write() = Arc::new(ReadOnlyData::default());
    }

    // ---- applied updates -------------------------------------------------

    /// The requested controller data was applied; `rsc_names` are the
    /// resources affected by it.
    pub fn controller_update_applied(&self, rsc_names: &BTreeSet<ResourceName>) {
        {
            let mut state = self.inner.sched.lock();
            let notification = state.rcv_pending.controller_update.take();
            state.mark_pending_rsc_dispatch(notification.as_ref(), rsc_names);
            state.retain_response_sinks(notification.as_ref());
        }
        self.inner.sched.notify();
    }

    pub fn node_update_applied(
        &self,
        node_names: &BTreeSet<NodeName>,
        rsc_names: &BTreeSet<ResourceName>,
    ) {
        let received_all = {
            let mut state = self.inner.sched.lock();
            for node_name in node_names {
                let notification = state.rcv_pending.node_updates.remove(node_name);
                state.mark_pending_rsc_dispatch(notification.as_ref(), rsc_names);
                state.mark_pending_node_dispatch(notification.as_ref(), node_name);
            }
            state.rcv_pending.is_empty()
        };
        if received_all {
            self.inner.sched.notify();
        }
    }

    /// Like [`DeviceManager::node_update_applied`]; `responses` are sent to
    /// the requesters of the storage pools right away.
    pub fn stor_pool_update_applied(
        &self,
        stor_pool_names: &BTreeSet<StorPoolName>,
        rsc_names: &BTreeSet<ResourceName>,
        responses: &ApiCallRc,
    ) {
        let received_all = {
            let mut state = self.inner.sched.lock();
            for stor_pool_name in stor_pool_names {
                let notification = state.rcv_pending.stor_pool_updates.remove(stor_pool_name);
                state.mark_pending_rsc_dispatch(notification.as_ref(), rsc_names);
                state.retain_response_sinks(notification.as_ref());
                if let Some(notification) = &notification {
                    for sink in notification.response_sinks() {
                        sink.next(responses.clone());
                    }
                }
            }
            state.rcv_pending.is_empty()
        };
        if received_all {
            self.inner.sched.notify();
        }
    }

    pub fn rsc_update_applied(&self, keys: &BTreeSet<ResourceKey>) {
        let rsc_names: BTreeSet<ResourceName> =
            keys.iter().map(|key| key.rsc_name.clone()).collect();
        let received_all = {
            let mut state = self.inner.sched.lock();
            for key in keys {
                let notification = state.rcv_pending.rsc_updates.remove(key);
                state.mark_pending_rsc_dispatch(notification.as_ref(), &rsc_names);
            }
            state.rcv_pending.is_empty()
        };
        if received_all {
            self.inner.sched.notify();
        }
    }

    pub fn snapshot_update_applied(&self, keys: &BTreeSet<SnapshotKey>) {
        let received_all = {
            let mut state = self.inner.sched.lock();
            for key in keys {
                let notification = state.rcv_pending.snapshot_updates.remove(key);
                state.mark_pending_snap_dispatch(notification.as_ref(), keys);
            }
            state.rcv_pending.is_empty()
        };
        if received_all {
            self.inner.sched.notify();
        }
    }

    /// Queues a resource for the next dispatch without any requester.
    pub fn mark_resource_for_dispatch(&self, rsc_name: &ResourceName) {
        self.inner
            .sched
            .lock()
            .mark_pending_rsc_dispatch(None, [rsc_name]);
        self.inner.sched.notify();
    }

    pub fn mark_multiple_resources_for_dispatch(&self, rsc_names: &BTreeSet<ResourceName>) {
        self.inner
            .sched
            .lock()
            .mark_pending_rsc_dispatch(None, rsc_names);
        self.inner.sched.notify();
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        debug!("{} service started", self.config.instance_name);
        let flags = &self.sched.flags;

        while !LoopFlags::get(&flags.shutdown) {
            let mut announced = false;
            while !LoopFlags::get(&flags.svc_cond) && !LoopFlags::get(&flags.shutdown) {
                if !announced {
                    info!("DeviceManager waiting for service-condition");
                    announced = true;
                }
                self.sched.wait().await;
            }
            if LoopFlags::get(&flags.shutdown) {
                break;
            }

            let cycle = self.cycle.load(Ordering::SeqCst);
            let span = info_span!("devmgr_cycle", cycle);
            let result = self.run_cycle(cycle).instrument(span.clone()).await;

            let stop = span.in_scope(|| {
                let stop = match result {
                    Ok(()) => false,
                    Err(DevMgrError::ServiceCondition) => {
                        LoopFlags::set(&flags.svc_cond, false);
                        flags.shutdown.swap(false, Ordering::SeqCst)
                    }
                    Err(err @ DevMgrError::AccessDenied { .. }) => {
                        self.reporter.report_error(
                            &err,
                            Some(
                                "The DeviceManager lacks the privileges to access all required \
                                 information and stops",
                            ),
                        );
                        true
                    }
                    Err(err) => {
                        self.reporter.report_error(
                            &err,
                            Some("The DeviceManager service caught an unhandled error"),
                        );
                        false
                    }
                };

                info!("End DeviceManager cycle {}", cycle);
                if let Some(peer) = self.connector.controller_peer() {
                    peer.notify_dev_mgr_run_completed(cycle);
                }
                self.cycle.fetch_add(1, Ordering::SeqCst);
                stop
            });
            if stop {
                break;
            }
        }

        LoopFlags::set(&flags.running, false);
        debug!("{} service stopped", self.config.instance_name);
    }

    async fn run_cycle(&self, cycle: u64) -> DevMgrResult<()> {
        info!("Begin DeviceManager cycle {}", cycle);
        let flags = &self.sched.flags;

        if flags.full_sync.swap(false, Ordering::SeqCst) {
            self.phase_full_sync().await?;
        } else {
            self.phase_collect_update_notifications().await?;
            LoopFlags::set(&flags.wait_upd, false);
            self.phase_await_full_sync().await?;
            self.phase_request_update_data();
            self.phase_collect_update_data().await?;
        }
        LoopFlags::set(&flags.wait_upd, true);

        if !self.config.require_replication_state || LoopFlags::get(&flags.state_available) {
            self.phase_dispatch_device_handlers().await
        } else {
            trace!(
                "Execution of device handlers skipped, because replication state tracking \
                 is currently inoperative"
            );
            tokio::time::sleep(self.config.state_unavailable_backoff()).await;
            Ok(())
        }
    }

    async fn phase_full_sync(&self) -> DevMgrResult<()> {
        trace!("Executing device handlers after full sync");
        let rsc_names = self.graph.rsc_dfn_names().await;
        self.sched
            .lock()
            .mark_pending_rsc_dispatch(None, rsc_names.iter());

        let local_node = self
            .graph
            .read_nodes()
            .await
            .get(self.graph.local_node_name())
            .cloned();
        match local_node {
            Some(node) => self.handler.full_sync_applied(&node).await,
            None => {
                warn!(
                    "Local node '{}' is unknown after the full sync",
                    self.graph.local_node_name()
                );
                Ok(())
            }
        }
    }

    async fn phase_collect_update_notifications(&self) -> DevMgrResult<()> {
        trace!("Collecting update notifications");
        let flags = &self.sched.flags;
        loop {
            {
                let mut state = self.sched.lock();
                if !state.upd_pending.is_empty() {
                    return Ok(());
                }
                let may_block = LoopFlags::get(&flags.wait_upd)
                    && state.pending_dispatch_rscs.is_empty()
                    && state.pending_dispatch_nodes.is_empty();
                let force_wake = flags.force_wake.swap(false, Ordering::SeqCst);
                let keep_waiting = flags.keep_waiting();

                if !state.cached.is_empty() || !may_block || force_wake || !keep_waiting {
                    let state = &mut *state;
                    state.cached.move_into(&mut state.upd_pending);
                    return if keep_waiting {
                        Ok(())
                    } else {
                        Err(DevMgrError::ServiceCondition)
                    };
                }
            }
            self.sched.wait().await;
        }
    }

    async fn phase_await_full_sync(&self) -> DevMgrResult<()> {
        let mut announced = false;
        while !self.monitor.is_current_full_sync_applied() {
            if !self.sched.flags.keep_waiting() {
                return Err(DevMgrError::ServiceCondition);
            }
            if !announced {
                trace!("Waiting until the current full sync is applied");
                announced = true;
            }
            self.sched.wait().await;
        }
        if LoopFlags::get(&self.sched.flags.shutdown) {
            return Err(DevMgrError::ServiceCondition);
        }
        Ok(())
    }

    fn phase_request_update_data(&self) {
        let requests = {
            let mut state = self.sched.lock();
            let state = &mut *state;
            state.upd_pending.copy_update_requests_to(&mut state.rcv_pending);
            std::mem::take(&mut state.upd_pending)
        };
        if requests.is_empty() {
            return;
        }
        trace!("Requesting {} object updates from the controller", requests.len());

        if requests.controller_update.is_some() {
            self.requester.request_controller_update();
        }
        for (node_name, notification) in &requests.node_updates {
            self.requester.request_node_update(notification.uuid(), node_name);
        }
        for (stor_pool_name, notification) in &requests.stor_pool_updates {
            self.requester
                .request_stor_pool_update(notification.uuid(), stor_pool_name);
        }
        for (key, notification) in &requests.rsc_updates {
            self.requester.request_rsc_update(notification.uuid(), key);
        }
        for (key, notification) in &requests.snapshot_updates {
            self.requester.request_snapshot_update(notification.uuid(), key);
        }
    }

    async fn phase_collect_update_data(&self) -> DevMgrResult<()> {
        let mut announced = false;
        loop {
            {
                let state = self.sched.lock();
                if !self.sched.flags.keep_waiting() {
                    return Err(DevMgrError::ServiceCondition);
                }
                if state.rcv_pending.is_empty() {
                    break;
                }
            }
            if !announced {
                trace!("Waiting for object updates to be received and applied");
                announced = true;
            }
            self.sched.wait().await;
        }
        trace!("All object updates were received");
        Ok(())
    }

    async fn phase_dispatch_device_handlers(&self) -> DevMgrResult<()> {
        let request = self.sched.lock().take_dispatch();
        if request.is_empty() {
            trace!("Nothing to dispatch");
            return Ok(());
        }
        trace!("Dispatching nodes and resources to device handlers");

        let mut graph = self.graph.write_all().await;
        self.copy_read_only_data(&graph);
        let result = self.dispatch_locked(&mut graph, &request).await;
        self.copy_read_only_data(&graph);
        result
    }

    async fn dispatch_locked(
        &self,
        graph: &mut GraphWriteGuard<'_>,
        request: &DispatchRequest,
    ) -> DevMgrResult<()> {
        let have_master_key = self.security.is_crypt_key_available();
        let flags = &self.sched.flags;
        LoopFlags::set(&flags.abort_dev_hnd, false);
        let local = graph.local_node_name().clone();

        let mut rsc_names: BTreeSet<ResourceName> = BTreeSet::new();
        let mut remote_deletions: Vec<ResourceKey> = Vec::new();
        for rsc_name in request.rscs.keys() {
            match graph.rsc_dfns.get(rsc_name) {
                Some(rsc_dfn) => {
                    remote_deletions.extend(
                        rsc_dfn
                            .resources
                            .values()
                            .filter(|rsc| rsc.node_name != local && rsc.is_deleting())
                            .map(|rsc| rsc.key()),
                    );
                    if !have_master_key && rsc_dfn.has_encrypted_volumes() {
                        warn!(
                            "Skipped actions for encrypted resource '{}' because the encryption \
                             key is not known yet",
                            rsc_name
                        );
                        self.listener.notify_resource_dispatch_response(
                            rsc_name,
                            ApiCallRc::single(
                                0,
                                format!("Skipping processing resource: {}", rsc_name),
                                "Masterkey not available for decrypt",
                            ),
                        );
                    } else if rsc_dfn.resources.contains_key(&local) {
                        rsc_names.insert(rsc_name.clone());
                    }
                }
                None => {
                    warn!(
                        "Dispatch request for resource definition '{}' which is unknown to this \
                         satellite",
                        rsc_name
                    );
                    self.listener.notify_resource_dispatch_response(
                        rsc_name,
                        ApiCallRc::single(
                            0,
                            format!("Skipping processing resource: {}", rsc_name),
                            "Resource is already deleted",
                        ),
                    );
                }
            }
            if LoopFlags::get(&flags.abort_dev_hnd) {
                break;
            }
        }

        let mut snap_keys: BTreeSet<SnapshotKey> = BTreeSet::new();
        for key in request.snaps.keys() {
            let known = graph
                .rsc_dfns
                .get(&key.rsc_name)
                .and_then(|rsc_dfn| rsc_dfn.snapshot(&key.snapshot_name, &local))
                .is_some();
            if known {
                snap_keys.insert(key.clone());
            } else {
                self.listener.notify_snapshot_dispatch_response(
                    key,
                    ApiCallRc::single(
                        0,
                        format!(
                            "Skipping processing unknown snapshot '{}' of resource '{}'",
                            key.snapshot_name, key.rsc_name
                        ),
                        "Resource is already deleted",
                    ),
                );
            }
        }

        let index = ResourceIndex::from_resources(
            graph
                .rsc_dfns
                .values()
                .filter_map(|rsc_dfn| rsc_dfn.resources.get(&local)),
        );
        let volume_sizes: BTreeMap<ResourceName, BTreeMap<VolumeNumber, u64>> = snap_keys
            .iter()
            .filter_map(|key| {
                graph.rsc_dfns.get(&key.rsc_name).map(|rsc_dfn| {
                    let sizes = rsc_dfn
                        .volume_dfns
                        .values()
                        .map(|vlm_dfn| (vlm_dfn.vlm_nr, vlm_dfn.size_kib))
                        .collect();
                    (key.rsc_name.clone(), sizes)
                })
            })
            .collect();
        let stor_pools = graph.local_stor_pools();

        let dispatch_result = {
            let mut resources = Vec::new();
            let mut snapshots = Vec::new();
            for (name, rsc_dfn) in graph.rsc_dfns.iter_mut() {
                let ResourceDefinition {
                    resources: rscs,
                    snapshot_dfns,
                    ..
                } = rsc_dfn;
                if rsc_names.contains(name) {
                    if let Some(rsc) = rscs.get_mut(&local) {
                        resources.push(rsc);
                    }
                }
                for (snap_name, snap_dfn) in snapshot_dfns.iter_mut() {
                    if snap_keys.contains(&SnapshotKey::new(name.clone(), snap_name.clone())) {
                        if let Some(snap) = snap_dfn.snapshots.get_mut(&local) {
                            snapshots.push(snap);
                        }
                    }
                }
            }

            let mut set = DispatchSet {
                resources,
                snapshots,
                volume_sizes,
                index,
                stor_pools,
            };
            self.handler.dispatch_resources(&mut set).await
        };

        if LoopFlags::get(&flags.abort_dev_hnd) {
            trace!("Stopped dispatching resource handlers due to abort request");
        }
        trace!("Waiting for queued resource handlers to finish");
        self.sync_point.await_idle().await;
        trace!("All dispatched resource handlers finished");

        if let Err(err) = &dispatch_result {
            let mut state = self.sched.lock();
            for rsc_name in &rsc_names {
                state
                    .dispatch_rsc_responses
                    .entry(rsc_name.clone())
                    .or_insert_with(|| {
                        ApiCallRc::singleton(
                            RcEntry::new(
                                rc::FAIL_UNKNOWN_ERROR,
                                format!("Processing of resource '{}' was aborted", rsc_name),
                            )
                            .with_cause(Some(err.to_string())),
                        )
                    });
            }
        }

        self.respond_to_controller(request);

        let deleted = self.sched.lock().take_deleted();
        let summary = deleted_objects_cleanup(graph, &deleted, &remote_deletions);
        if !summary.is_empty() {
            crate::audit_log!(AuditRecord::new(
                AuditCategory::Cleanup,
                &self.config.instance_name,
                "deleted_objects_cleanup"
            )
            .with_details(serde_json::json!({
                "snapshot_dfns": summary.snapshot_dfns,
                "rsc_dfns": summary.rsc_dfns,
                "resources": summary.resources,
                "volume_dfns": summary.volume_dfns,
                "nodes": summary.nodes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }))
            .with_outcome(AuditOutcome::Success));
        }

        let record = AuditRecord::new(AuditCategory::Dispatch, &self.config.instance_name, "dispatch")
            .with_details(serde_json::json!({
                "resources": rsc_names.len(),
                "snapshots": snap_keys.len(),
                "nodes": request.nodes.len(),
            }));
        crate::audit_log!(match &dispatch_result {
            Ok(()) => record.with_outcome(AuditOutcome::Success),
            Err(err) => record.with_error(err.to_string()),
        });

        dispatch_result
    }

    /// Sends the collected responses to the requesters and completes every
    /// sink of the dispatch.
    fn respond_to_controller(&self, request: &DispatchRequest) {
        {
            let mut state = self.sched.lock();
            for node_name in request.nodes.keys() {
                state.dispatch_node_responses.insert(
                    node_name.clone(),
                    ApiCallRc::singleton(RcEntry::new(rc::MODIFIED, "Node changes applied.")),
                );
            }
            respond(&mut state.dispatch_node_responses, &request.nodes);
            respond(&mut state.dispatch_rsc_responses, &request.rscs);
            respond(&mut state.dispatch_snap_responses, &request.snaps);
        }
        for sink in &request.sinks {
            sink.complete();
        }
    }

    fn copy_read_only_data(&self, graph: &GraphWriteGuard<'_>) {
        *self.read_only.write() = Arc::new(ReadOnlyData {
            stor_pools: graph.local_stor_pools(),
        });
    }
}

fn respond<K: Ord>(responses: &mut BTreeMap<K, ApiCallRc>, pending: &PendingMap<K>) {
    for (key, response) in std::mem::take(responses) {
        if let Some(sinks) = pending.get(&key) {
            for sink in sinks {
                sink.next(response.clone());
            }
        }
    }
}
