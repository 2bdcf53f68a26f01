//! Suspend and resume of resource I/O.
//!
//! Root layers of all resources change their suspend state first, one right
//! after the other, so that writers of related resources are frozen close
//! together in time. Only then do the layers below the roots get their
//! post-root hook, e.g. to flush a cache under a suspended device.

use crate::error::{DevMgrError, DevMgrResult};
use crate::registry::LayerRegistry;
use satellite_common::{ApiCallRc, DeviceLayer, LayerError, Resource, ResourceName, RscLayerData, WalkOrder};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-resource failures of a suspend management run.
pub type SuspendFailures = BTreeMap<ResourceName, ApiCallRc>;

/// Drives suspend and resume of the registered layers.
#[derive(Debug, Clone)]
pub struct SuspendManager {
    registry: LayerRegistry,
}

impl SuspendManager {
    pub fn new(registry: LayerRegistry) -> Self {
        Self { registry }
    }

    /// Brings the suspend state of every resource in line with its layer
    /// data's desired state. With `resume_only` every suspended root is
    /// resumed.
    ///
    /// Recoverable layer failures are turned into a response by `on_error`
    /// and returned per resource. Fatal failures abort the run.
    pub async fn manage_suspend_io<F>(
        &self,
        rscs: &mut [&mut Resource],
        resume_only: bool,
        mut on_error: F,
    ) -> DevMgrResult<SuspendFailures>
    where
        F: FnMut(&Resource, &LayerError) -> ApiCallRc + Send,
    {
        let mut failures = SuspendFailures::new();

        for rsc in rscs.iter_mut() {
            if !is_relevant(rsc) {
                continue;
            }
            let layer = self.registry.get(rsc.layer_data.kind)?;
            if !layer.is_suspend_io_supported() {
                continue;
            }
            let result = update_root(layer, &mut rsc.layer_data, resume_only).await;
            record(&mut failures, rsc, result, &mut on_error)?;
        }

        for rsc in rscs.iter_mut() {
            if !is_relevant(rsc) {
                continue;
            }
            let result = self.post_root_suspend(&mut rsc.layer_data).await?;
            record(&mut failures, rsc, result, &mut on_error)?;
        }

        Ok(failures)
    }

    /// Runs the post-root hook of every non-root layer, parent first.
    ///
    /// The outer result carries tree and registry errors, the inner one the
    /// first layer failure.
    async fn post_root_suspend(&self, tree: &mut RscLayerData) -> DevMgrResult<Result<(), LayerError>> {
        for path in tree.walk_paths(WalkOrder::PreOrder)? {
            if path.is_empty() {
                continue;
            }
            let node = tree.node_mut(&path).ok_or_else(|| {
                DevMgrError::implementation(format!("Layer path {:?} vanished during suspend", path))
            })?;
            let layer = self.registry.get(node.kind)?;
            if let Err(err) = layer.manage_post_root_suspend(node).await {
                return Ok(Err(err));
            }
        }
        Ok(Ok(()))
    }
}

fn is_relevant(rsc: &Resource) -> bool {
    !rsc.is_inactive() && rsc.layer_data.exists()
}

async fn update_root(
    layer: &Arc<dyn DeviceLayer>,
    data: &mut RscLayerData,
    resume_only: bool,
) -> Result<(), LayerError> {
    let should_suspend = data.exists() && data.should_suspend_io && !resume_only;
    layer.update_suspend_state(data).await?;

    if data.is_suspended() != should_suspend {
        if should_suspend {
            debug!("Suspending I/O of {}", data.suffixed_name());
            layer.suspend_io(data).await?;
        } else {
            debug!("Resuming I/O of {}", data.suffixed_name());
            layer.resume_io(data).await?;
        }
        data.suspended = Some(should_suspend);
    } else {
        trace!("Suspend state of {} already {}", data.suffixed_name(), should_suspend);
    }
    Ok(())
}

fn record<F>(
    failures: &mut SuspendFailures,
    rsc: &Resource,
    result: Result<(), LayerError>,
    on_error: &mut F,
) -> DevMgrResult<()>
where
    F: FnMut(&Resource, &LayerError) -> ApiCallRc,
{
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_fatal() => Err(err.into()),
        Err(err) => {
            let response = on_error(rsc, &err);
            failures.entry(rsc.name.clone()).or_default().add_entries(response);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use satellite_common::{
        rc, DeviceLayerKind, LayerContext, LayerDataRef, LayerResult, RcEntry, RscFlag, VlmLayerData,
        VolumeNumber,
    };

    #[derive(Default)]
    struct SuspendLayer {
        kind: Option<DeviceLayerKind>,
        calls: Mutex<Vec<String>>,
        fail_suspend_of: Option<String>,
        fatal: bool,
    }

    impl SuspendLayer {
        fn of(kind: DeviceLayerKind) -> Self {
            Self {
                kind: Some(kind),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl DeviceLayer for SuspendLayer {
        fn name(&self) -> &str {
            "suspend"
        }
        fn kind(&self) -> DeviceLayerKind {
            self.kind.unwrap_or(DeviceLayerKind::Drbd)
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
        fn is_suspend_io_supported(&self) -> bool {
            self.kind() == DeviceLayerKind::Drbd
        }
        async fn suspend_io(&self, data: &mut RscLayerData) -> LayerResult<()> {
            if self.fail_suspend_of.as_deref() == Some(data.rsc_name.as_str()) {
                if self.fatal {
                    return Err(LayerError::access_denied("suspend"));
                }
                return Err(LayerError::storage("suspend failed").with_cause("device busy"));
            }
            self.calls.lock().push(format!("suspend {}", data.rsc_name));
            Ok(())
        }
        async fn resume_io(&self, data: &mut RscLayerData) -> LayerResult<()> {
            self.calls.lock().push(format!("resume {}", data.rsc_name));
            Ok(())
        }
        async fn manage_post_root_suspend(&self, data: &mut RscLayerData) -> LayerResult<()> {
            self.calls.lock().push(format!("post {}", data.rsc_name));
            Ok(())
        }
    }

    fn resource(name: &str, suspend: bool, suspended: bool) -> Resource {
        let mut root = RscLayerData::new(1, DeviceLayerKind::Drbd, name)
            .with_volume(VlmLayerData::new(VolumeNumber(0)))
            .with_child(
                RscLayerData::new(2, DeviceLayerKind::Storage, name)
                    .with_volume(VlmLayerData::new(VolumeNumber(0))),
            );
        if let Some(vlm) = root.volumes.get_mut(&VolumeNumber(0)) {
            vlm.exists = true;
        }
        root.should_suspend_io = suspend;
        root.suspended = Some(suspended);
        Resource::new(name, "n1", root)
    }

    fn setup(drbd: SuspendLayer) -> (SuspendManager, Arc<SuspendLayer>, Arc<SuspendLayer>) {
        let drbd = Arc::new(drbd);
        let storage = Arc::new(SuspendLayer::of(DeviceLayerKind::Storage));
        let registry = LayerRegistry::new()
            .with_layer(drbd.clone())
            .unwrap()
            .with_layer(storage.clone())
            .unwrap();
        (SuspendManager::new(registry), drbd, storage)
    }

    fn on_error(rsc: &Resource, err: &LayerError) -> ApiCallRc {
        ApiCallRc::singleton(
            RcEntry::new(rc::FAIL_UNKNOWN_ERROR, format!("{}: {}", rsc.name, err))
                .with_cause(err.texts().cause),
        )
    }

    #[tokio::test]
    async fn test_roots_before_post_root_hooks() {
        let (mgr, drbd, storage) = setup(SuspendLayer::of(DeviceLayerKind::Drbd));
        let mut a = resource("a", true, false);
        let mut b = resource("b", true, false);
        let mut rscs = vec![&mut a, &mut b];

        let failures = mgr.manage_suspend_io(&mut rscs, false, on_error).await.unwrap();

        assert!(failures.is_empty());
        assert_eq!(*drbd.calls.lock(), vec!["suspend a", "suspend b"]);
        assert_eq!(*storage.calls.lock(), vec!["post a", "post b"]);
        assert!(a.layer_data.is_suspended());
    }

    #[tokio::test]
    async fn test_resume_only_resumes() {
        let (mgr, drbd, _) = setup(SuspendLayer::of(DeviceLayerKind::Drbd));
        let mut a = resource("a", true, true);
        let mut rscs = vec![&mut a];

        mgr.manage_suspend_io(&mut rscs, true, on_error).await.unwrap();

        assert_eq!(*drbd.calls.lock(), vec!["resume a"]);
        assert!(!a.layer_data.is_suspended());
    }

    #[tokio::test]
    async fn test_matching_state_is_left_alone() {
        let (mgr, drbd, _) = setup(SuspendLayer::of(DeviceLayerKind::Drbd));
        let mut a = resource("a", false, false);
        let mut inactive = resource("i", true, false).with_flag(RscFlag::Inactive);
        let mut rscs = vec![&mut a, &mut inactive];

        mgr.manage_suspend_io(&mut rscs, false, on_error).await.unwrap();
        assert!(drbd.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_captured_per_resource() {
        let (mgr, drbd, _) = setup(SuspendLayer {
            fail_suspend_of: Some("a".to_string()),
            ..SuspendLayer::of(DeviceLayerKind::Drbd)
        });
        let mut a = resource("a", true, false);
        let mut b = resource("b", true, false);
        let mut rscs = vec![&mut a, &mut b];

        let failures = mgr.manage_suspend_io(&mut rscs, false, on_error).await.unwrap();

        assert_eq!(failures.len(), 1);
        let response = &failures[&ResourceName::from("a")];
        assert!(response.has_errors());
        assert_eq!(response.entries()[0].cause.as_deref(), Some("device busy"));
        assert_eq!(*drbd.calls.lock(), vec!["suspend b"]);
    }

    #[tokio::test]
    async fn test_fatal_failure_aborts() {
        let (mgr, _, _) = setup(SuspendLayer {
            fail_suspend_of: Some("a".to_string()),
            fatal: true,
            ..SuspendLayer::of(DeviceLayerKind::Drbd)
        });
        let mut a = resource("a", true, false);
        let mut rscs = vec![&mut a];

        let err = mgr.manage_suspend_io(&mut rscs, false, on_error).await.unwrap_err();
        assert!(matches!(err, DevMgrError::AccessDenied { .. }));
    }
}
