//! Device manager of the satellite.
//!
//! The device manager keeps the storage devices of this node in line with
//! the resources the controller assigned to it:
//!
//! - [`DeviceManager`]: the reconciliation loop and its callbacks
//! - [`UpdateTracker`]: ingress for the controller's update notifications
//! - [`LayeredDeviceHandler`]: runs resources through their device layers
//! - [`LayerRegistry`]: the device layers known to the handler
//!
//! # Architecture
//!
//! 1. The controller announces changed objects through the [`UpdateTracker`]
//! 2. The loop requests them through an `UpdateRequester`
//! 3. The caller applies the received data and reports it via the
//!    `*_update_applied` callbacks
//! 4. The loop dispatches the affected resources while holding the object
//!    graph for writing; stacked resources are processed in dependency order
//! 5. Every requester receives its responses and the stream is completed
//!
//! # Example
//!
//! ```ignore
//! use satellite_devmgr::{DeviceManager, DeviceManagerConfig, DeviceManagerDeps};
//!
//! let dm = DeviceManager::new(DeviceManagerConfig::default(), deps);
//! dm.start();
//! dm.full_sync_applied(&local_node).await?;
//!
//! let mut responses = dm.update_tracker().update_resource(uuid, rsc_name, node_name);
//! while let Some(rc) = responses.recv().await {
//!     println!("{:?}", rc);
//! }
//!
//! dm.shutdown();
//! dm.await_shutdown_default().await;
//! ```

pub mod audit;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod reporter;
pub mod sched;
pub mod sizes;
pub mod suspend;
pub mod sync_point;
pub mod tracker;
pub mod traverse;

pub use audit::{AuditCategory, AuditOutcome, AuditRecord};
pub use cleanup::{deleted_objects_cleanup, CleanupSummary};
pub use config::DeviceManagerConfig;
pub use error::{DevMgrError, DevMgrResult};
pub use handler::{DeviceHandler, DispatchSet, LayeredDeviceHandler};
pub use listener::{DispatchListener, NotificationListener};
pub use manager::{DeviceManager, DeviceManagerDeps, ReadOnlyData};
pub use monitor::UpdateMonitor;
pub use registry::LayerRegistry;
pub use reporter::ErrorReporter;
pub use sync_point::SyncPoint;
pub use tracker::UpdateTracker;
pub use traverse::{plan_waves, BottomUp, ResourceIndex, TopDown, TraverseOrder, Wave};
