//! Device manager configuration.

use crate::error::{DevMgrError, DevMgrResult};
use serde::Deserialize;
use std::time::Duration;

/// Configuration for the device manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceManagerConfig {
    /// Name used in logs and audit records
    pub instance_name: String,
    /// Skip dispatching until replication state tracking is available
    pub require_replication_state: bool,
    /// Back-off while replication state is unavailable, in milliseconds
    pub state_unavailable_backoff_ms: u64,
    /// Default timeout for `await_shutdown_default`, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        Self {
            instance_name: "DeviceManager".to_string(),
            require_replication_state: false,
            state_unavailable_backoff_ms: 500,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl DeviceManagerConfig {
    /// Parses a configuration from JSON. Missing fields take their default.
    pub fn from_json(json: &str) -> DevMgrResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DevMgrError::config(e.to_string()))?;
        if config.instance_name.is_empty() {
            return Err(DevMgrError::config("instance_name must not be empty"));
        }
        Ok(config)
    }

    pub fn state_unavailable_backoff(&self) -> Duration {
        Duration::from_millis(self.state_unavailable_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
