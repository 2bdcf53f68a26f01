//! Error types of the device manager.

use satellite_common::{LayerError, LayerTreeError};
use thiserror::Error;

/// Result type alias for device manager operations.
pub type DevMgrResult<T> = Result<T, DevMgrError>;

/// Errors that can occur in the device manager.
#[derive(Debug, Error)]
pub enum DevMgrError {
    /// A broken invariant, e.g. a cyclic resource relation.
    #[error("Implementation error: {message}")]
    Implementation {
        /// Error message.
        message: String,
    },

    /// The device manager was denied access to an object it must be
    /// allowed to access.
    #[error("Access denied: {message}")]
    AccessDenied {
        /// Error message.
        message: String,
    },

    /// The current wait or cycle was interrupted (shutdown, lost
    /// connection, state change). Not reported to anyone.
    #[error("Service condition changed")]
    ServiceCondition,

    /// A layer call failed in a way that cannot be attributed to a single
    /// resource.
    #[error("Layer failure: {source}")]
    Layer {
        #[source]
        source: LayerError,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    Config {
        /// Error message.
        message: String,
    },
}

impl DevMgrError {
    /// Creates an implementation error.
    pub fn implementation(message: impl Into<String>) -> Self {
        Self::Implementation {
            message: message.into(),
        }
    }

    /// Creates an access denied error.
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true for the control-flow signal that only ends a wait.
    pub fn is_service_condition(&self) -> bool {
        matches!(self, Self::ServiceCondition)
    }
}

impl From<LayerError> for DevMgrError {
    fn from(source: LayerError) -> Self {
        match source {
            LayerError::AccessDenied { message } => Self::AccessDenied { message },
            other => Self::Layer { source: other },
        }
    }
}

impl From<LayerTreeError> for DevMgrError {
    fn from(err: LayerTreeError) -> Self {
        Self::implementation(err.to_string())
    }
}
