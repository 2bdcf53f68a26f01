//! Names and composite keys of satellite objects.
//!
//! All names are plain ordered string newtypes so they can be used as keys of
//! the `BTreeMap`s that make up the object graph and the pending bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new name.
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// Returns the name as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self(name.to_string())
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(name)
            }
        }
    };
}

name_type!(
    /// Name of a cluster node.
    NodeName
);
name_type!(
    /// Name of a resource definition (and of its per-node resources).
    ResourceName
);
name_type!(
    /// Name of a snapshot definition.
    SnapshotName
);
name_type!(
    /// Name of a storage pool.
    StorPoolName
);

/// Number of a volume within a resource definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeNumber(pub u32);

impl fmt::Display for VolumeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one resource: a resource definition deployed on a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub node_name: NodeName,
    pub rsc_name: ResourceName,
}

impl ResourceKey {
    pub fn new(node_name: impl Into<NodeName>, rsc_name: impl Into<ResourceName>) -> Self {
        Self {
            node_name: node_name.into(),
            rsc_name: rsc_name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on node {}", self.rsc_name, self.node_name)
    }
}

/// Identifies a snapshot definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub rsc_name: ResourceName,
    pub snapshot_name: SnapshotName,
}

impl SnapshotKey {
    pub fn new(rsc_name: impl Into<ResourceName>, snapshot_name: impl Into<SnapshotName>) -> Self {
        Self {
            rsc_name: rsc_name.into(),
            snapshot_name: snapshot_name.into(),
        }
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rsc_name, self.snapshot_name)
    }
}

/// Identifies a volume definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeKey {
    pub rsc_name: ResourceName,
    pub vlm_nr: VolumeNumber,
}

impl VolumeKey {
    pub fn new(rsc_name: impl Into<ResourceName>, vlm_nr: VolumeNumber) -> Self {
        Self {
            rsc_name: rsc_name.into(),
            vlm_nr,
        }
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rsc_name, self.vlm_nr)
    }
}
