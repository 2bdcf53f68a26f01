//! State flags of satellite objects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Flags of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RscFlag {
    /// The resource is to be removed from this node
    Delete,
    /// The resource is deployed but deactivated
    Inactive,
    /// The resource is being deactivated
    Inactivating,
}

/// Flags of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VlmFlag {
    Delete,
}

/// Flags of a volume definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VlmDfnFlag {
    /// Volume data is encrypted; processing needs the master key
    Encrypted,
}

/// Flags of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotFlag {
    Delete,
}

/// Set of flags of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFlags<F: Ord> {
    flags: BTreeSet<F>,
}

impl<F: Ord> Default for StateFlags<F> {
    fn default() -> Self {
        Self {
            flags: BTreeSet::new(),
        }
    }
}

impl<F: Ord + Copy> StateFlags<F> {
    /// Creates an empty flag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a flag set with the given flags enabled.
    pub fn with(flags: &[F]) -> Self {
        Self {
            flags: flags.iter().copied().collect(),
        }
    }

    pub fn is_set(&self, flag: F) -> bool {
        self.flags.contains(&flag)
    }

    pub fn is_unset(&self, flag: F) -> bool {
        !self.is_set(flag)
    }

    /// Returns true if any of the given flags is set.
    pub fn is_some_set(&self, flags: &[F]) -> bool {
        flags.iter().any(|flag| self.flags.contains(flag))
    }

    pub fn enable(&mut self, flag: F) {
        self.flags.insert(flag);
    }

    pub fn disable(&mut self, flag: F) {
        self.flags.remove(&flag);
    }

    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        self.flags.iter().copied()
    }
}
