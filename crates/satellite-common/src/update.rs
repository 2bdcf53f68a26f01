//! Update notifications and update bundles.
//!
//! An [`UpdateBundle`] records, per object class, which objects changed on
//! the controller side (by key and UUID) together with the response sinks of
//! the requests that caused the change. The device manager keeps several
//! bundles: notifications collected by the tracker, updates that still have
//! to be requested, and updates that were requested but not yet received.

use crate::identifiers::{NodeName, ResourceKey, SnapshotKey, StorPoolName};
use crate::response::ResponseSink;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A changed object's UUID plus the sinks waiting for its outcome.
#[derive(Debug, Clone)]
pub struct UpdateNotification {
    uuid: Uuid,
    response_sinks: Vec<ResponseSink>,
}

impl UpdateNotification {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            response_sinks: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn response_sinks(&self) -> &[ResponseSink] {
        &self.response_sinks
    }

    pub fn add_response_sink(&mut self, sink: ResponseSink) {
        self.response_sinks.push(sink);
    }

    /// Merges a newer notification of the same object into this one.
    ///
    /// The newer UUID wins; the sinks of both are kept.
    pub fn merge(&mut self, newer: UpdateNotification) {
        self.uuid = newer.uuid;
        self.response_sinks.extend(newer.response_sinks);
    }
}

/// Pending updates per object class.
#[derive(Debug, Clone, Default)]
pub struct UpdateBundle {
    pub controller_update: Option<UpdateNotification>,
    pub node_updates: BTreeMap<NodeName, UpdateNotification>,
    pub rsc_updates: BTreeMap<ResourceKey, UpdateNotification>,
    pub stor_pool_updates: BTreeMap<StorPoolName, UpdateNotification>,
    pub snapshot_updates: BTreeMap<SnapshotKey, UpdateNotification>,
}

impl UpdateBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.controller_update.is_none()
            && self.node_updates.is_empty()
            && self.rsc_updates.is_empty()
            && self.stor_pool_updates.is_empty()
            && self.snapshot_updates.is_empty()
    }

    pub fn clear(&mut self) {
        self.controller_update = None;
        self.node_updates.clear();
        self.rsc_updates.clear();
        self.stor_pool_updates.clear();
        self.snapshot_updates.clear();
    }

    /// Number of objects recorded in this bundle.
    pub fn len(&self) -> usize {
        usize::from(self.controller_update.is_some())
            + self.node_updates.len()
            + self.rsc_updates.len()
            + self.stor_pool_updates.len()
            + self.snapshot_updates.len()
    }

    /// Copies every update request of this bundle into `other`.
    ///
    /// An object already present in `other` stays there exactly once; the
    /// notifications are merged.
    pub fn copy_update_requests_to(&self, other: &mut UpdateBundle) {
        if let Some(ctrl) = &self.controller_update {
            merge_optional(&mut other.controller_update, ctrl.clone());
        }
        copy_map(&self.node_updates, &mut other.node_updates);
        copy_map(&self.rsc_updates, &mut other.rsc_updates);
        copy_map(&self.stor_pool_updates, &mut other.stor_pool_updates);
        copy_map(&self.snapshot_updates, &mut other.snapshot_updates);
    }

    /// Moves every update of this bundle into `other`, leaving this bundle
    /// empty.
    pub fn move_into(&mut self, other: &mut UpdateBundle) {
        if let Some(ctrl) = self.controller_update.take() {
            merge_optional(&mut other.controller_update, ctrl);
        }
        move_map(&mut self.node_updates, &mut other.node_updates);
        move_map(&mut self.rsc_updates, &mut other.rsc_updates);
        move_map(&mut self.stor_pool_updates, &mut other.stor_pool_updates);
        move_map(&mut self.snapshot_updates, &mut other.snapshot_updates);
    }
}

fn merge_optional(target: &mut Option<UpdateNotification>, notification: UpdateNotification) {
    match target {
        Some(existing) => existing.merge(notification),
        None => *target = Some(notification),
    }
}

fn copy_map<K: Ord + Clone>(
    source: &BTreeMap<K, UpdateNotification>,
    target: &mut BTreeMap<K, UpdateNotification>,
) {
    for (key, notification) in source {
        match target.get_mut(key) {
            Some(existing) => existing.merge(notification.clone()),
            None => {
                target.insert(key.clone(), notification.clone());
            }
        }
    }
}

fn move_map<K: Ord>(
    source: &mut BTreeMap<K, UpdateNotification>,
    target: &mut BTreeMap<K, UpdateNotification>,
) {
    for (key, notification) in std::mem::take(source) {
        match target.get_mut(&key) {
            Some(existing) => existing.merge(notification),
            None => {
                target.insert(key, notification);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::response_channel;
    use pretty_assertions::assert_eq;

    fn bundle_with_rsc(node: &str, rsc: &str) -> UpdateBundle {
        let mut bundle = UpdateBundle::new();
        bundle
            .rsc_updates
            .insert(ResourceKey::new(node, rsc), UpdateNotification::new(Uuid::new_v4()));
        bundle
    }

    #[test]
    fn test_empty_and_clear() {
        let mut bundle = UpdateBundle::new();
        assert!(bundle.is_empty());

        bundle.controller_update = Some(UpdateNotification::new(Uuid::nil()));
        bundle
            .node_updates
            .insert(NodeName::from("n1"), UpdateNotification::new(Uuid::new_v4()));
        assert!(!bundle.is_empty());
        assert_eq!(bundle.len(), 2);

        bundle.clear();
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_copy_keeps_each_object_once() {
        let source = bundle_with_rsc("n1", "r1");
        let mut target = bundle_with_rsc("n1", "r1");
        target
            .stor_pool_updates
            .insert(StorPoolName::from("pool"), UpdateNotification::new(Uuid::new_v4()));

        source.copy_update_requests_to(&mut target);

        assert_eq!(target.rsc_updates.len(), 1);
        assert_eq!(target.len(), 2);
        let key = ResourceKey::new("n1", "r1");
        assert_eq!(
            target.rsc_updates[&key].uuid(),
            source.rsc_updates[&key].uuid()
        );
        // source is untouched by a copy
        assert_eq!(source.len(), 1);
    }

    #[test]
    fn test_move_merges_sinks() {
        let (sink_a, _stream_a) = response_channel();
        let (sink_b, _stream_b) = response_channel();

        let mut source = UpdateBundle::new();
        let mut first = UpdateNotification::new(Uuid::new_v4());
        first.add_response_sink(sink_a);
        source
            .snapshot_updates
            .insert(SnapshotKey::new("r1", "s1"), first);

        let mut target = UpdateBundle::new();
        let mut second = UpdateNotification::new(Uuid::new_v4());
        second.add_response_sink(sink_b);
        target
            .snapshot_updates
            .insert(SnapshotKey::new("r1", "s1"), second);

        source.move_into(&mut target);

        assert!(source.is_empty());
        let merged = &target.snapshot_updates[&SnapshotKey::new("r1", "s1")];
        assert_eq!(merged.response_sinks().len(), 2);
    }

    #[test]
    fn test_controller_update_copied() {
        let mut source = UpdateBundle::new();
        source.controller_update = Some(UpdateNotification::new(Uuid::nil()));
        let mut target = UpdateBundle::new();
        source.copy_update_requests_to(&mut target);
        assert!(target.controller_update.is_some());
    }
}
