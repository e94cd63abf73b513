//! A node in the tree: an address, a set of tags, and a set of
//! timelines indexed by dimension, plus lifecycle flags.

use crate::address::Address;
use crate::dimension::DimensionRegistry;
use crate::timeline::{Timeline, DEFAULT_CAPACITY};
use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use chronotree_error::{EngineError, Result};
use chronotree_storage::{DimensionValue, Quality, StorageAdapter, TimePoint};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// One node's data: timelines indexed by dimension name, lifecycle
/// flags, and structural links by id (resolved through the owning
/// repository's node-id index rather than direct references, so the
/// tree never forms a reference cycle).
pub struct Node {
    pub node_id: String,
    pub name: String,
    pub address: Address,
    pub tags: BTreeSet<String>,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_active: bool,

    timelines: HashMap<String, Timeline>,
    registry: Arc<DimensionRegistry>,
    store: Option<(Arc<dyn StorageAdapter>, String)>,
}

impl Node {
    pub fn new(node_id: impl Into<String>, name: impl Into<String>, address: Address, registry: Arc<DimensionRegistry>) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            address,
            tags: BTreeSet::new(),
            parent_id: None,
            children: Vec::new(),
            created_at: Utc::now(),
            deleted_at: None,
            is_active: true,
            timelines: HashMap::new(),
            registry,
            store: None,
        }
    }

    /// `address.depth()`, i.e. `address.segments().len() - 1`.
    pub fn depth(&self) -> usize {
        self.address.depth()
    }

    /// Attach a storage adapter: timelines created from now on (and
    /// any already held) write through to it under `tree_id`.
    pub fn attach_store(&mut self, store: Arc<dyn StorageAdapter>, tree_id: impl Into<String>) {
        let tree_id = tree_id.into();
        for timeline in self.timelines.values_mut() {
            timeline.attach_store(store.clone(), tree_id.clone());
        }
        self.store = Some((store, tree_id));
    }

    fn timeline_mut(&mut self, dimension: &str) -> &mut Timeline {
        let store = self.store.clone();
        let node_id = self.node_id.clone();
        self.timelines.entry(dimension.to_string()).or_insert_with(|| {
            let mut timeline = Timeline::new(node_id, dimension.to_string(), DEFAULT_CAPACITY);
            if let Some((store, tree_id)) = store {
                timeline.attach_store(store, tree_id);
            }
            timeline
        })
    }

    /// Borrow an existing timeline for `dimension`, without creating one.
    pub fn timeline(&self, dimension: &str) -> Option<&Timeline> {
        self.timelines.get(dimension)
    }

    /// Get-or-create a timeline for `dimension`, for reconstructing a
    /// node loaded from storage (hydrating its serialized cache).
    pub fn timeline_for_hydration(&mut self, dimension: &str) -> &mut Timeline {
        self.timeline_mut(dimension)
    }

    pub fn dimensions_with_data(&self) -> Vec<String> {
        self.timelines.keys().cloned().collect()
    }

    /// Write a value to `dim` at `ts` (defaulting to now), validated
    /// against the registry if `dim` is registered. Unregistered
    /// dimensions are accepted with only structural checks. Fails
    /// `NODE_INACTIVE` on a soft-deleted node, `DIMENSION_DERIVED` for
    /// a derived dimension.
    #[tracing::instrument(skip(self, value, quality, unit), fields(node_id = %self.node_id))]
    pub async fn set_data(
        &mut self,
        dim: &str,
        value: DimensionValue,
        ts: Option<i64>,
        quality: Option<Quality>,
        unit: Option<String>,
    ) -> Result<()> {
        if !self.is_active {
            return Err(EngineError::NodeInactive {
                node_id: self.node_id.clone(),
            });
        }

        if let Some(descriptor) = self.registry.get(dim) {
            if descriptor.is_derived {
                return Err(EngineError::DimensionDerived { name: dim.to_string() });
            }
            if !descriptor.validate(&value) {
                return Err(EngineError::Validation {
                    message: format!("value for dimension '{dim}' is out of domain"),
                });
            }
        }

        let ts = ts.unwrap_or_else(|| Utc::now().timestamp_millis());
        let quality = quality.unwrap_or_default();

        self.timeline_mut(dim).add_time_point(ts, value, quality, unit).await
    }

    /// Read `dim` at `ts` (latest, if `None`). Derived dimensions
    /// recursively resolve their inputs at the same timestamp and
    /// return `None` if any input is missing. Stored dimensions fall
    /// back to the nearest point within `tolerance` millis when the
    /// exact timestamp has no entry.
    #[tracing::instrument(skip(self), fields(node_id = %self.node_id))]
    #[async_recursion]
    pub async fn get_data(&mut self, dim: &str, ts: Option<i64>, tolerance: Option<i64>) -> Result<Option<DimensionValue>> {
        // Clone the registry handle so resolving derived inputs (which
        // recurses into `&mut self`) never holds a borrow of `self`.
        let registry = self.registry.clone();
        if let Some(descriptor) = registry.get(dim) {
            if let Some((inputs, _)) = &descriptor.derivation {
                let mut resolved = Vec::with_capacity(inputs.len());
                for input in inputs {
                    let value = self.get_data(input, ts, tolerance).await?;
                    resolved.push(value.and_then(|v| v.as_number()));
                }
                return Ok(descriptor.derive(&resolved).map(DimensionValue::Number));
            }
        }

        let Some(timeline) = self.timelines.get_mut(dim) else {
            return Ok(None);
        };

        if let Some(ts) = ts {
            if let Some(point) = timeline.get_time_point(ts).await? {
                return Ok(Some(point.value));
            }
            if let Some(tolerance) = tolerance {
                let window = timeline.get_time_range(Some(ts - tolerance), Some(ts + tolerance), None).await?;
                let nearest = window.into_iter().min_by_key(|p: &TimePoint| (p.timestamp - ts).abs());
                return Ok(nearest.map(|p| p.value));
            }
            return Ok(None);
        }

        Ok(timeline.get_latest(None).await?.map(|p| p.value))
    }

    /// Range query; delegates to the timeline. An unknown (never
    /// written) dimension returns an empty list.
    pub async fn get_time_series(&mut self, dim: &str, start: Option<i64>, end: Option<i64>, limit: Option<usize>) -> Result<Vec<TimePoint>> {
        let Some(timeline) = self.timelines.get_mut(dim) else {
            return Ok(Vec::new());
        };
        timeline.get_time_range(start, end, limit).await
    }

    /// Drop points before `before` (or all); if the dimension's
    /// timeline is left empty, drop the timeline entry too.
    pub async fn delete_dimension_data(&mut self, dim: &str, before: Option<i64>) -> Result<usize> {
        let Some(timeline) = self.timelines.get_mut(dim) else {
            return Ok(0);
        };
        let removed = timeline.delete_before(before).await?;
        if timeline.is_empty() {
            self.timelines.remove(dim);
        }
        Ok(removed)
    }

    pub fn add_child(&mut self, child_id: impl Into<String>) {
        let child_id = child_id.into();
        if !self.children.contains(&child_id) {
            self.children.push(child_id);
        }
    }

    pub fn remove_child(&mut self, child_id: &str) {
        self.children.retain(|id| id != child_id);
    }

    /// `deleted_at = ts ?? now`, `is_active = false`. Terminal: a node
    /// already inactive stays inactive (the timestamp is not moved).
    pub fn soft_delete(&mut self, ts: Option<DateTime<Utc>>) {
        if self.deleted_at.is_some() {
            return;
        }
        self.deleted_at = Some(ts.unwrap_or_else(Utc::now));
        self.is_active = false;
        tracing::info!(node_id = %self.node_id, "node soft-deleted");
    }

    /// True iff `created_at <= ts < deleted_at` (or `created_at <= ts`
    /// when never deleted).
    pub fn is_alive_at(&self, ts: DateTime<Utc>) -> bool {
        self.created_at <= ts && self.deleted_at.map(|d| ts < d).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DEFAULT_SEG_MAX;

    fn test_node() -> Node {
        let address = Address::parse("10.0.0.0", DEFAULT_SEG_MAX).unwrap();
        Node::new("n1", "beijing", address, Arc::new(DimensionRegistry::with_builtins()))
    }

    #[tokio::test]
    async fn writes_and_reads_exact_and_latest() {
        let mut node = test_node();
        node.set_data("metered", DimensionValue::Number(1500.0), Some(1), None, None)
            .await
            .unwrap();
        node.set_data("metered", DimensionValue::Number(1600.0), Some(2), None, None)
            .await
            .unwrap();

        assert_eq!(
            node.get_data("metered", None, None).await.unwrap().unwrap().as_number(),
            Some(1600.0)
        );
        assert_eq!(
            node.get_data("metered", Some(1), None).await.unwrap().unwrap().as_number(),
            Some(1500.0)
        );
    }

    #[tokio::test]
    async fn derived_dimension_cannot_be_written() {
        let mut node = test_node();
        let err = node
            .set_data("loss_rate", DimensionValue::Number(0.1), Some(1), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DIMENSION_DERIVED");
    }

    #[tokio::test]
    async fn derived_dimension_reads_through_inputs() {
        let mut node = test_node();
        node.set_data("reference", DimensionValue::Number(2000.0), Some(1), None, None)
            .await
            .unwrap();
        node.set_data("metered", DimensionValue::Number(1900.0), Some(1), None, None)
            .await
            .unwrap();

        let value = node.get_data("loss_rate", Some(1), None).await.unwrap().unwrap();
        assert!((value.as_number().unwrap() - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn inactive_node_rejects_writes_but_allows_reads() {
        let mut node = test_node();
        node.set_data("metered", DimensionValue::Number(1.0), Some(1), None, None)
            .await
            .unwrap();
        node.soft_delete(None);

        let err = node
            .set_data("metered", DimensionValue::Number(2.0), Some(2), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NODE_INACTIVE");

        assert!(node.get_data("metered", Some(1), None).await.unwrap().is_some());
    }
}
