//! In-process, in-memory storage backend.
//!
//! Lifetime is equal to the process. Concurrent reads of disjoint keys
//! are safe; all access is guarded by a single `RwLock` over the whole
//! state, which is sufficient given the single-writer-per-store model.

use crate::adapter::StorageAdapter;
use crate::model::{DimensionValue, NodeRecord, Quality, TimePointMetadata, TimestampMillis, TreeRecord};
use async_trait::async_trait;
use chronotree_error::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

type DimensionSeries = BTreeMap<TimestampMillis, (DimensionValue, TimePointMetadata)>;

#[derive(Default)]
struct State {
    trees: HashMap<String, TreeRecord>,
    nodes: HashMap<String, HashMap<String, NodeRecord>>,
    time_series: HashMap<String, HashMap<String, HashMap<String, DimensionSeries>>>,
}

/// Backend that satisfies the storage contract with plain in-process maps.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn save_tree(&self, tree_id: &str, tree: &TreeRecord) -> Result<()> {
        self.state.write().trees.insert(tree_id.to_string(), tree.clone());
        Ok(())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn load_tree(&self, tree_id: &str) -> Result<Option<TreeRecord>> {
        Ok(self.state.read().trees.get(tree_id).cloned())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn delete_tree(&self, tree_id: &str) -> Result<()> {
        let mut state = self.state.write();
        state.trees.remove(tree_id);
        state.nodes.remove(tree_id);
        state.time_series.remove(tree_id);
        Ok(())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn save_node(&self, tree_id: &str, node_id: &str, node: &NodeRecord) -> Result<()> {
        self.state
            .write()
            .nodes
            .entry(tree_id.to_string())
            .or_default()
            .insert(node_id.to_string(), node.clone());
        Ok(())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn load_node(&self, tree_id: &str, node_id: &str) -> Result<Option<NodeRecord>> {
        Ok(self
            .state
            .read()
            .nodes
            .get(tree_id)
            .and_then(|nodes| nodes.get(node_id))
            .cloned())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn delete_node(&self, tree_id: &str, node_id: &str) -> Result<()> {
        let mut state = self.state.write();
        if let Some(nodes) = state.nodes.get_mut(tree_id) {
            nodes.remove(node_id);
        }
        if let Some(tree_series) = state.time_series.get_mut(tree_id) {
            tree_series.remove(node_id);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn save_time_point(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        timestamp: TimestampMillis,
        value: DimensionValue,
        quality: Quality,
        unit: Option<String>,
    ) -> Result<()> {
        let created_at = timestamp;
        let metadata = TimePointMetadata::new(quality, unit, created_at);
        self.state
            .write()
            .time_series
            .entry(tree_id.to_string())
            .or_default()
            .entry(node_id.to_string())
            .or_default()
            .entry(dimension.to_string())
            .or_default()
            .insert(timestamp, (value, metadata));
        Ok(())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn get_time_points(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        start: Option<TimestampMillis>,
        end: Option<TimestampMillis>,
        limit: Option<usize>,
    ) -> Result<Vec<(TimestampMillis, DimensionValue, TimePointMetadata)>> {
        let state = self.state.read();
        let Some(series) = state
            .time_series
            .get(tree_id)
            .and_then(|t| t.get(node_id))
            .and_then(|n| n.get(dimension))
        else {
            return Ok(Vec::new());
        };

        let lower = start.unwrap_or(TimestampMillis::MIN);
        let upper = end.unwrap_or(TimestampMillis::MAX);

        let mut points: Vec<_> = series
            .range(lower..=upper)
            .map(|(ts, (value, meta))| (*ts, value.clone(), meta.clone()))
            .collect();

        if let Some(limit) = limit {
            points.truncate(limit);
        }

        Ok(points)
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn get_latest_time_point(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        before: Option<TimestampMillis>,
    ) -> Result<Option<(TimestampMillis, DimensionValue, TimePointMetadata)>> {
        let state = self.state.read();
        let Some(series) = state
            .time_series
            .get(tree_id)
            .and_then(|t| t.get(node_id))
            .and_then(|n| n.get(dimension))
        else {
            return Ok(None);
        };

        let upper = before.unwrap_or(TimestampMillis::MAX);
        Ok(series
            .range(..=upper)
            .next_back()
            .map(|(ts, (value, meta))| (*ts, value.clone(), meta.clone())))
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn delete_time_points(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        before: Option<TimestampMillis>,
    ) -> Result<usize> {
        let mut state = self.state.write();
        let Some(series) = state
            .time_series
            .get_mut(tree_id)
            .and_then(|t| t.get_mut(node_id))
            .and_then(|n| n.get_mut(dimension))
        else {
            return Ok(0);
        };

        let before = before.unwrap_or(TimestampMillis::MAX);
        let to_remove: Vec<TimestampMillis> = series.range(..before).map(|(ts, _)| *ts).collect();
        for ts in &to_remove {
            series.remove(ts);
        }
        Ok(to_remove.len())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn get_dimensions(&self, tree_id: &str, node_id: Option<&str>) -> Result<Vec<String>> {
        let state = self.state.read();
        let Some(tree_series) = state.time_series.get(tree_id) else {
            return Ok(Vec::new());
        };

        let mut names: Vec<String> = match node_id {
            Some(node_id) => tree_series
                .get(node_id)
                .map(|dims| dims.keys().cloned().collect())
                .unwrap_or_default(),
            None => {
                let mut set = std::collections::BTreeSet::new();
                for dims in tree_series.values() {
                    set.extend(dims.keys().cloned());
                }
                set.into_iter().collect()
            }
        };
        names.sort();
        Ok(names)
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn get_time_range(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
    ) -> Result<Option<(TimestampMillis, TimestampMillis)>> {
        let state = self.state.read();
        let Some(series) = state
            .time_series
            .get(tree_id)
            .and_then(|t| t.get(node_id))
            .and_then(|n| n.get(dimension))
        else {
            return Ok(None);
        };

        let min = series.keys().next().copied();
        let max = series.keys().next_back().copied();
        match (min, max) {
            (Some(min), Some(max)) => Ok(Some((min, max))),
            _ => Ok(None),
        }
    }
}
