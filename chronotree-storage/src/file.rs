//! Single-file JSON document storage backend.
//!
//! Every operation is a load-modify-write cycle against one document on
//! disk, serialized with a `tokio::sync::Mutex` since concurrent writers
//! would race on the same file (per the engine's concurrency model, this
//! backend is not safe for concurrent writers; callers share one
//! instance and let the mutex serialize them).
//!
//! On open, a truncated or invalid document is quarantined alongside the
//! original path under a `.bak` suffix and a fresh empty document takes
//! its place — logged, not fatal.

use crate::adapter::StorageAdapter;
use crate::model::{DimensionValue, NodeRecord, Quality, TimePointMetadata, TimestampMillis, TreeRecord};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chronotree_error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

const BACKEND: &str = "file";

/// The on-disk shape, normative per the engine's document-file schema:
/// three top-level maps for trees, nodes, and time series.
#[derive(Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    trees: BTreeMap<String, TreeRecord>,
    #[serde(default)]
    nodes: BTreeMap<String, BTreeMap<String, NodeRecord>>,
    #[serde(default)]
    time_series: BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, StoredPoint>>>>,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredPoint {
    value: DimensionValue,
    metadata: TimePointMetadata,
}

/// Backend that persists all state as a single JSON document.
pub struct FileStore {
    path: Utf8PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Open (or lazily create, on first write) the document at `path`.
    pub fn new(path: impl AsRef<Utf8Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            lock: Mutex::new(()),
        }
    }

    fn storage_err(operation: &str, message: impl std::fmt::Display) -> EngineError {
        EngineError::storage(operation, BACKEND, message)
    }

    async fn read_document(&self) -> Result<Document> {
        if !self.path.exists() {
            return Ok(Document::default());
        }

        let bytes = tokio::fs::read(self.path.as_std_path())
            .await
            .map_err(|e| Self::storage_err("read", e))?;

        match serde_json::from_slice::<Document>(&bytes) {
            Ok(doc) => Ok(doc),
            Err(parse_err) => {
                tracing::warn!(
                    path = %self.path,
                    error = %parse_err,
                    "document store file is corrupt, quarantining and starting fresh"
                );
                let backup_path = format!("{}.bak", self.path);
                tokio::fs::rename(self.path.as_std_path(), &backup_path)
                    .await
                    .map_err(|e| Self::storage_err("quarantine", e))?;
                Ok(Document::default())
            }
        }
    }

    /// Write the document atomically: serialize to a sidecar file, then
    /// rename over the real path so a crash never leaves a torn file.
    async fn write_document(&self, doc: &Document) -> Result<()> {
        let payload =
            serde_json::to_vec_pretty(doc).map_err(|e| Self::storage_err("serialize", e))?;

        let sidecar = format!("{}.tmp", self.path);
        tokio::fs::write(&sidecar, &payload)
            .await
            .map_err(|e| Self::storage_err("write", e))?;
        tokio::fs::rename(&sidecar, self.path.as_std_path())
            .await
            .map_err(|e| Self::storage_err("write", e))?;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for FileStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn save_tree(&self, tree_id: &str, tree: &TreeRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document().await?;
        doc.trees.insert(tree_id.to_string(), tree.clone());
        self.write_document(&doc).await
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn load_tree(&self, tree_id: &str) -> Result<Option<TreeRecord>> {
        let _guard = self.lock.lock().await;
        let doc = self.read_document().await?;
        Ok(doc.trees.get(tree_id).cloned())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn delete_tree(&self, tree_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document().await?;
        doc.trees.remove(tree_id);
        doc.nodes.remove(tree_id);
        doc.time_series.remove(tree_id);
        self.write_document(&doc).await
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn save_node(&self, tree_id: &str, node_id: &str, node: &NodeRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document().await?;
        doc.nodes
            .entry(tree_id.to_string())
            .or_default()
            .insert(node_id.to_string(), node.clone());
        self.write_document(&doc).await
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn load_node(&self, tree_id: &str, node_id: &str) -> Result<Option<NodeRecord>> {
        let _guard = self.lock.lock().await;
        let doc = self.read_document().await?;
        Ok(doc
            .nodes
            .get(tree_id)
            .and_then(|nodes| nodes.get(node_id))
            .cloned())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn delete_node(&self, tree_id: &str, node_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document().await?;
        if let Some(nodes) = doc.nodes.get_mut(tree_id) {
            nodes.remove(node_id);
        }
        if let Some(tree_series) = doc.time_series.get_mut(tree_id) {
            tree_series.remove(node_id);
        }
        self.write_document(&doc).await
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
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document().await?;
        let metadata = TimePointMetadata::new(quality, unit, timestamp);
        doc.time_series
            .entry(tree_id.to_string())
            .or_default()
            .entry(node_id.to_string())
            .or_default()
            .entry(dimension.to_string())
            .or_default()
            .insert(timestamp.to_string(), StoredPoint { value, metadata });
        self.write_document(&doc).await
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
        let _guard = self.lock.lock().await;
        let doc = self.read_document().await?;
        let Some(series) = doc
            .time_series
            .get(tree_id)
            .and_then(|t| t.get(node_id))
            .and_then(|n| n.get(dimension))
        else {
            return Ok(Vec::new());
        };

        let lower = start.unwrap_or(TimestampMillis::MIN);
        let upper = end.unwrap_or(TimestampMillis::MAX);

        let mut points: Vec<(TimestampMillis, DimensionValue, TimePointMetadata)> = series
            .iter()
            .filter_map(|(ts_str, point)| {
                let ts: TimestampMillis = ts_str.parse().ok()?;
                (ts >= lower && ts <= upper).then(|| (ts, point.value.clone(), point.metadata.clone()))
            })
            .collect();
        points.sort_by_key(|(ts, _, _)| *ts);

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
        let points = self
            .get_time_points(tree_id, node_id, dimension, None, before, None)
            .await?;
        Ok(points.into_iter().last())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn delete_time_points(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        before: Option<TimestampMillis>,
    ) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document().await?;
        let Some(series) = doc
            .time_series
            .get_mut(tree_id)
            .and_then(|t| t.get_mut(node_id))
            .and_then(|n| n.get_mut(dimension))
        else {
            return Ok(0);
        };

        let upper = before.unwrap_or(TimestampMillis::MAX);
        let to_remove: Vec<String> = series
            .keys()
            .filter(|ts_str| ts_str.parse::<TimestampMillis>().map(|ts| ts < upper).unwrap_or(false))
            .cloned()
            .collect();
        for key in &to_remove {
            series.remove(key);
        }
        let removed = to_remove.len();
        self.write_document(&doc).await?;
        Ok(removed)
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn get_dimensions(&self, tree_id: &str, node_id: Option<&str>) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let doc = self.read_document().await?;
        let Some(tree_series) = doc.time_series.get(tree_id) else {
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
        let points = self
            .get_time_points(tree_id, node_id, dimension, None, None, None)
            .await?;
        match (points.first(), points.last()) {
            (Some((min, _, _)), Some((max, _, _))) => Ok(Some((*min, *max))),
            _ => Ok(None),
        }
    }
}
