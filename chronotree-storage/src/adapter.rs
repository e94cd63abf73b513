//! The uniform storage contract every backend must satisfy.

use crate::model::{DimensionValue, NodeRecord, Quality, TimePointMetadata, TimestampMillis, TreeRecord};
use async_trait::async_trait;
use chronotree_error::Result;

/// Tree/node/time-point persistence, plus discovery, behind one
/// backend-agnostic contract. Every method returns a typed
/// `EngineError`; backend-specific failures are wrapped as
/// `EngineError::Storage` carrying the `operation` and `backend` tags.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// A short, stable tag identifying this backend (`"memory"`,
    /// `"file"`, `"sql"`), used in wrapped storage errors.
    fn backend_name(&self) -> &'static str;

    // -- tree operations ---------------------------------------------

    async fn save_tree(&self, tree_id: &str, tree: &TreeRecord) -> Result<()>;

    async fn load_tree(&self, tree_id: &str) -> Result<Option<TreeRecord>>;

    /// Cascades to every node and time point belonging to this tree.
    async fn delete_tree(&self, tree_id: &str) -> Result<()>;

    // -- node operations -----------------------------------------------

    async fn save_node(&self, tree_id: &str, node_id: &str, node: &NodeRecord) -> Result<()>;

    async fn load_node(&self, tree_id: &str, node_id: &str) -> Result<Option<NodeRecord>>;

    async fn delete_node(&self, tree_id: &str, node_id: &str) -> Result<()>;

    // -- time-point operations (the hot path) --------------------------

    /// Upsert on `(tree_id, node_id, dimension, timestamp)`.
    #[allow(clippy::too_many_arguments)]
    async fn save_time_point(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        timestamp: TimestampMillis,
        value: DimensionValue,
        quality: Quality,
        unit: Option<String>,
    ) -> Result<()>;

    /// Inclusive bounds, ascending order by timestamp.
    async fn get_time_points(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        start: Option<TimestampMillis>,
        end: Option<TimestampMillis>,
        limit: Option<usize>,
    ) -> Result<Vec<(TimestampMillis, DimensionValue, TimePointMetadata)>>;

    /// The newest point with `ts <= before`, or the newest overall when
    /// `before` is `None`.
    async fn get_latest_time_point(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        before: Option<TimestampMillis>,
    ) -> Result<Option<(TimestampMillis, DimensionValue, TimePointMetadata)>>;

    /// Deletes points with `ts < before` (or all, when `before` is
    /// `None`). Returns the count deleted.
    async fn delete_time_points(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        before: Option<TimestampMillis>,
    ) -> Result<usize>;

    // -- discovery ------------------------------------------------------

    /// Dimension names observed for a tree (or a specific node within
    /// it). Discovered from stored data, not from any registration.
    async fn get_dimensions(&self, tree_id: &str, node_id: Option<&str>) -> Result<Vec<String>>;

    /// `(min_ts, max_ts)` observed for `(tree_id, node_id, dimension)`,
    /// or `None` if no points are stored.
    async fn get_time_range(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
    ) -> Result<Option<(TimestampMillis, TimestampMillis)>>;
}
