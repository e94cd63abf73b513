//! Per-(node, dimension) time series: a bounded LRU cache with
//! write-through to an optional storage adapter.

use chronotree_error::{EngineError, Result};
use chronotree_storage::{DimensionValue, Quality, SerializedTimeline, StorageAdapter, TimePoint, TimePointMetadata, TimestampMillis};
use indexmap::IndexMap;
use std::sync::Arc;

/// Default cache capacity, matching the engine's historical default.
pub const DEFAULT_CAPACITY: usize = 1000;

/// A single in-memory series keyed by timestamp, ordered by LRU touch
/// (front = least recently touched, back = most recent) and,
/// optionally, write-through to a store.
pub struct Timeline {
    node_id: String,
    dimension: String,
    capacity: usize,
    cache: IndexMap<TimestampMillis, (DimensionValue, TimePointMetadata)>,
    store: Option<(Arc<dyn StorageAdapter>, String)>,
}

impl Timeline {
    pub fn new(node_id: impl Into<String>, dimension: impl Into<String>, capacity: usize) -> Self {
        Self {
            node_id: node_id.into(),
            dimension: dimension.into(),
            capacity,
            cache: IndexMap::new(),
            store: None,
        }
    }

    /// Attach a storage adapter: reads defer to it, writes go through
    /// it, and `before`-bounded deletes are authoritative there.
    pub fn attach_store(&mut self, store: Arc<dyn StorageAdapter>, tree_id: impl Into<String>) {
        self.store = Some((store, tree_id.into()));
    }

    pub fn is_attached(&self) -> bool {
        self.store.is_some()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn touch(&mut self, ts: TimestampMillis) {
        self.cache.shift_remove(&ts);
    }

    /// Insert or overwrite `ts`, touching it to the back of the LRU
    /// order, then evict from the front until back within capacity.
    fn insert_into_cache(&mut self, ts: TimestampMillis, value: DimensionValue, metadata: TimePointMetadata) {
        self.touch(ts);
        self.cache.insert(ts, (value, metadata));
        while self.cache.len() > self.capacity {
            self.cache.shift_remove_index(0);
        }
    }

    /// Build a `TimePoint`, write through to the cache and (if
    /// attached) to the store. A storage failure is returned to the
    /// caller but does *not* revert the cache insert: the new point
    /// may be visible in this process without being durable yet.
    pub async fn add_time_point(
        &mut self,
        ts: TimestampMillis,
        value: DimensionValue,
        quality: Quality,
        unit: Option<String>,
    ) -> Result<()> {
        let metadata = TimePointMetadata::new(quality, unit.clone(), ts);
        self.insert_into_cache(ts, value.clone(), metadata);

        if let Some((store, tree_id)) = &self.store {
            store
                .save_time_point(tree_id, &self.node_id, &self.dimension, ts, value, quality, unit)
                .await?;
        }

        Ok(())
    }

    /// Exact lookup at `ts`. Cache hit touches the entry; a miss falls
    /// through to the store (if attached), hydrating the cache on a
    /// store hit.
    pub async fn get_time_point(&mut self, ts: TimestampMillis) -> Result<Option<TimePoint>> {
        if let Some((value, metadata)) = self.cache.get(&ts).cloned() {
            self.touch(ts);
            self.cache.insert(ts, (value.clone(), metadata.clone()));
            return Ok(Some(TimePoint {
                timestamp: ts,
                value,
                metadata,
            }));
        }

        let Some((store, tree_id)) = &self.store else {
            return Ok(None);
        };

        let hits = store
            .get_time_points(tree_id, &self.node_id, &self.dimension, Some(ts), Some(ts), Some(1))
            .await
            .map_err(EngineError::into_history_query)?;

        match hits.into_iter().next() {
            Some((ts, value, metadata)) => {
                self.insert_into_cache(ts, value.clone(), metadata.clone());
                Ok(Some(TimePoint {
                    timestamp: ts,
                    value,
                    metadata,
                }))
            }
            None => Ok(None),
        }
    }

    /// The newest point with `ts <= before` (or overall, if `before`
    /// is `None`). When store-attached, the store is always consulted
    /// too so a cache eviction can never surface a stale "latest".
    pub async fn get_latest(&mut self, before: Option<TimestampMillis>) -> Result<Option<TimePoint>> {
        let cache_candidate = self
            .cache
            .iter()
            .filter(|(ts, _)| before.map(|b| **ts <= b).unwrap_or(true))
            .max_by_key(|(ts, _)| **ts)
            .map(|(ts, (value, metadata))| (*ts, value.clone(), metadata.clone()));

        let Some((store, tree_id)) = &self.store else {
            return Ok(cache_candidate.map(|(timestamp, value, metadata)| TimePoint {
                timestamp,
                value,
                metadata,
            }));
        };

        let store_candidate = store
            .get_latest_time_point(tree_id, &self.node_id, &self.dimension, before)
            .await
            .map_err(EngineError::into_history_query)?;

        let winner = match (cache_candidate, store_candidate) {
            (Some(cache), Some(store)) => {
                if store.0 >= cache.0 {
                    store
                } else {
                    cache
                }
            }
            (Some(cache), None) => cache,
            (None, Some(store)) => store,
            (None, None) => return Ok(None),
        };

        self.insert_into_cache(winner.0, winner.1.clone(), winner.2.clone());
        Ok(Some(TimePoint {
            timestamp: winner.0,
            value: winner.1,
            metadata: winner.2,
        }))
    }

    /// Range query. Store-attached: the store is authoritative (the
    /// range may exceed the cache); results hydrate the cache. Not
    /// attached: filter and sort the cache directly.
    pub async fn get_time_range(
        &mut self,
        start: Option<TimestampMillis>,
        end: Option<TimestampMillis>,
        limit: Option<usize>,
    ) -> Result<Vec<TimePoint>> {
        if let Some((store, tree_id)) = &self.store {
            let hits = store
                .get_time_points(tree_id, &self.node_id, &self.dimension, start, end, limit)
                .await
                .map_err(EngineError::into_history_query)?;

            for (ts, value, metadata) in &hits {
                self.insert_into_cache(*ts, value.clone(), metadata.clone());
            }

            return Ok(hits
                .into_iter()
                .map(|(timestamp, value, metadata)| TimePoint {
                    timestamp,
                    value,
                    metadata,
                })
                .collect());
        }

        let lower = start.unwrap_or(TimestampMillis::MIN);
        let upper = end.unwrap_or(TimestampMillis::MAX);

        let mut points: Vec<TimePoint> = self
            .cache
            .iter()
            .filter(|(ts, _)| **ts >= lower && **ts <= upper)
            .map(|(ts, (value, metadata))| TimePoint {
                timestamp: *ts,
                value: value.clone(),
                metadata: metadata.clone(),
            })
            .collect();
        points.sort_by_key(|p| p.timestamp);
        if let Some(limit) = limit {
            points.truncate(limit);
        }
        Ok(points)
    }

    /// Drop entries with `ts < before` (or all, if `None`) from both
    /// the cache and, if attached, the store. Returns the larger of
    /// the two counts — the store is authoritative when attached.
    pub async fn delete_before(&mut self, before: Option<TimestampMillis>) -> Result<usize> {
        let upper = before.unwrap_or(TimestampMillis::MAX);
        let to_remove: Vec<TimestampMillis> = self
            .cache
            .keys()
            .filter(|ts| **ts < upper)
            .copied()
            .collect();
        for ts in &to_remove {
            self.cache.shift_remove(ts);
        }
        let cache_removed = to_remove.len();

        if let Some((store, tree_id)) = &self.store {
            let store_removed = store
                .delete_time_points(tree_id, &self.node_id, &self.dimension, before)
                .await?;
            return Ok(cache_removed.max(store_removed));
        }

        Ok(cache_removed)
    }

    /// Export the cached points as an ordered-by-timestamp list.
    pub fn export(&self) -> SerializedTimeline {
        let mut points: SerializedTimeline = self
            .cache
            .iter()
            .map(|(ts, (value, metadata))| TimePoint {
                timestamp: *ts,
                value: value.clone(),
                metadata: metadata.clone(),
            })
            .collect();
        points.sort_by_key(|p| p.timestamp);
        points
    }

    /// Rebuild the cache from a previously exported list. LRU
    /// priorities from the run that produced `points` are not
    /// reconstructed — only insertion order in `points` is preserved.
    pub fn hydrate(&mut self, points: SerializedTimeline) {
        self.cache.clear();
        for point in points {
            self.insert_into_cache(point.timestamp, point.value, point.metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronotree_storage::MemoryStore;

    #[tokio::test]
    async fn lru_bound_holds_after_overflow() {
        let mut timeline = Timeline::new("n1", "metered", 3);
        for day in 1..=4i64 {
            timeline
                .add_time_point(day, DimensionValue::Number(day as f64), Quality::Normal, None)
                .await
                .unwrap();
        }
        assert_eq!(timeline.len(), 3);
    }

    #[tokio::test]
    async fn evicted_point_is_retrievable_from_store() {
        let store: Arc<dyn StorageAdapter> = Arc::new(MemoryStore::new());
        let mut timeline = Timeline::new("n1", "metered", 3);
        timeline.attach_store(store, "t1");

        for day in 1..=4i64 {
            timeline
                .add_time_point(day, DimensionValue::Number(day as f64), Quality::Normal, None)
                .await
                .unwrap();
        }
        assert_eq!(timeline.len(), 3);

        let point = timeline.get_time_point(1).await.unwrap().unwrap();
        assert_eq!(point.value.as_number(), Some(1.0));
        assert_eq!(timeline.len(), 3);
    }

    #[tokio::test]
    async fn delete_before_is_exclusive_of_boundary() {
        let mut timeline = Timeline::new("n1", "metered", 10);
        for day in 1..=3i64 {
            timeline
                .add_time_point(day, DimensionValue::Number(day as f64), Quality::Normal, None)
                .await
                .unwrap();
        }
        let removed = timeline.delete_before(Some(3)).await.unwrap();
        assert_eq!(removed, 2);
        assert!(timeline.get_time_point(3).await.unwrap().is_some());
    }
}
