//! Embedded SQL storage backend, using SQLite through `sqlx`.
//!
//! Three primary tables (`trees`, `nodes`, `time_series`) plus a
//! `dimension_stats` cache of `(min_time, max_time, count)` per
//! `(tree_id, node_id, dimension)`, refreshed in the same transaction as
//! the write or delete that triggered it.

use crate::adapter::StorageAdapter;
use crate::model::{DimensionValue, NodeRecord, Quality, TimePointMetadata, TimestampMillis, TreeRecord};
use async_trait::async_trait;
use chronotree_error::{EngineError, Result};
use sqlx::{sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool};

const BACKEND: &str = "sql";

/// Backend that persists all state in a SQLite database through `sqlx`.
pub struct SqlStore {
    pool: SqlitePool,
}

fn storage_err(operation: &str, message: impl std::fmt::Display) -> EngineError {
    EngineError::storage(operation, BACKEND, message)
}

impl SqlStore {
    /// Connect to (creating if necessary) the SQLite database at
    /// `database_url`, e.g. `sqlite://path/to/file.db`, and run pending
    /// migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        use sqlx::migrate::MigrateDatabase;

        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            Sqlite::create_database(database_url)
                .await
                .map_err(|e| storage_err("create_database", e))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| storage_err("connect", e))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| storage_err("migrate", e))?;

        Ok(Self { pool })
    }

    async fn refresh_dimension_stats(
        executor: &mut sqlx::SqliteConnection,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
    ) -> Result<()> {
        let row = sqlx::query(
            "SELECT MIN(timestamp) AS min_time, MAX(timestamp) AS max_time, COUNT(*) AS count
             FROM time_series
             WHERE tree_id = ? AND node_id = ? AND dimension = ?",
        )
        .bind(tree_id)
        .bind(node_id)
        .bind(dimension)
        .fetch_one(&mut *executor)
        .await
        .map_err(|e| storage_err("refresh_dimension_stats", e))?;

        let count: i64 = row.get("count");

        if count == 0 {
            sqlx::query(
                "DELETE FROM dimension_stats WHERE tree_id = ? AND node_id = ? AND dimension = ?",
            )
            .bind(tree_id)
            .bind(node_id)
            .bind(dimension)
            .execute(&mut *executor)
            .await
            .map_err(|e| storage_err("refresh_dimension_stats", e))?;
            return Ok(());
        }

        let min_time: i64 = row.get("min_time");
        let max_time: i64 = row.get("max_time");

        sqlx::query(
            "INSERT INTO dimension_stats (tree_id, node_id, dimension, min_time, max_time, count)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(tree_id, node_id, dimension)
             DO UPDATE SET min_time = excluded.min_time, max_time = excluded.max_time, count = excluded.count",
        )
        .bind(tree_id)
        .bind(node_id)
        .bind(dimension)
        .bind(min_time)
        .bind(max_time)
        .bind(count)
        .execute(&mut *executor)
        .await
        .map_err(|e| storage_err("refresh_dimension_stats", e))?;

        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for SqlStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn save_tree(&self, tree_id: &str, tree: &TreeRecord) -> Result<()> {
        let data = serde_json::to_vec(tree).map_err(|e| storage_err("save_tree", e))?;
        sqlx::query(
            "INSERT INTO trees (tree_id, tree_data) VALUES (?, ?)
             ON CONFLICT(tree_id) DO UPDATE SET tree_data = excluded.tree_data, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(tree_id)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("save_tree", e))?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn load_tree(&self, tree_id: &str) -> Result<Option<TreeRecord>> {
        let row = sqlx::query("SELECT tree_data FROM trees WHERE tree_id = ?")
            .bind(tree_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_err("load_tree", e))?;

        match row {
            Some(row) => {
                let data: Vec<u8> = row.get("tree_data");
                let tree =
                    serde_json::from_slice(&data).map_err(|e| storage_err("load_tree", e))?;
                Ok(Some(tree))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn delete_tree(&self, tree_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| storage_err("delete_tree", e))?;
        sqlx::query("DELETE FROM time_series WHERE tree_id = ?")
            .bind(tree_id)
            .execute(&mut tx)
            .await
            .map_err(|e| storage_err("delete_tree", e))?;
        sqlx::query("DELETE FROM dimension_stats WHERE tree_id = ?")
            .bind(tree_id)
            .execute(&mut tx)
            .await
            .map_err(|e| storage_err("delete_tree", e))?;
        sqlx::query("DELETE FROM nodes WHERE tree_id = ?")
            .bind(tree_id)
            .execute(&mut tx)
            .await
            .map_err(|e| storage_err("delete_tree", e))?;
        sqlx::query("DELETE FROM trees WHERE tree_id = ?")
            .bind(tree_id)
            .execute(&mut tx)
            .await
            .map_err(|e| storage_err("delete_tree", e))?;
        tx.commit().await.map_err(|e| storage_err("delete_tree", e))?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn save_node(&self, tree_id: &str, node_id: &str, node: &NodeRecord) -> Result<()> {
        let data = serde_json::to_vec(node).map_err(|e| storage_err("save_node", e))?;
        sqlx::query(
            "INSERT INTO nodes (tree_id, node_id, node_data) VALUES (?, ?, ?)
             ON CONFLICT(tree_id, node_id) DO UPDATE SET node_data = excluded.node_data, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(tree_id)
        .bind(node_id)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("save_node", e))?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn load_node(&self, tree_id: &str, node_id: &str) -> Result<Option<NodeRecord>> {
        let row = sqlx::query("SELECT node_data FROM nodes WHERE tree_id = ? AND node_id = ?")
            .bind(tree_id)
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_err("load_node", e))?;

        match row {
            Some(row) => {
                let data: Vec<u8> = row.get("node_data");
                let node =
                    serde_json::from_slice(&data).map_err(|e| storage_err("load_node", e))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn delete_node(&self, tree_id: &str, node_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| storage_err("delete_node", e))?;
        sqlx::query("DELETE FROM time_series WHERE tree_id = ? AND node_id = ?")
            .bind(tree_id)
            .bind(node_id)
            .execute(&mut tx)
            .await
            .map_err(|e| storage_err("delete_node", e))?;
        sqlx::query("DELETE FROM dimension_stats WHERE tree_id = ? AND node_id = ?")
            .bind(tree_id)
            .bind(node_id)
            .execute(&mut tx)
            .await
            .map_err(|e| storage_err("delete_node", e))?;
        sqlx::query("DELETE FROM nodes WHERE tree_id = ? AND node_id = ?")
            .bind(tree_id)
            .bind(node_id)
            .execute(&mut tx)
            .await
            .map_err(|e| storage_err("delete_node", e))?;
        tx.commit().await.map_err(|e| storage_err("delete_node", e))?;
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
        let value_bytes = serde_json::to_vec(&value).map_err(|e| storage_err("save_time_point", e))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("save_time_point", e))?;

        sqlx::query(
            "INSERT INTO time_series (tree_id, node_id, dimension, timestamp, value, quality, unit)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tree_id, node_id, dimension, timestamp)
             DO UPDATE SET value = excluded.value, quality = excluded.quality, unit = excluded.unit",
        )
        .bind(tree_id)
        .bind(node_id)
        .bind(dimension)
        .bind(timestamp)
        .bind(value_bytes)
        .bind(quality.code() as i64)
        .bind(unit)
        .execute(&mut tx)
        .await
        .map_err(|e| storage_err("save_time_point", e))?;

        Self::refresh_dimension_stats(&mut tx, tree_id, node_id, dimension).await?;

        tx.commit().await.map_err(|e| storage_err("save_time_point", e))?;
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
        let lower = start.unwrap_or(TimestampMillis::MIN);
        let upper = end.unwrap_or(TimestampMillis::MAX);
        let limit = limit.map(|l| l as i64).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            "SELECT timestamp, value, quality, unit
             FROM time_series
             WHERE tree_id = ? AND node_id = ? AND dimension = ? AND timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp ASC
             LIMIT ?",
        )
        .bind(tree_id)
        .bind(node_id)
        .bind(dimension)
        .bind(lower)
        .bind(upper)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_err("get_time_points", e))?;

        rows.into_iter().map(|row| row_to_point(row)).collect()
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn get_latest_time_point(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        before: Option<TimestampMillis>,
    ) -> Result<Option<(TimestampMillis, DimensionValue, TimePointMetadata)>> {
        let upper = before.unwrap_or(TimestampMillis::MAX);

        let row = sqlx::query(
            "SELECT timestamp, value, quality, unit
             FROM time_series
             WHERE tree_id = ? AND node_id = ? AND dimension = ? AND timestamp <= ?
             ORDER BY timestamp DESC
             LIMIT 1",
        )
        .bind(tree_id)
        .bind(node_id)
        .bind(dimension)
        .bind(upper)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("get_latest_time_point", e))?;

        row.map(row_to_point).transpose()
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn delete_time_points(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
        before: Option<TimestampMillis>,
    ) -> Result<usize> {
        let upper = before.unwrap_or(TimestampMillis::MAX);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_err("delete_time_points", e))?;

        let result = sqlx::query(
            "DELETE FROM time_series
             WHERE tree_id = ? AND node_id = ? AND dimension = ? AND timestamp < ?",
        )
        .bind(tree_id)
        .bind(node_id)
        .bind(dimension)
        .bind(upper)
        .execute(&mut tx)
        .await
        .map_err(|e| storage_err("delete_time_points", e))?;

        Self::refresh_dimension_stats(&mut tx, tree_id, node_id, dimension).await?;

        tx.commit().await.map_err(|e| storage_err("delete_time_points", e))?;

        Ok(result.rows_affected() as usize)
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn get_dimensions(&self, tree_id: &str, node_id: Option<&str>) -> Result<Vec<String>> {
        let rows = match node_id {
            Some(node_id) => sqlx::query(
                "SELECT DISTINCT dimension FROM time_series WHERE tree_id = ? AND node_id = ? ORDER BY dimension",
            )
            .bind(tree_id)
            .bind(node_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_err("get_dimensions", e))?,
            None => sqlx::query(
                "SELECT DISTINCT dimension FROM time_series WHERE tree_id = ? ORDER BY dimension",
            )
            .bind(tree_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_err("get_dimensions", e))?,
        };

        Ok(rows.into_iter().map(|row| row.get::<String, _>("dimension")).collect())
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    async fn get_time_range(
        &self,
        tree_id: &str,
        node_id: &str,
        dimension: &str,
    ) -> Result<Option<(TimestampMillis, TimestampMillis)>> {
        let row = sqlx::query(
            "SELECT min_time, max_time FROM dimension_stats WHERE tree_id = ? AND node_id = ? AND dimension = ?",
        )
        .bind(tree_id)
        .bind(node_id)
        .bind(dimension)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("get_time_range", e))?;

        Ok(row.map(|row| (row.get("min_time"), row.get("max_time"))))
    }
}

fn row_to_point(
    row: sqlx::sqlite::SqliteRow,
) -> Result<(TimestampMillis, DimensionValue, TimePointMetadata)> {
    let timestamp: i64 = row.get("timestamp");
    let value_bytes: Vec<u8> = row.get("value");
    let quality_code: i64 = row.get("quality");
    let unit: Option<String> = row.get("unit");

    let value: DimensionValue =
        serde_json::from_slice(&value_bytes).map_err(|e| storage_err("decode_value", e))?;
    let quality = Quality::from_code(quality_code as u8)
        .ok_or_else(|| storage_err("decode_quality", format!("invalid quality code {quality_code}")))?;

    Ok((
        timestamp,
        value,
        TimePointMetadata::new(quality, unit, timestamp),
    ))
}
