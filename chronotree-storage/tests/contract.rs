//! The same write/read sequence exercised against every backend must
//! produce identical results: memory, single-file document, and
//! embedded SQL are interchangeable implementations of one contract.

use chronotree_storage::{DimensionValue, FileStore, MemoryStore, Quality, SqlStore, StorageAdapter, TreeRecord};
use std::collections::BTreeMap;
use std::sync::Arc;

async fn exercise(store: &dyn StorageAdapter) {
    let tree = TreeRecord {
        tree_id: "t1".to_string(),
        name: "demo".to_string(),
        description: None,
        created_at: chrono::Utc::now(),
        root_node_id: "root".to_string(),
        nodes: BTreeMap::new(),
        metadata: None,
    };
    store.save_tree("t1", &tree).await.unwrap();

    for (ts, value) in [(1_i64, 10.0_f64), (2, 20.0), (3, 30.0)] {
        store
            .save_time_point("t1", "n1", "metered", ts, DimensionValue::Number(value), Quality::Normal, None)
            .await
            .unwrap();
    }
    // Upsert: rewriting ts=2 must leave exactly one entry with the new value.
    store
        .save_time_point("t1", "n1", "metered", 2, DimensionValue::Number(25.0), Quality::Normal, None)
        .await
        .unwrap();

    let points = store
        .get_time_points("t1", "n1", "metered", None, None, None)
        .await
        .unwrap();
    assert_eq!(points.len(), 3);
    assert_eq!(points[1].0, 2);
    assert_eq!(points[1].1.as_number(), Some(25.0));

    let latest = store
        .get_latest_time_point("t1", "n1", "metered", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.0, 3);

    let dims = store.get_dimensions("t1", Some("n1")).await.unwrap();
    assert_eq!(dims, vec!["metered".to_string()]);

    let range = store.get_time_range("t1", "n1", "metered").await.unwrap().unwrap();
    assert_eq!(range, (1, 3));

    let deleted = store.delete_time_points("t1", "n1", "metered", Some(3)).await.unwrap();
    assert_eq!(deleted, 2);
}

#[tokio::test]
async fn memory_backend_satisfies_contract() {
    let store = MemoryStore::new();
    exercise(&store).await;
}

#[tokio::test]
async fn file_backend_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("store.json")).unwrap();
    let store = FileStore::new(&path);
    exercise(&store).await;
}

#[tokio::test]
async fn sql_backend_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("store.db");
    let url = format!("sqlite://{}", db_path.display());
    let store = SqlStore::connect(&url).await.unwrap();
    exercise(&store).await;
}

#[tokio::test]
async fn same_write_sequence_agrees_across_backends() {
    let memory = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("store.json")).unwrap();
    let file = FileStore::new(&path);
    let sql_dir = tempfile::tempdir().unwrap();
    let sql_url = format!("sqlite://{}", sql_dir.path().join("store.db").display());
    let sql = SqlStore::connect(&sql_url).await.unwrap();

    let backends: Vec<Arc<dyn StorageAdapter>> = vec![Arc::new(memory), Arc::new(file), Arc::new(sql)];

    for backend in &backends {
        backend
            .save_time_point("t1", "n1", "metered", 1, DimensionValue::Number(7.0), Quality::Normal, None)
            .await
            .unwrap();
        backend
            .save_time_point("t1", "n1", "metered", 2, DimensionValue::Number(8.0), Quality::Normal, None)
            .await
            .unwrap();
    }

    let mut all_points = Vec::new();
    for backend in &backends {
        all_points.push(
            backend
                .get_time_points("t1", "n1", "metered", None, None, None)
                .await
                .unwrap(),
        );
    }
    assert!(all_points.windows(2).all(|pair| pair[0] == pair[1]));
}
