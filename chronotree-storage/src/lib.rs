//! Storage adapter contract and backends for the chronotree engine.
//!
//! Three interchangeable backends satisfy the same [`StorageAdapter`]
//! contract: [`MemoryStore`] (process-lifetime, no durability),
//! [`FileStore`] (single JSON document, load-modify-write), and
//! [`SqlStore`] (embedded SQLite).

mod adapter;
mod file;
mod memory;
mod model;
mod sql;

pub use adapter::StorageAdapter;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use model::{
    DimensionValue, NodeRecord, Quality, SerializedTimeline, TimePoint, TimePointMetadata,
    TimestampMillis, TreeRecord,
};
pub use sql::SqlStore;
