//! Wire/on-disk types shared by every storage backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Millisecond-precision Unix timestamp, the identity component shared
/// by every time point.
pub type TimestampMillis = i64;

/// The scalar payload of a time point: a double for numeric dimensions,
/// a string for enumerated ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionValue {
    Number(f64),
    Text(String),
}

impl DimensionValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            DimensionValue::Number(n) => Some(*n),
            DimensionValue::Text(s) => s.parse().ok(),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            DimensionValue::Number(n) => n.to_string(),
            DimensionValue::Text(s) => s.clone(),
        }
    }
}

impl From<f64> for DimensionValue {
    fn from(value: f64) -> Self {
        DimensionValue::Number(value)
    }
}

impl From<String> for DimensionValue {
    fn from(value: String) -> Self {
        DimensionValue::Text(value)
    }
}

/// Quality code attached to every stored time point. Serializes as its
/// integer code (`0..=3`), the normative wire/disk representation, not
/// as the variant name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Quality {
    Invalid = 0,
    Normal = 1,
    Estimated = 2,
    Missing = 3,
}

impl From<Quality> for u8 {
    fn from(value: Quality) -> Self {
        value.code()
    }
}

impl TryFrom<u8> for Quality {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        Quality::from_code(code).ok_or_else(|| format!("invalid quality code: {code}"))
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Normal
    }
}

impl Quality {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Quality::Invalid),
            1 => Some(Quality::Normal),
            2 => Some(Quality::Estimated),
            3 => Some(Quality::Missing),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Metadata carried alongside every time point's scalar value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimePointMetadata {
    pub quality: Quality,
    pub unit: Option<String>,
    pub created_at: TimestampMillis,
}

impl TimePointMetadata {
    pub fn new(quality: Quality, unit: Option<String>, created_at: TimestampMillis) -> Self {
        Self {
            quality,
            unit,
            created_at,
        }
    }
}

/// One atom of a time series: `(timestamp, value, metadata)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub timestamp: TimestampMillis,
    pub value: DimensionValue,
    pub metadata: TimePointMetadata,
}

impl TimePoint {
    pub fn new(
        timestamp: TimestampMillis,
        value: impl Into<DimensionValue>,
        quality: Quality,
        unit: Option<String>,
        created_at: TimestampMillis,
    ) -> Self {
        Self {
            timestamp,
            value: value.into(),
            metadata: TimePointMetadata::new(quality, unit, created_at),
        }
    }
}

/// The serialized cache of one timeline, as exported for persistence.
pub type SerializedTimeline = Vec<TimePoint>;

/// A node record as it appears on disk / in the SQL `nodes` table blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub parent_id: Option<String>,
    pub address: String,
    pub name: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// dimension name -> cached time points, as last known to the node.
    pub timelines: BTreeMap<String, SerializedTimeline>,
}

/// A tree record as it appears on disk / in the SQL `trees` table blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeRecord {
    pub tree_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub root_node_id: String,
    pub nodes: BTreeMap<String, NodeRecord>,
    pub metadata: Option<serde_json::Value>,
}
