//! Node/attribute storage.
//!
//! The sampling engine only needs a synchronous read and write keyed by node
//! and attribute. Two backends are provided: an in-memory map and SQLite.

mod memory;
mod sqlite;

pub use memory::*;
pub use sqlite::*;

use crate::types::{AttributeId, DataValue, IndexRange, NodeId, Range, ReadValueId, StatusCode, Variant};
use thiserror::Error;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("invalid attribute id {0}")]
    AttributeInvalid(AttributeId),
    #[error("invalid index range: {0}")]
    IndexRangeInvalid(String),
    #[error("no data in index range {0}")]
    IndexRangeNoData(String),
}

impl StoreError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            StoreError::NodeNotFound(_) => StatusCode::BAD_NODE_ID_UNKNOWN,
            StoreError::AttributeInvalid(_) => StatusCode::BAD_ATTRIBUTE_ID_INVALID,
            StoreError::IndexRangeInvalid(_) => StatusCode::BAD_INDEX_RANGE_INVALID,
            StoreError::IndexRangeNoData(_) => StatusCode::BAD_INDEX_RANGE_NO_DATA,
            StoreError::Sqlite(_) | StoreError::Migration(_) | StoreError::Serialization(_) => {
                StatusCode::BAD_INTERNAL_ERROR
            }
        }
    }

    /// The write target is gone or was never addressable.
    pub fn is_missing_target(&self) -> bool {
        matches!(self, StoreError::NodeNotFound(_) | StoreError::AttributeInvalid(_))
    }
}

/// What gets written to an attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Timestamped, status-coded value for the Value attribute.
    Value(DataValue),
    /// Bare value for any other attribute.
    Raw(Variant),
}

/// Synchronous node/attribute storage.
pub trait AttributeStore: Send + Sync {
    fn read(&self, target: &ReadValueId) -> Result<DataValue, StoreError>;

    fn write(&self, node_id: &NodeId, attribute_id: AttributeId, value: AttributeValue) -> Result<(), StoreError>;

    /// Engineering-unit range of an analog node, if it declares one.
    fn eu_range(&self, _node_id: &NodeId) -> Option<Range> {
        None
    }
}

/// Narrow a read result to the requested index range.
pub fn apply_index_range(mut value: DataValue, index_range: Option<&str>) -> Result<DataValue, StoreError> {
    let Some(raw) = index_range else {
        return Ok(value);
    };

    let range = IndexRange::parse(raw).ok_or_else(|| StoreError::IndexRangeInvalid(raw.to_string()))?;
    value.value = value
        .value
        .slice(range.low, range.high)
        .ok_or_else(|| StoreError::IndexRangeNoData(raw.to_string()))?;

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_index_range() {
        let dv = DataValue::new(vec![1i32, 2, 3, 4]);

        let sliced = apply_index_range(dv.clone(), Some("1:2")).unwrap();
        assert_eq!(sliced.value, Variant::from(vec![2i32, 3]));

        let untouched = apply_index_range(dv.clone(), None).unwrap();
        assert_eq!(untouched, dv);

        let err = apply_index_range(dv.clone(), Some("x")).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_INDEX_RANGE_INVALID);

        let err = apply_index_range(dv, Some("7")).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_INDEX_RANGE_NO_DATA);
    }

    #[test]
    fn test_apply_index_range_string_open_high_bound() {
        let dv = DataValue::new("pump-07");

        let sliced = apply_index_range(dv.clone(), Some("0:18446744073709551615")).unwrap();
        assert_eq!(sliced.value, Variant::from("pump-07"));

        let sliced = apply_index_range(dv.clone(), Some("5:18446744073709551615")).unwrap();
        assert_eq!(sliced.value, Variant::from("07"));

        let err = apply_index_range(dv, Some("7:18446744073709551615")).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_INDEX_RANGE_NO_DATA);
    }
}
