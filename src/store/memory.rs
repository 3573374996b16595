//! In-memory attribute store.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{apply_index_range, AttributeStore, AttributeValue, StoreError};
use crate::types::{AttributeId, DataValue, NodeId, Range, ReadValueId, Variant};

#[derive(Debug, Clone, Default)]
struct NodeRecord {
    value: DataValue,
    attributes: HashMap<AttributeId, Variant>,
    eu_range: Option<Range>,
}

/// Thread-safe in-memory node table.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<NodeId, NodeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a variable node with an initial value.
    pub fn add_node(&self, node_id: NodeId, value: DataValue) {
        let record = NodeRecord {
            value,
            ..Default::default()
        };
        self.nodes.write().insert(node_id, record);
    }

    pub fn remove_node(&self, node_id: &NodeId) -> bool {
        self.nodes.write().remove(node_id).is_some()
    }

    pub fn set_eu_range(&self, node_id: &NodeId, range: Option<Range>) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write();
        let record = nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NodeNotFound(node_id.clone()))?;
        record.eu_range = range;
        Ok(())
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.read().contains_key(node_id)
    }
}

impl AttributeStore for MemoryStore {
    fn read(&self, target: &ReadValueId) -> Result<DataValue, StoreError> {
        if !target.attribute_id.is_valid() {
            return Err(StoreError::AttributeInvalid(target.attribute_id));
        }

        let nodes = self.nodes.read();
        let record = nodes
            .get(&target.node_id)
            .ok_or_else(|| StoreError::NodeNotFound(target.node_id.clone()))?;

        let value = if target.attribute_id.is_value() {
            record.value.clone()
        } else {
            let raw = record
                .attributes
                .get(&target.attribute_id)
                .cloned()
                .ok_or(StoreError::AttributeInvalid(target.attribute_id))?;
            DataValue {
                value: raw,
                server_timestamp: Some(Utc::now()),
                ..Default::default()
            }
        };

        apply_index_range(value, target.index_range.as_deref())
    }

    fn write(&self, node_id: &NodeId, attribute_id: AttributeId, value: AttributeValue) -> Result<(), StoreError> {
        if !attribute_id.is_valid() {
            return Err(StoreError::AttributeInvalid(attribute_id));
        }

        let mut nodes = self.nodes.write();
        let record = nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NodeNotFound(node_id.clone()))?;

        match value {
            AttributeValue::Value(dv) if attribute_id.is_value() => record.value = dv,
            AttributeValue::Value(dv) => {
                record.attributes.insert(attribute_id, dv.value);
            }
            AttributeValue::Raw(raw) if attribute_id.is_value() => {
                record.value = DataValue::new(raw);
            }
            AttributeValue::Raw(raw) => {
                record.attributes.insert(attribute_id, raw);
            }
        }

        Ok(())
    }

    fn eu_range(&self, node_id: &NodeId) -> Option<Range> {
        self.nodes.read().get(node_id).and_then(|r| r.eu_range)
    }
}
