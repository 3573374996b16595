//! Node and attribute addressing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a node in the address space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeId {
    Numeric(u16, u32),
    String(u16, String),
}

impl NodeId {
    pub fn numeric(namespace: u16, id: u32) -> Self {
        NodeId::Numeric(namespace, id)
    }

    pub fn string(namespace: u16, id: impl Into<String>) -> Self {
        NodeId::String(namespace, id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Numeric(ns, id) => write!(f, "ns={};i={}", ns, id),
            NodeId::String(ns, id) => write!(f, "ns={};s={}", ns, id),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("invalid node id: {0}")]
pub struct ParseNodeIdError(String);

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    /// Parses `ns=<n>;i=<id>` or `ns=<n>;s=<id>`. A missing `ns=` prefix means namespace 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseNodeIdError(s.to_string());

        let (namespace, rest) = match s.strip_prefix("ns=") {
            Some(tail) => {
                let (ns, rest) = tail.split_once(';').ok_or_else(err)?;
                (ns.parse::<u16>().map_err(|_| err())?, rest)
            }
            None => (0, s),
        };

        if let Some(id) = rest.strip_prefix("i=") {
            let id = id.parse::<u32>().map_err(|_| err())?;
            Ok(NodeId::Numeric(namespace, id))
        } else if let Some(id) = rest.strip_prefix("s=") {
            Ok(NodeId::String(namespace, id.to_string()))
        } else {
            Err(err())
        }
    }
}

/// Attribute identifier. Valid identifiers are 1..=27.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeId(pub u32);

impl AttributeId {
    pub const NODE_ID: AttributeId = AttributeId(1);
    pub const NODE_CLASS: AttributeId = AttributeId(2);
    pub const BROWSE_NAME: AttributeId = AttributeId(3);
    pub const DISPLAY_NAME: AttributeId = AttributeId(4);
    pub const DESCRIPTION: AttributeId = AttributeId(5);
    pub const VALUE: AttributeId = AttributeId(13);
    pub const DATA_TYPE: AttributeId = AttributeId(14);
    pub const VALUE_RANK: AttributeId = AttributeId(15);
    pub const ACCESS_LEVEL: AttributeId = AttributeId(17);
    pub const MINIMUM_SAMPLING_INTERVAL: AttributeId = AttributeId(19);
    pub const HISTORIZING: AttributeId = AttributeId(20);

    pub fn is_valid(&self) -> bool {
        (1..=27).contains(&self.0)
    }

    pub fn is_value(&self) -> bool {
        *self == Self::VALUE
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sub-range of a one-dimensional array value, parsed from `"n"` or `"lo:hi"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexRange {
    pub low: usize,
    pub high: usize,
}

impl IndexRange {
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once(':') {
            Some((lo, hi)) => {
                let low = lo.trim().parse().ok()?;
                let high = hi.trim().parse().ok()?;
                if low >= high {
                    return None;
                }
                Some(Self { low, high })
            }
            None => {
                let idx = s.trim().parse().ok()?;
                Some(Self { low: idx, high: idx })
            }
        }
    }
}

/// What a monitored item samples: a node, one of its attributes, and an optional index range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadValueId {
    pub node_id: NodeId,
    pub attribute_id: AttributeId,
    pub index_range: Option<String>,
}

impl ReadValueId {
    pub fn new(node_id: NodeId, attribute_id: AttributeId) -> Self {
        Self {
            node_id,
            attribute_id,
            index_range: None,
        }
    }

    /// Target the Value attribute of a node.
    pub fn value_of(node_id: NodeId) -> Self {
        Self::new(node_id, AttributeId::VALUE)
    }

    pub fn with_index_range(mut self, range: impl Into<String>) -> Self {
        self.index_range = Some(range.into());
        self
    }
}

impl fmt::Display for ReadValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.index_range {
            Some(range) => write!(f, "{}@{}[{}]", self.node_id, self.attribute_id, range),
            None => write!(f, "{}@{}", self.node_id, self.attribute_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse() {
        assert_eq!("ns=2;s=Boiler.Temp".parse(), Ok(NodeId::string(2, "Boiler.Temp")));
        assert_eq!("ns=0;i=2258".parse(), Ok(NodeId::numeric(0, 2258)));
        assert_eq!("i=85".parse(), Ok(NodeId::numeric(0, 85)));
        assert!("ns=x;i=1".parse::<NodeId>().is_err());
        assert!("ns=1;g=abc".parse::<NodeId>().is_err());

        let id = NodeId::string(3, "Line1");
        assert_eq!(id.to_string().parse(), Ok(id));
    }

    #[test]
    fn test_attribute_validity() {
        assert!(AttributeId::VALUE.is_valid());
        assert!(!AttributeId(0).is_valid());
        assert!(!AttributeId(99).is_valid());
    }

    #[test]
    fn test_index_range_parse() {
        assert_eq!(IndexRange::parse("3"), Some(IndexRange { low: 3, high: 3 }));
        assert_eq!(IndexRange::parse("1:4"), Some(IndexRange { low: 1, high: 4 }));
        assert_eq!(IndexRange::parse("4:1"), None);
        assert_eq!(IndexRange::parse("2:2"), None);
        assert_eq!(IndexRange::parse("a"), None);
    }
}
