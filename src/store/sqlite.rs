//! SQLite-backed attribute store.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use super::{apply_index_range, AttributeStore, AttributeValue, StoreError};
use crate::types::{AttributeId, DataValue, NodeId, Range, ReadValueId, StatusCode, Variant};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Thread-safe SQLite node table.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Nodes ---

    /// Add a variable node with an initial value, replacing any existing one.
    pub fn add_node(&self, node_id: &NodeId, value: &DataValue) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO nodes (node_id) VALUES (?1) ON CONFLICT(node_id) DO NOTHING",
            params![node_id.to_string()],
        )?;
        upsert_value(&tx, node_id, value)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a node and everything stored for it.
    pub fn delete_node(&self, node_id: &NodeId) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM nodes WHERE node_id = ?1", params![node_id.to_string()])?;
        Ok(n > 0)
    }

    pub fn set_eu_range(&self, node_id: &NodeId, range: Option<Range>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE nodes SET eu_low = ?1, eu_high = ?2 WHERE node_id = ?3",
            params![range.map(|r| r.low), range.map(|r| r.high), node_id.to_string()],
        )?;
        if n == 0 {
            return Err(StoreError::NodeNotFound(node_id.clone()));
        }
        Ok(())
    }

    /// Get all node ids.
    pub fn node_ids(&self) -> Result<Vec<NodeId>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT node_id FROM nodes ORDER BY node_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ids.into_iter().filter_map(|s| s.parse().ok()).collect())
    }

    fn node_exists(conn: &Connection, node_id: &NodeId) -> Result<bool, StoreError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM nodes WHERE node_id = ?1",
                params![node_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn upsert_value(conn: &Connection, node_id: &NodeId, value: &DataValue) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO node_values (node_id, value, status, source_time, server_time)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(node_id) DO UPDATE SET
         value=excluded.value, status=excluded.status,
         source_time=excluded.source_time, server_time=excluded.server_time",
        params![
            node_id.to_string(),
            serde_json::to_string(&value.value)?,
            value.status.0,
            value.source_timestamp.map(|t| t.format(TIME_FORMAT).to_string()),
            value.server_timestamp.map(|t| t.format(TIME_FORMAT).to_string()),
        ],
    )?;
    Ok(())
}

impl AttributeStore for SqliteStore {
    fn read(&self, target: &ReadValueId) -> Result<DataValue, StoreError> {
        if !target.attribute_id.is_valid() {
            return Err(StoreError::AttributeInvalid(target.attribute_id));
        }

        let conn = self.conn.lock();
        if !Self::node_exists(&conn, &target.node_id)? {
            return Err(StoreError::NodeNotFound(target.node_id.clone()));
        }

        let value = if target.attribute_id.is_value() {
            let row: Option<(String, u32, Option<String>, Option<String>)> = conn
                .query_row(
                    "SELECT value, status, source_time, server_time FROM node_values WHERE node_id = ?1",
                    params![target.node_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            match row {
                Some((json, status, source, server)) => DataValue {
                    value: serde_json::from_str(&json)?,
                    status: StatusCode(status),
                    source_timestamp: source.as_deref().and_then(parse_db_time),
                    server_timestamp: server.as_deref().and_then(parse_db_time),
                },
                None => DataValue::from_status(StatusCode::BAD_WAITING_FOR_INITIAL_DATA),
            }
        } else {
            let json: Option<String> = conn
                .query_row(
                    "SELECT value FROM node_attributes WHERE node_id = ?1 AND attribute_id = ?2",
                    params![target.node_id.to_string(), target.attribute_id.0],
                    |row| row.get(0),
                )
                .optional()?;
            let json = json.ok_or(StoreError::AttributeInvalid(target.attribute_id))?;
            DataValue {
                value: serde_json::from_str::<Variant>(&json)?,
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

        let conn = self.conn.lock();
        if !Self::node_exists(&conn, node_id)? {
            return Err(StoreError::NodeNotFound(node_id.clone()));
        }

        match (attribute_id.is_value(), value) {
            (true, AttributeValue::Value(dv)) => upsert_value(&conn, node_id, &dv)?,
            (true, AttributeValue::Raw(raw)) => upsert_value(&conn, node_id, &DataValue::new(raw))?,
            (false, value) => {
                let raw = match value {
                    AttributeValue::Value(dv) => dv.value,
                    AttributeValue::Raw(raw) => raw,
                };
                conn.execute(
                    "INSERT INTO node_attributes (node_id, attribute_id, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(node_id, attribute_id) DO UPDATE SET value=excluded.value",
                    params![node_id.to_string(), attribute_id.0, serde_json::to_string(&raw)?],
                )?;
            }
        }

        Ok(())
    }

    fn eu_range(&self, node_id: &NodeId) -> Option<Range> {
        let conn = self.conn.lock();
        let row: Option<(Option<f64>, Option<f64>)> = conn
            .query_row(
                "SELECT eu_low, eu_high FROM nodes WHERE node_id = ?1",
                params![node_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .unwrap_or_else(|e| {
                tracing::warn!("SqliteStore: Failed to read EU range for {}: {}", node_id, e);
                None
            });

        match row {
            Some((Some(low), Some(high))) => Some(Range::new(low, high)),
            _ => None,
        }
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_node_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStore::new(tmp.path()).unwrap();
        let node = NodeId::string(2, "Tank.Level");

        store.add_node(&node, &DataValue::new(12.5f64)).unwrap();
        assert_eq!(store.node_ids().unwrap(), vec![node.clone()]);

        let read = store.read(&ReadValueId::value_of(node.clone())).unwrap();
        assert_eq!(read.value, Variant::Double(12.5));
        assert!(read.status.is_good());
        assert!(read.source_timestamp.is_some());

        let dv = DataValue::new(13i32).with_status(StatusCode::UNCERTAIN);
        store.write(&node, AttributeId::VALUE, AttributeValue::Value(dv)).unwrap();
        let read = store.read(&ReadValueId::value_of(node.clone())).unwrap();
        assert_eq!(read.value, Variant::Int32(13));
        assert_eq!(read.status, StatusCode::UNCERTAIN);

        assert!(store.delete_node(&node).unwrap());
        let err = store.read(&ReadValueId::value_of(node)).unwrap_err();
        assert!(err.is_missing_target());
    }

    #[test]
    fn test_raw_attributes_and_ranges() {
        let store = SqliteStore::in_memory().unwrap();
        let node = NodeId::numeric(2, 7);
        store.add_node(&node, &DataValue::new(vec![1.0f64, 2.0, 3.0])).unwrap();

        store
            .write(&node, AttributeId::DESCRIPTION, AttributeValue::Raw("Flow".into()))
            .unwrap();
        let read = store.read(&ReadValueId::new(node.clone(), AttributeId::DESCRIPTION)).unwrap();
        assert_eq!(read.value, Variant::from("Flow"));

        let ranged = ReadValueId::value_of(node.clone()).with_index_range("1:2");
        assert_eq!(store.read(&ranged).unwrap().value, Variant::from(vec![2.0f64, 3.0]));

        assert_eq!(store.eu_range(&node), None);
        store.set_eu_range(&node, Some(Range::new(-10.0, 10.0))).unwrap();
        assert_eq!(store.eu_range(&node), Some(Range::new(-10.0, 10.0)));
    }

    #[test]
    fn test_write_to_missing_node() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .write(&NodeId::numeric(9, 9), AttributeId::VALUE, AttributeValue::Raw(1i32.into()))
            .unwrap_err();
        assert!(err.is_missing_target());
    }
}
