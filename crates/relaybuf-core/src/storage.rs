//! Durable storage collaborator.
//!
//! The buffer talks to the database only through [`DurableStore`]. Each call
//! is its own transactional unit and is made without the buffer lock held.
//! [`SqliteStore`] is the bundled implementation.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::record::{Record, Stream};
use crate::tables::{EncodedRow, FieldKind, TableSet, TableSpec, encode_row};

/// A record with the time it was first written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableRow {
    pub record: Record,
    pub write_clock: u64,
}

/// Row limits for a forward read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    /// Read ids strictly below this bound (an in-flight insert).
    pub below_id: Option<u64>,
    pub max_rows: usize,
    /// Encoded byte budget; the first row is always returned.
    pub max_bytes: usize,
}

/// Durable backing store for buffered records.
pub trait DurableStore: Send + Sync {
    /// Table layout used for both storage and upload encoding.
    fn tables(&self) -> &TableSet;

    /// Insert rows atomically. Rows may belong to different streams.
    fn insert(&self, rows: &[DurableRow]) -> Result<(), StorageError>;

    /// Encoded rows with id strictly greater than `after_id`, in id order.
    fn read_forward(
        &self,
        stream: Stream,
        after_id: u64,
        limits: ReadLimits,
    ) -> Result<Vec<EncodedRow>, StorageError>;

    /// Highest id stored for the stream (0 when empty).
    fn max_id(&self, stream: Stream) -> Result<u64, StorageError>;

    /// Number of rows with id greater than `after_id`.
    fn count_after(&self, stream: Stream, after_id: u64) -> Result<u64, StorageError>;

    /// Persisted upstream delivery watermark.
    fn last_sent_id(&self, stream: Stream) -> Result<u64, StorageError>;

    /// Persist the delivery watermark; lower values are ignored.
    fn set_last_sent_id(&self, stream: Stream, id: u64) -> Result<(), StorageError>;

    /// Delete rows with id `<= id`. Returns the number deleted.
    fn delete_through(&self, stream: Stream, id: u64) -> Result<usize, StorageError>;

    /// Highest id after `after_id` whose row was written before `cutoff`
    /// (seconds since epoch).
    fn expire_before(
        &self,
        stream: Stream,
        after_id: u64,
        cutoff: u64,
    ) -> Result<Option<u64>, StorageError>;
}

/// SQLite-backed [`DurableStore`] holding one connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    tables: TableSet,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` with the default layout.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL; PRAGMA busy_timeout={};",
            busy_timeout.as_millis()
        ))?;
        info!(path = %path.display(), "Opened buffer database");
        Self::with_connection(conn, TableSet::default())
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?, TableSet::default())
    }

    /// Wrap an existing connection using a custom table layout.
    pub fn with_connection(conn: Connection, tables: TableSet) -> Result<Self, StorageError> {
        conn.execute_batch(&schema_sql(&tables))
            .map_err(|e| StorageError::Schema(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            tables,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// DDL for the tables in `tables` plus the watermark table.
#[must_use]
pub fn schema_sql(tables: &TableSet) -> String {
    let mut sql = String::from(
        "CREATE TABLE IF NOT EXISTS ids (
            table_name TEXT NOT NULL,
            field_name TEXT NOT NULL,
            nextid INTEGER NOT NULL,
            PRIMARY KEY (table_name, field_name)
        );\n",
    );
    for spec in tables.iter() {
        let _ = write!(sql, "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY", spec.table);
        for field in spec.fields {
            let default = match field.kind {
                FieldKind::Text => "''",
                FieldKind::UInt | FieldKind::Int => "0",
            };
            let _ = write!(
                sql,
                ", {} {} NOT NULL DEFAULT {default}",
                field.column,
                field.kind.sql_type()
            );
        }
        sql.push_str(", write_clock INTEGER NOT NULL DEFAULT 0);\n");
    }
    sql
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|v| v as i64))
            .map_or_else(|| SqlValue::Real(n.as_f64().unwrap_or(0.0)), SqlValue::Integer),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn insert_sql(spec: &TableSpec) -> String {
    let columns: Vec<&str> = spec.fields.iter().map(|f| f.column).collect();
    let placeholders: Vec<String> = (1..=columns.len() + 2).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO {} (id, {}, write_clock) VALUES ({})",
        spec.table,
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn select_sql(spec: &TableSpec) -> String {
    let columns: Vec<&str> = spec.fields.iter().map(|f| f.column).collect();
    format!(
        "SELECT id, write_clock, {} FROM {} WHERE id > ?1 AND id < ?2 ORDER BY id LIMIT ?3",
        columns.join(", "),
        spec.table
    )
}

impl DurableStore for SqliteStore {
    fn tables(&self) -> &TableSet {
        &self.tables
    }

    fn insert(&self, rows: &[DurableRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for row in rows {
            let spec = self.tables.get(row.record.stream());
            let columns = row.record.columns();
            let mut values = Vec::with_capacity(spec.fields.len() + 2);
            values.push(SqlValue::Integer(row.record.id() as i64));
            for field in spec.fields {
                let value = columns
                    .iter()
                    .find(|(name, _)| *name == field.column)
                    .map_or(SqlValue::Null, |(_, v)| to_sql(v));
                values.push(value);
            }
            values.push(SqlValue::Integer(row.write_clock as i64));
            tx.prepare_cached(&insert_sql(spec))?
                .execute(params_from_iter(values))?;
        }
        tx.commit()?;
        debug!(rows = rows.len(), "Inserted buffered rows");
        Ok(())
    }

    fn read_forward(
        &self,
        stream: Stream,
        after_id: u64,
        limits: ReadLimits,
    ) -> Result<Vec<EncodedRow>, StorageError> {
        let spec = self.tables.get(stream);
        let below = limits.below_id.map_or(i64::MAX, |id| id as i64);
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&select_sql(spec))?;
        let max_rows = i64::try_from(limits.max_rows).unwrap_or(i64::MAX);
        let mut rows = stmt.query(params![after_id as i64, below, max_rows])?;

        let mut out = Vec::new();
        let mut bytes = 0usize;
        while let Some(row) = rows.next()? {
            let id = row.get::<_, i64>(0)? as u64;
            let write_clock = row.get::<_, i64>(1)? as u64;
            let mut columns = Vec::with_capacity(spec.fields.len());
            for (i, field) in spec.fields.iter().enumerate() {
                let value = match field.kind {
                    FieldKind::UInt => Value::from(row.get::<_, i64>(i + 2)? as u64),
                    FieldKind::Int => Value::from(row.get::<_, i64>(i + 2)?),
                    FieldKind::Text => Value::from(row.get::<_, String>(i + 2)?),
                };
                columns.push((field.column, value));
            }
            let encoded = encode_row(spec, id, write_clock, &columns);
            let size = encoded.estimated_size();
            if !out.is_empty() && bytes + size > limits.max_bytes {
                break;
            }
            bytes += size;
            out.push(encoded);
        }
        Ok(out)
    }

    fn max_id(&self, stream: Stream) -> Result<u64, StorageError> {
        let spec = self.tables.get(stream);
        let conn = self.lock();
        let max: i64 = conn.query_row(
            &format!("SELECT COALESCE(MAX(id), 0) FROM {}", spec.table),
            [],
            |row| row.get(0),
        )?;
        Ok(max as u64)
    }

    fn count_after(&self, stream: Stream, after_id: u64) -> Result<u64, StorageError> {
        let spec = self.tables.get(stream);
        let conn = self.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE id > ?1", spec.table),
            [after_id as i64],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn last_sent_id(&self, stream: Stream) -> Result<u64, StorageError> {
        let spec = self.tables.get(stream);
        let conn = self.lock();
        let id: Option<i64> = conn
            .query_row(
                "SELECT nextid FROM ids WHERE table_name = ?1 AND field_name = ?2",
                params![spec.table, spec.lastid_field],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.unwrap_or(0) as u64)
    }

    fn set_last_sent_id(&self, stream: Stream, id: u64) -> Result<(), StorageError> {
        let spec = self.tables.get(stream);
        let conn = self.lock();
        conn.execute(
            "INSERT INTO ids (table_name, field_name, nextid) VALUES (?1, ?2, ?3)
             ON CONFLICT(table_name, field_name)
             DO UPDATE SET nextid = excluded.nextid WHERE excluded.nextid > ids.nextid",
            params![spec.table, spec.lastid_field, id as i64],
        )?;
        Ok(())
    }

    fn delete_through(&self, stream: Stream, id: u64) -> Result<usize, StorageError> {
        let spec = self.tables.get(stream);
        let conn = self.lock();
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE id <= ?1", spec.table),
            [id as i64],
        )?;
        Ok(deleted)
    }

    fn expire_before(
        &self,
        stream: Stream,
        after_id: u64,
        cutoff: u64,
    ) -> Result<Option<u64>, StorageError> {
        let spec = self.tables.get(stream);
        let conn = self.lock();
        let id: Option<i64> = conn.query_row(
            &format!(
                "SELECT MAX(id) FROM {} WHERE id > ?1 AND write_clock < ?2",
                spec.table
            ),
            params![after_id as i64, cutoff as i64],
            |row| row.get(0),
        )?;
        Ok(id.map(|id| id as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AutoregRecord, DiscoveryRecord, HistoryRecord, Timespec};

    fn history(id: u64, value: &str) -> DurableRow {
        let mut record = Record::from(HistoryRecord::new(10, Timespec::new(1_700_000_000, 1), value));
        record.set_id(id);
        DurableRow {
            record,
            write_clock: 1_000 + id,
        }
    }

    fn unlimited() -> ReadLimits {
        ReadLimits {
            below_id: None,
            max_rows: 1000,
            max_bytes: usize::MAX,
        }
    }

    #[test]
    fn insert_and_read_back_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(&[history(2, "b"), history(1, "a"), history(3, "c")])
            .unwrap();
        let rows = store.read_forward(Stream::History, 0, unlimited()).unwrap();
        let ids: Vec<u64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(rows[0].fields["value"], "a");
        assert_eq!(rows[0].fields["itemid"], 10);
        assert_eq!(rows[2].write_clock, 1_003);
    }

    #[test]
    fn read_respects_after_below_and_row_limit() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows: Vec<DurableRow> = (1..=10).map(|id| history(id, "v")).collect();
        store.insert(&rows).unwrap();

        let limits = ReadLimits {
            below_id: Some(8),
            max_rows: 3,
            max_bytes: usize::MAX,
        };
        let ids: Vec<u64> = store
            .read_forward(Stream::History, 4, limits)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![5, 6, 7]);

        let limits = ReadLimits {
            below_id: Some(8),
            ..unlimited()
        };
        assert_eq!(store.read_forward(Stream::History, 6, limits).unwrap().len(), 1);
    }

    #[test]
    fn byte_limit_always_returns_first_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(&[history(1, &"x".repeat(500)), history(2, "y")])
            .unwrap();
        let limits = ReadLimits {
            below_id: None,
            max_rows: 10,
            max_bytes: 10,
        };
        let rows = store.read_forward(Stream::History, 0, limits).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 1);
    }

    #[test]
    fn streams_use_separate_tables() {
        let store = SqliteStore::open_in_memory().unwrap();
        let discovery = DurableRow {
            record: Record::from(DiscoveryRecord {
                id: 1,
                ip: "192.168.0.5".into(),
                dns: "printer".into(),
                status: 1,
                clock: 50,
                ..DiscoveryRecord::default()
            }),
            write_clock: 50,
        };
        let autoreg = DurableRow {
            record: Record::from(AutoregRecord {
                id: 1,
                host: "agent-7".into(),
                ..AutoregRecord::default()
            }),
            write_clock: 50,
        };
        store.insert(&[discovery, autoreg, history(1, "v")]).unwrap();

        for stream in Stream::ALL {
            assert_eq!(store.max_id(stream).unwrap(), 1);
        }
        let rows = store.read_forward(Stream::Discovery, 0, unlimited()).unwrap();
        assert_eq!(rows[0].fields["dns"], "printer");
        assert_eq!(rows[0].fields["status"], 1);
        let rows = store.read_forward(Stream::Autoreg, 0, unlimited()).unwrap();
        assert_eq!(rows[0].fields["host"], "agent-7");
    }

    #[test]
    fn duplicate_id_fails_whole_transaction() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&[history(1, "a")]).unwrap();
        assert!(store.insert(&[history(2, "b"), history(1, "dup")]).is_err());
        assert_eq!(store.max_id(Stream::History).unwrap(), 1);
    }

    #[test]
    fn sent_watermark_is_monotonic() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.last_sent_id(Stream::History).unwrap(), 0);
        store.set_last_sent_id(Stream::History, 9).unwrap();
        store.set_last_sent_id(Stream::History, 4).unwrap();
        assert_eq!(store.last_sent_id(Stream::History).unwrap(), 9);
        assert_eq!(store.last_sent_id(Stream::Autoreg).unwrap(), 0);
    }

    #[test]
    fn delete_and_count() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows: Vec<DurableRow> = (1..=5).map(|id| history(id, "v")).collect();
        store.insert(&rows).unwrap();
        assert_eq!(store.count_after(Stream::History, 2).unwrap(), 3);
        assert_eq!(store.delete_through(Stream::History, 2).unwrap(), 2);
        assert_eq!(store.count_after(Stream::History, 0).unwrap(), 3);
    }

    #[test]
    fn expire_before_cutoff() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows: Vec<DurableRow> = (1..=5).map(|id| history(id, "v")).collect();
        store.insert(&rows).unwrap();
        // write_clock = 1000 + id
        assert_eq!(
            store.expire_before(Stream::History, 0, 1_004).unwrap(),
            Some(3)
        );
        assert_eq!(
            store.expire_before(Stream::History, 3, 1_004).unwrap(),
            None
        );
    }

    #[test]
    fn reopen_keeps_rows_and_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");
        {
            let store = SqliteStore::open(&path, Duration::from_millis(100)).unwrap();
            store.insert(&[history(1, "a"), history(2, "b")]).unwrap();
            store.set_last_sent_id(Stream::History, 1).unwrap();
        }
        let store = SqliteStore::open(&path, Duration::from_millis(100)).unwrap();
        assert_eq!(store.max_id(Stream::History).unwrap(), 2);
        assert_eq!(store.last_sent_id(Stream::History).unwrap(), 1);
    }
}
