use std::path::Path;

use chrono::NaiveDate;
use mpt_core::{ColumnKind, Record, Store, StoreError, TableSchema, Value};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, warn};
use uuid::Uuid;

/// SQLite-backed store. One connection, one open transaction at a time.
///
/// The transaction is opened lazily by the first flush that has rows to write
/// and stays open until `commit` or `rollback`.
pub struct SqliteStore {
    conn: Connection,
    pending: Vec<(String, Record)>,
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Bool | ColumnKind::Integer => "INTEGER",
        ColumnKind::Real => "REAL",
        ColumnKind::Text | ColumnKind::Date | ColumnKind::Id => "TEXT",
    }
}

fn encode(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(v) => SqlValue::Integer(i64::from(*v)),
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Float(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Date(v) => SqlValue::Text(v.format("%Y-%m-%d").to_string()),
        Value::Id(v) => SqlValue::Text(v.to_string()),
    }
}

fn decode(table: &str, column: &str, kind: ColumnKind, raw: SqlValue) -> Result<Value, StoreError> {
    let value = match (kind, raw) {
        (_, SqlValue::Null) => Value::Null,
        (ColumnKind::Bool, SqlValue::Integer(v)) => Value::Bool(v != 0),
        (ColumnKind::Integer, SqlValue::Integer(v)) => Value::Int(v),
        (ColumnKind::Real, SqlValue::Real(v)) => Value::Float(v),
        (ColumnKind::Real, SqlValue::Integer(v)) => Value::Float(v as f64),
        (ColumnKind::Text, SqlValue::Text(v)) => Value::Text(v),
        (ColumnKind::Date, SqlValue::Text(v)) => NaiveDate::parse_from_str(&v, "%Y-%m-%d")
            .map(Value::Date)
            .map_err(|e| StoreError::Backend(format!("{table}.{column}: bad date {v:?}: {e}")))?,
        (ColumnKind::Id, SqlValue::Text(v)) => Uuid::parse_str(&v)
            .map(Value::Id)
            .map_err(|e| StoreError::Backend(format!("{table}.{column}: bad id {v:?}: {e}")))?,
        (kind, other) => {
            return Err(StoreError::Backend(format!(
                "{table}.{column}: expected {kind}, found {:?}",
                other.data_type()
            )))
        }
    };
    Ok(value)
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(backend)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(backend)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Connection::open_in_memory()
            .map(Self::from_connection)
            .map_err(backend)
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            pending: Vec::new(),
        }
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn begin_if_needed(&mut self) -> Result<(), StoreError> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE").map_err(backend)?;
        }
        Ok(())
    }

    fn upsert(&self, table: &str, row: &Record) -> Result<(), StoreError> {
        let columns: Vec<&str> = row.iter().map(|(name, _)| name).collect();
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns
            .iter()
            .filter(|c| **c != "id")
            .map(|c| format!("{col} = excluded.{col}", col = quote(c)))
            .collect::<Vec<_>>();
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
            quote(table),
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            placeholders,
            quote("id"),
            conflict
        );
        let mut stmt = self.conn.prepare_cached(&sql).map_err(backend)?;
        stmt.execute(params_from_iter(row.iter().map(|(_, v)| encode(v))))
            .map_err(backend)?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn ensure_table(&mut self, schema: &TableSchema) -> Result<(), StoreError> {
        let columns = schema
            .columns
            .iter()
            .map(|c| {
                if c.name == "id" {
                    format!("{} {} PRIMARY KEY NOT NULL", quote(c.name), sql_type(c.kind))
                } else {
                    format!("{} {}", quote(c.name), sql_type(c.kind))
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", quote(schema.name), columns);
        self.conn.execute_batch(&sql).map_err(backend)
    }

    fn query_rows(&mut self, schema: &TableSchema) -> Result<Vec<Record>, StoreError> {
        self.flush()?;
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            schema
                .columns
                .iter()
                .map(|c| quote(c.name))
                .collect::<Vec<_>>()
                .join(", "),
            quote(schema.name),
            quote("id")
        );
        let mut stmt = self.conn.prepare(&sql).map_err(backend)?;
        let raw_rows = stmt
            .query_map([], |row| {
                (0..schema.columns.len())
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;

        raw_rows
            .into_iter()
            .map(|raw| {
                schema
                    .columns
                    .iter()
                    .zip(raw)
                    .map(|(col, value)| {
                        decode(schema.name, col.name, col.kind, value)
                            .map(|v| (col.name.to_string(), v))
                    })
                    .collect::<Result<Record, StoreError>>()
            })
            .collect()
    }

    fn stage(&mut self, table: &str, id: Uuid, mut row: Record) -> Result<(), StoreError> {
        row.insert("id", Value::Id(id));
        self.pending.push((table.to_string(), row));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.begin_if_needed()?;
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for (table, row) in &pending {
            self.upsert(table, row)?;
        }
        debug!(rows = count, "sqlite flush");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        if self.in_transaction() {
            self.conn.execute_batch("COMMIT").map_err(backend)?;
            debug!("sqlite commit");
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.pending.clear();
        if self.in_transaction() {
            self.conn.execute_batch("ROLLBACK").map_err(backend)?;
            debug!("sqlite rollback");
        }
        Ok(())
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if self.in_transaction() {
            warn!("sqlite store dropped with an open transaction; rolling back");
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpt_core::{query_all, stage_entity, Column, Entity, Person};
    use tempfile::tempdir;

    fn every_kind_schema() -> TableSchema {
        TableSchema {
            name: "sample",
            columns: vec![
                Column { name: "id", kind: ColumnKind::Id },
                Column { name: "flag", kind: ColumnKind::Bool },
                Column { name: "count", kind: ColumnKind::Integer },
                Column { name: "score", kind: ColumnKind::Real },
                Column { name: "type", kind: ColumnKind::Text },
                Column { name: "day", kind: ColumnKind::Date },
            ],
        }
    }

    #[test]
    fn round_trips_every_column_kind() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        let schema = every_kind_schema();
        store.ensure_table(&schema).expect("ensure");

        let id = Uuid::new_v4();
        let row = Record::new()
            .with("flag", true)
            .with("count", 42i64)
            .with("score", 0.75)
            .with("type", "interpelare")
            .with("day", NaiveDate::from_ymd_opt(2013, 2, 1).expect("date"));
        store.stage("sample", id, row.clone()).expect("stage");
        store.commit().expect("commit");

        let rows = store.query_rows(&schema).expect("query");
        assert_eq!(rows, vec![row.with("id", id)]);
    }

    #[test]
    fn rollback_discards_flushed_rows() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        store.ensure_table(&Person::schema()).expect("ensure");
        stage_entity(&mut store, &Person::placeholder("Ion Ionescu")).expect("stage");
        store.flush().expect("flush");
        assert!(store.in_transaction());
        assert_eq!(query_all::<Person>(&mut store).expect("query").len(), 1);

        store.rollback().expect("rollback");
        assert!(!store.in_transaction());
        assert!(query_all::<Person>(&mut store).expect("query").is_empty());
    }

    #[test]
    fn committed_rows_survive_reopen_and_uncommitted_do_not() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mptracker.db");
        let kept = Person::placeholder("Maria Pop");
        {
            let mut store = SqliteStore::open(&path).expect("open");
            store.ensure_table(&Person::schema()).expect("ensure");
            stage_entity(&mut store, &kept).expect("stage");
            store.commit().expect("commit");
            stage_entity(&mut store, &Person::placeholder("Dropped")).expect("stage");
            store.flush().expect("flush");
        }

        let mut store = SqliteStore::open(&path).expect("reopen");
        let people: Vec<Person> = query_all(&mut store).expect("query");
        assert_eq!(people, vec![kept]);
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        store.ensure_table(&Person::schema()).expect("ensure");
        let mut person = Person::placeholder("Ana Blandiana");
        stage_entity(&mut store, &person).expect("stage");
        store.commit().expect("commit");

        person.cdep_id = Some(12);
        stage_entity(&mut store, &person).expect("restage");
        store.commit().expect("commit");

        let people: Vec<Person> = query_all(&mut store).expect("query");
        assert_eq!(people, vec![person]);
    }
}
