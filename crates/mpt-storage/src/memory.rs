use std::collections::{BTreeMap, HashMap};

use mpt_core::{Record, Store, StoreError, TableSchema, Value};
use tracing::debug;
use uuid::Uuid;

type Table = BTreeMap<Uuid, Record>;

/// In-process store with the same visibility rules as a relational session:
/// staged rows are invisible until flushed, flushed rows are visible to queries
/// but discarded by `rollback`, and only `commit` makes them permanent.
#[derive(Debug, Default)]
pub struct MemoryStore {
    committed: HashMap<String, Table>,
    flushed: HashMap<String, Table>,
    pending: Vec<(String, Uuid, Record)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows that survived the last commit, ordered by id.
    pub fn committed_rows(&self, table: &str) -> Vec<Record> {
        self.committed
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn require_table(&self, table: &str) -> Result<(), StoreError> {
        if self.committed.contains_key(table) {
            Ok(())
        } else {
            Err(StoreError::UnknownTable(table.to_string()))
        }
    }
}

impl Store for MemoryStore {
    fn ensure_table(&mut self, schema: &TableSchema) -> Result<(), StoreError> {
        self.committed.entry(schema.name.to_string()).or_default();
        Ok(())
    }

    fn query_rows(&mut self, schema: &TableSchema) -> Result<Vec<Record>, StoreError> {
        self.require_table(schema.name)?;
        self.flush()?;
        let mut rows = self.committed.get(schema.name).cloned().unwrap_or_default();
        if let Some(overlay) = self.flushed.get(schema.name) {
            rows.extend(overlay.iter().map(|(id, row)| (*id, row.clone())));
        }
        Ok(rows.into_values().collect())
    }

    fn stage(&mut self, table: &str, id: Uuid, mut row: Record) -> Result<(), StoreError> {
        self.require_table(table)?;
        row.insert("id", Value::Id(id));
        self.pending.push((table.to_string(), id, row));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        for (table, id, row) in self.pending.drain(..) {
            self.flushed.entry(table).or_default().insert(id, row);
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        let mut written = 0usize;
        for (table, rows) in self.flushed.drain() {
            written += rows.len();
            self.committed.entry(table).or_default().extend(rows);
        }
        debug!(rows = written, "memory store commit");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let discarded = self.pending.len() + self.flushed.values().map(Table::len).sum::<usize>();
        self.pending.clear();
        self.flushed.clear();
        debug!(rows = discarded, "memory store rollback");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpt_core::{query_all, stage_entity, County, Entity};

    fn store_with_counties() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.ensure_table(&County::schema()).expect("ensure");
        store
    }

    #[test]
    fn staged_rows_become_visible_on_query_and_durable_on_commit() {
        let mut store = store_with_counties();
        let mut county = County::new_row();
        county.name = Some("Cluj".into());
        stage_entity(&mut store, &county).expect("stage");

        assert_eq!(store.pending_len(), 1);
        let visible: Vec<County> = query_all(&mut store).expect("query");
        assert_eq!(visible, vec![county.clone()]);
        assert!(store.committed_rows("county").is_empty());

        store.commit().expect("commit");
        assert_eq!(store.committed_rows("county").len(), 1);
    }

    #[test]
    fn rollback_discards_flushed_and_pending_rows() {
        let mut store = store_with_counties();
        let mut first = County::new_row();
        first.name = Some("Alba".into());
        stage_entity(&mut store, &first).expect("stage");
        store.flush().expect("flush");
        stage_entity(&mut store, &County::new_row()).expect("stage");

        store.rollback().expect("rollback");
        let visible: Vec<County> = query_all(&mut store).expect("query");
        assert!(visible.is_empty());
    }

    #[test]
    fn staging_into_missing_table_fails() {
        let mut store = MemoryStore::new();
        let err = stage_entity(&mut store, &County::new_row()).unwrap_err();
        assert!(matches!(err, StoreError::UnknownTable(t) if t == "county"));
    }

    #[test]
    fn restaging_replaces_the_row() {
        let mut store = store_with_counties();
        let mut county = County::new_row();
        county.name = Some("Arad".into());
        stage_entity(&mut store, &county).expect("stage");
        county.geonames_code = Some(686253);
        stage_entity(&mut store, &county).expect("restage");
        store.commit().expect("commit");

        let rows: Vec<County> = query_all(&mut store).expect("query");
        assert_eq!(rows, vec![county]);
    }
}
