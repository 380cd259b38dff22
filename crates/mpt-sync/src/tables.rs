//! Registry of the canonical tables plus JSON-lines load and dump.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use mpt_core::{
    CommitteeSummary, County, Entity, FieldError, Person, Question, Record, Store,
    TableSchema, Value,
};
use serde_json::{Map, Value as JsonValue};
use tracing::{info, info_span};

use crate::reconcile::{BatchCounts, Reconciler};
use crate::SyncError;

type LoadFn = fn(&mut dyn Store, &mut dyn BufRead, bool) -> Result<BatchCounts, SyncError>;

/// What the registry knows about one table.
#[derive(Clone, Copy)]
pub struct TableHandle {
    pub name: &'static str,
    pub schema: fn() -> TableSchema,
    load: LoadFn,
}

impl std::fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    tables: BTreeMap<&'static str, TableHandle>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register::<County>();
        registry.register::<Person>();
        registry.register::<Question>();
        registry.register::<CommitteeSummary>();
        registry
    }

    pub fn register<E: Entity>(&mut self) {
        self.tables.insert(
            E::TABLE,
            TableHandle {
                name: E::TABLE,
                schema: E::schema,
                load: load_rows::<E>,
            },
        );
    }

    pub fn get(&self, table: &str) -> Result<&TableHandle, SyncError> {
        self.tables
            .get(table)
            .ok_or_else(|| SyncError::UnknownTable(table.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tables.keys().copied()
    }

    pub fn ensure_all(&self, store: &mut dyn Store) -> Result<(), SyncError> {
        for handle in self.tables.values() {
            store.ensure_table(&(handle.schema)())?;
        }
        Ok(())
    }
}

/// Upsert JSON-lines rows into `table`, matching on `id`.
///
/// With `update_only`, a row whose id is not already stored fails the load.
pub fn load_table(
    registry: &ModelRegistry,
    store: &mut dyn Store,
    table: &str,
    mut reader: impl BufRead,
    update_only: bool,
) -> Result<BatchCounts, SyncError> {
    let handle = registry.get(table)?;
    let _span = info_span!("load_table", table = handle.name).entered();
    let counts = (handle.load)(store, &mut reader, update_only)?;
    info!(rows = counts.total(), "load finished");
    Ok(counts)
}

fn load_rows<E: Entity>(
    store: &mut dyn Store,
    reader: &mut dyn BufRead,
    update_only: bool,
) -> Result<BatchCounts, SyncError> {
    let schema = E::schema();
    let mut reconciler = Reconciler::<E>::new(store, &["id"])?;
    let mut session = reconciler.begin(store);
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = decode_row(&schema, &line).map_err(|message| SyncError::Decode {
            line: index + 1,
            message,
        })?;
        session.submit(&record, !update_only)?;
    }
    session.finish()
}

fn decode_row(schema: &TableSchema, line: &str) -> Result<Record, String> {
    let json: JsonValue = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let object = match json {
        JsonValue::Object(object) => object,
        other => return Err(format!("expected a JSON object, got {other}")),
    };
    object
        .iter()
        .map(|(name, value)| -> Result<(String, Value), String> {
            let column = schema
                .column(name)
                .ok_or_else(|| format!("{} has no column {name:?}", schema.name))?;
            Value::from_json(column.kind, value)
                .map(|v| (name.clone(), v))
                .map_err(|e| format!("{name}: {e}"))
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    /// Columns to write; empty means all.
    pub columns: Vec<String>,
    pub limit: Option<usize>,
    /// `name=value` keeps rows whose encoded value equals `value`; a bare
    /// `name` keeps rows where the column is not null.
    pub filters: Vec<String>,
}

struct Filter<'a> {
    column: &'a str,
    expected: Option<&'a str>,
}

impl Filter<'_> {
    fn matches(&self, row: &Record) -> bool {
        let value = row.get(self.column).unwrap_or(&Value::Null);
        match (self.expected, value.to_json()) {
            (_, JsonValue::Null) => false,
            (None, _) => true,
            (Some(expected), JsonValue::String(text)) => text == expected,
            (Some(expected), other) => other.to_string() == expected,
        }
    }
}

fn unknown_column(schema: &TableSchema, name: &str) -> SyncError {
    SyncError::Field(FieldError::UnknownField {
        table: schema.name,
        field: name.to_string(),
    })
}

/// Write rows of `table` as JSON lines with sorted keys, ordered by id.
/// Returns the number of rows written.
pub fn dump_table(
    registry: &ModelRegistry,
    store: &mut dyn Store,
    table: &str,
    options: &DumpOptions,
    mut writer: impl Write,
) -> Result<usize, SyncError> {
    let handle = registry.get(table)?;
    let schema = (handle.schema)();

    let columns: Vec<&str> = if options.columns.is_empty() {
        schema.columns.iter().map(|c| c.name).collect()
    } else {
        options
            .columns
            .iter()
            .map(|name| {
                schema
                    .column(name)
                    .map(|c| c.name)
                    .ok_or_else(|| unknown_column(&schema, name))
            })
            .collect::<Result<_, _>>()?
    };

    let filters = options
        .filters
        .iter()
        .map(|raw| {
            let (column, expected) = match raw.split_once('=') {
                Some((column, expected)) => (column, Some(expected)),
                None => (raw.as_str(), None),
            };
            schema
                .column(column)
                .map(|_| Filter { column, expected })
                .ok_or_else(|| unknown_column(&schema, column))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = store.query_rows(&schema)?;
    rows.sort_by_key(Record::id);

    let mut written = 0usize;
    for row in rows
        .iter()
        .filter(|row| filters.iter().all(|f| f.matches(row)))
        .take(options.limit.unwrap_or(usize::MAX))
    {
        let object: Map<String, JsonValue> = columns
            .iter()
            .map(|name| {
                let value = row.get(name).map(Value::to_json).unwrap_or(JsonValue::Null);
                (name.to_string(), value)
            })
            .collect();
        writeln!(writer, "{}", JsonValue::Object(object))?;
        written += 1;
    }
    Ok(written)
}
