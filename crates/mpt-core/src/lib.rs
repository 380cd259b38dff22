//! Canonical record model, typed entity accessors and the storage contract for mptracker.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

mod models;

pub use models::{CommitteeSummary, County, Person, Question};

pub const CRATE_NAME: &str = "mpt-core";

/// Storage-level type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Bool,
    Integer,
    Real,
    Text,
    Date,
    Id,
}

impl ColumnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKind::Bool => "bool",
            ColumnKind::Integer => "integer",
            ColumnKind::Real => "real",
            ColumnKind::Text => "text",
            ColumnKind::Date => "date",
            ColumnKind::Id => "id",
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field value as handed over by scrapers and stored by backends.
///
/// Floats compare and hash by bit pattern so that any value, including one
/// taken from a `Real` column, can take part in a key tuple.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Id(Uuid),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "real",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::Id(_) => "id",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// JSON encoding used by table dumps: dates as ISO strings, ids as hyphenated strings.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(v) => JsonValue::Bool(*v),
            Value::Int(v) => JsonValue::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(v) => JsonValue::String(v.clone()),
            Value::Date(v) => JsonValue::String(v.format("%Y-%m-%d").to_string()),
            Value::Id(v) => JsonValue::String(v.to_string()),
        }
    }

    /// Decode a JSON value for a column of the given kind. `null` is accepted for every kind.
    pub fn from_json(kind: ColumnKind, json: &JsonValue) -> Result<Value, String> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = || format!("expected {kind}, got {json}");
        match kind {
            ColumnKind::Bool => json.as_bool().map(Value::Bool).ok_or_else(mismatch),
            ColumnKind::Integer => json.as_i64().map(Value::Int).ok_or_else(mismatch),
            ColumnKind::Real => json.as_f64().map(Value::Float).ok_or_else(mismatch),
            ColumnKind::Text => json
                .as_str()
                .map(|s| Value::Text(s.to_string()))
                .ok_or_else(mismatch),
            ColumnKind::Date => {
                let text = json.as_str().ok_or_else(mismatch)?;
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .map(Value::Date)
                    .map_err(|e| format!("invalid date {text:?}: {e}"))
            }
            ColumnKind::Id => {
                let text = json.as_str().ok_or_else(mismatch)?;
                Uuid::parse_str(text)
                    .map(Value::Id)
                    .map_err(|e| format!("invalid id {text:?}: {e}"))
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Id(a), Value::Id(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Text(v) => v.hash(state),
            Value::Date(v) => v.hash(state),
            Value::Id(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v:?}"),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::Id(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Id(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One unit of freshly scraped data: field name to value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn id(&self) -> Option<Uuid> {
        match self.fields.get("id") {
            Some(Value::Id(id)) => Some(*id),
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("{table} has no field named {field:?}")]
    UnknownField { table: &'static str, field: String },
    #[error("{table}.{field} expects {expected}, got {found}")]
    TypeMismatch {
        table: &'static str,
        field: String,
        expected: ColumnKind,
        found: &'static str,
    },
}

/// Conversion between a Rust field type and [`Value`].
pub trait FieldValue: Sized {
    const KIND: ColumnKind;

    fn into_value(self) -> Value;

    /// Returns the rejected value when it does not fit this type.
    fn from_value(value: Value) -> Result<Self, Value>;
}

impl FieldValue for bool {
    const KIND: ColumnKind = ColumnKind::Bool;

    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Bool(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl FieldValue for i64 {
    const KIND: ColumnKind = ColumnKind::Integer;

    fn into_value(self) -> Value {
        Value::Int(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Int(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl FieldValue for f64 {
    const KIND: ColumnKind = ColumnKind::Real;

    fn into_value(self) -> Value {
        Value::Float(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Float(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl FieldValue for String {
    const KIND: ColumnKind = ColumnKind::Text;

    fn into_value(self) -> Value {
        Value::Text(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Text(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl FieldValue for NaiveDate {
    const KIND: ColumnKind = ColumnKind::Date;

    fn into_value(self) -> Value {
        Value::Date(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Date(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl FieldValue for Uuid {
    const KIND: ColumnKind = ColumnKind::Id;

    fn into_value(self) -> Value {
        Value::Id(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Id(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const KIND: ColumnKind = T::KIND;

    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Accessor table entry: one declared field of an entity type.
pub struct FieldDef<E: 'static> {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub get: fn(&E) -> Value,
    pub set: fn(&mut E, Value) -> Result<(), Value>,
}

impl<E: 'static> fmt::Debug for FieldDef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Builds a static accessor table for an entity struct.
///
/// ```ignore
/// fn fields() -> &'static [FieldDef<Question>] {
///     field_table!(Question { id: Uuid, type_ as "type": Option<String> })
/// }
/// ```
#[macro_export]
macro_rules! field_table {
    ($entity:ty { $($field:ident $(as $column:literal)? : $ty:ty),+ $(,)? }) => {{
        static FIELDS: &[$crate::FieldDef<$entity>] = &[
            $(
                $crate::FieldDef {
                    name: $crate::field_table!(@name $field $($column)?),
                    kind: <$ty as $crate::FieldValue>::KIND,
                    get: |entity: &$entity| -> $crate::Value {
                        $crate::FieldValue::into_value(::std::clone::Clone::clone(&entity.$field))
                    },
                    set: |entity: &mut $entity, value: $crate::Value| -> ::std::result::Result<(), $crate::Value> {
                        entity.$field = <$ty as $crate::FieldValue>::from_value(value)?;
                        Ok(())
                    },
                },
            )+
        ];
        FIELDS
    }};
    (@name $field:ident $column:literal) => {
        $column
    };
    (@name $field:ident) => {
        stringify!($field)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A canonical entity type with a fixed, enumerable set of fields.
///
/// Every entity carries an `id` field holding its backing-store identifier.
pub trait Entity: Clone + fmt::Debug + Send + 'static {
    const TABLE: &'static str;

    fn fields() -> &'static [FieldDef<Self>];

    /// A fresh in-memory row with a new identifier and every other field unset.
    fn new_row() -> Self;

    fn id(&self) -> Uuid;

    fn field(name: &str) -> Result<&'static FieldDef<Self>, FieldError> {
        Self::fields()
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| FieldError::UnknownField {
                table: Self::TABLE,
                field: name.to_string(),
            })
    }

    fn get(&self, name: &str) -> Result<Value, FieldError> {
        Self::field(name).map(|def| (def.get)(self))
    }

    fn set(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        let def = Self::field(name)?;
        (def.set)(self, value).map_err(|rejected| FieldError::TypeMismatch {
            table: Self::TABLE,
            field: name.to_string(),
            expected: def.kind,
            found: rejected.kind_name(),
        })
    }

    fn to_record(&self) -> Record {
        Self::fields()
            .iter()
            .map(|def| (def.name.to_string(), (def.get)(self)))
            .collect()
    }

    fn from_record(record: &Record) -> Result<Self, FieldError> {
        let mut row = Self::new_row();
        for (name, value) in record.iter() {
            row.set(name, value.clone())?;
        }
        Ok(row)
    }

    fn schema() -> TableSchema {
        TableSchema {
            name: Self::TABLE,
            columns: Self::fields()
                .iter()
                .map(|def| Column {
                    name: def.name,
                    kind: def.kind,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("could not decode {table} row: {source}")]
    Decode {
        table: String,
        #[source]
        source: FieldError,
    },
    #[error("unknown table {0:?}")]
    UnknownTable(String),
}

/// Transactional relational store the reconciliation core writes through.
///
/// Writes go through a pending set (`stage`), become visible inside the open
/// transaction on `flush`, and become durable on `commit`.
pub trait Store: Send {
    fn ensure_table(&mut self, schema: &TableSchema) -> Result<(), StoreError>;

    /// All rows visible in the current transaction. Pending writes are flushed first.
    fn query_rows(&mut self, schema: &TableSchema) -> Result<Vec<Record>, StoreError>;

    /// Register an insert-or-replace of the full row `id` in `table`.
    fn stage(&mut self, table: &str, id: Uuid, row: Record) -> Result<(), StoreError>;

    fn flush(&mut self) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;
}

pub fn query_all<E: Entity>(store: &mut dyn Store) -> Result<Vec<E>, StoreError> {
    store
        .query_rows(&E::schema())?
        .iter()
        .map(|row| {
            E::from_record(row).map_err(|source| StoreError::Decode {
                table: E::TABLE.to_string(),
                source,
            })
        })
        .collect()
}

pub fn stage_entity<E: Entity>(store: &mut dyn Store, entity: &E) -> Result<(), StoreError> {
    store.stage(E::TABLE, entity.id(), entity.to_record())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn floats_hash_and_compare_by_bits() {
        let mut seen = HashSet::new();
        seen.insert(Value::Float(0.5));
        assert!(seen.contains(&Value::Float(0.5)));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn set_with_wrong_kind_is_rejected_and_leaves_field_untouched() {
        let mut person = Person::new_row();
        person.set("name", Value::from("Jane Doe")).expect("set name");
        let err = person.set("name", Value::Int(3)).unwrap_err();
        assert_eq!(
            err,
            FieldError::TypeMismatch {
                table: "person",
                field: "name".into(),
                expected: ColumnKind::Text,
                found: "integer",
            }
        );
        assert_eq!(person.name.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn unknown_field_is_reported_with_table() {
        let person = Person::new_row();
        let err = person.get("shoe_size").unwrap_err();
        assert!(matches!(err, FieldError::UnknownField { table: "person", .. }));
    }

    #[test]
    fn renamed_column_is_exposed_under_column_name() {
        let mut question = Question::new_row();
        question.set("type", Value::from("interpelare")).expect("set type");
        assert_eq!(question.type_.as_deref(), Some("interpelare"));
        assert!(Question::schema().column("type").is_some());
        assert!(Question::schema().column("type_").is_none());
    }

    #[test]
    fn record_round_trips_through_entity() {
        let date = NaiveDate::from_ymd_opt(2013, 5, 2).expect("date");
        let mut summary = CommitteeSummary::new_row();
        summary.pdf_url = Some("http://www.cdep.ro/comisii/juridica/pdf/2013/rp123.pdf".into());
        summary.date = Some(date);
        let back = CommitteeSummary::from_record(&summary.to_record()).expect("decode");
        assert_eq!(back, summary);
    }

    #[test]
    fn json_codec_handles_dates_and_nulls() {
        let date = NaiveDate::from_ymd_opt(2013, 11, 4).expect("date");
        let json = Value::Date(date).to_json();
        assert_eq!(json, JsonValue::String("2013-11-04".into()));
        assert_eq!(Value::from_json(ColumnKind::Date, &json), Ok(Value::Date(date)));
        assert_eq!(Value::from_json(ColumnKind::Integer, &JsonValue::Null), Ok(Value::Null));
        assert!(Value::from_json(ColumnKind::Integer, &JsonValue::String("x".into())).is_err());
    }
}
