//! Keyed upsert of incoming records against the rows already in a table.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use mpt_core::{query_all, stage_entity, ColumnKind, Entity, FieldDef, Record, Store, Value};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Span};

use crate::SyncError;

pub const DEFAULT_FLUSH_EVERY: usize = 1000;

/// Ordered values of an entity's key fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyTuple(Vec<Value>);

impl KeyTuple {
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl From<Vec<Value>> for KeyTuple {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug)]
pub struct Reconciled<'a, E> {
    pub entity: &'a E,
    pub is_new: bool,
    pub is_changed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl BatchCounts {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged
    }

    fn record<E>(&mut self, result: &Reconciled<'_, E>) {
        if result.is_new {
            self.created += 1;
        } else if result.is_changed {
            self.updated += 1;
        } else {
            self.unchanged += 1;
        }
    }
}

/// Index of every `E` row in the store by its key tuple.
///
/// The index is built once in [`Reconciler::new`] and kept in step with the
/// store by `reconcile`; rows written to the table by anyone else afterwards
/// are not seen.
pub struct Reconciler<E: Entity> {
    key_defs: Vec<&'static FieldDef<E>>,
    index: HashMap<KeyTuple, E>,
    flush_every: usize,
}

impl<E: Entity> Reconciler<E> {
    pub fn new(store: &mut dyn Store, key_fields: &[&str]) -> Result<Self, SyncError> {
        let key_defs = key_fields
            .iter()
            .map(|name| E::field(name))
            .collect::<Result<Vec<_>, _>>()?;

        store.ensure_table(&E::schema())?;
        let mut index = HashMap::new();
        for row in query_all::<E>(store)? {
            let key = KeyTuple(key_defs.iter().map(|def| (def.get)(&row)).collect());
            match index.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(row);
                }
                Entry::Occupied(slot) => {
                    warn!(
                        table = E::TABLE,
                        key = %slot.key(),
                        id = %row.id(),
                        "duplicate key in stored rows; keeping first"
                    );
                }
            }
        }
        debug!(table = E::TABLE, rows = index.len(), "indexed existing rows");

        Ok(Self {
            key_defs,
            index,
            flush_every: DEFAULT_FLUSH_EVERY,
        })
    }

    /// Flush the store after every `n` submissions in a batch. `0` disables.
    pub fn with_flush_every(mut self, n: usize) -> Self {
        self.flush_every = n;
        self
    }

    pub fn flush_every(&self) -> usize {
        self.flush_every
    }

    pub fn key_fields(&self) -> Vec<&'static str> {
        self.key_defs.iter().map(|def| def.name).collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, key: &KeyTuple) -> Option<&E> {
        self.index.get(key)
    }

    fn key_of(&self, record: &Record) -> Result<KeyTuple, SyncError> {
        self.key_defs
            .iter()
            .map(|def| {
                record
                    .get(def.name)
                    .cloned()
                    .ok_or_else(|| SyncError::MissingKeyField {
                        table: E::TABLE,
                        field: def.name.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(KeyTuple)
    }

    /// Match `record` to the row with the same key and bring that row up to date.
    ///
    /// Every field in `record` is written when anything differs; fields not in
    /// `record` keep their current values.
    pub fn reconcile(
        &mut self,
        store: &mut dyn Store,
        record: &Record,
        create: bool,
    ) -> Result<Reconciled<'_, E>, SyncError> {
        let record = &normalized::<E>(record)?;
        let key = self.key_of(record)?;

        match self.index.entry(key) {
            Entry::Vacant(slot) => {
                if !create {
                    return Err(SyncError::RowNotFound {
                        table: E::TABLE,
                        key: slot.into_key(),
                    });
                }
                let mut row = E::new_row();
                apply(&mut row, record)?;
                stage_entity(store, &row)?;
                info!(table = E::TABLE, key = %slot.key(), "adding");
                Ok(Reconciled {
                    entity: slot.insert(row),
                    is_new: true,
                    is_changed: true,
                })
            }
            Entry::Occupied(slot) => {
                let mut is_changed = false;
                for (name, value) in record.iter() {
                    if E::get(slot.get(), name)? != *value {
                        is_changed = true;
                        break;
                    }
                }

                if is_changed {
                    let mut updated = slot.get().clone();
                    apply(&mut updated, record)?;
                    stage_entity(store, &updated)?;
                    info!(table = E::TABLE, key = %slot.key(), "updating");
                    let entity = slot.into_mut();
                    *entity = updated;
                    Ok(Reconciled {
                        entity,
                        is_new: false,
                        is_changed: true,
                    })
                } else {
                    debug!(table = E::TABLE, key = %slot.key(), "not touching");
                    Ok(Reconciled {
                        entity: slot.into_mut(),
                        is_new: false,
                        is_changed: false,
                    })
                }
            }
        }
    }

    /// Open a unit of work over `store`. It commits on [`BatchSession::finish`]
    /// and rolls back if dropped before that.
    pub fn begin<'a>(&'a mut self, store: &'a mut dyn Store) -> BatchSession<'a, E> {
        BatchSession {
            span: info_span!("batch", table = E::TABLE),
            reconciler: self,
            store,
            counts: BatchCounts::default(),
            submitted: 0,
            finished: false,
        }
    }

    pub fn process_all(
        &mut self,
        store: &mut dyn Store,
        records: impl IntoIterator<Item = Record>,
        create: bool,
    ) -> Result<BatchCounts, SyncError> {
        let mut session = self.begin(store);
        for record in records {
            session.submit(&record, create)?;
        }
        session.finish()
    }
}

/// Whole numbers given for real columns become floats, so they compare equal
/// to what the row already holds.
fn normalized<E: Entity>(record: &Record) -> Result<Record, SyncError> {
    record
        .iter()
        .map(|(name, value)| -> Result<(String, Value), SyncError> {
            let value = match (E::field(name)?.kind, value) {
                (ColumnKind::Real, Value::Int(v)) => Value::Float(*v as f64),
                _ => value.clone(),
            };
            Ok((name.to_string(), value))
        })
        .collect()
}

fn apply<E: Entity>(row: &mut E, record: &Record) -> Result<(), SyncError> {
    for (name, value) in record.iter() {
        row.set(name, value.clone())?;
    }
    Ok(())
}

pub struct BatchSession<'a, E: Entity> {
    span: Span,
    reconciler: &'a mut Reconciler<E>,
    store: &'a mut dyn Store,
    counts: BatchCounts,
    submitted: usize,
    finished: bool,
}

impl<'a, E: Entity> BatchSession<'a, E> {
    pub fn submit(
        &mut self,
        record: &Record,
        create: bool,
    ) -> Result<Reconciled<'_, E>, SyncError> {
        let _enter = self.span.enter();
        let every = self.reconciler.flush_every;
        let result = self.reconciler.reconcile(&mut *self.store, record, create)?;
        self.counts.record(&result);
        self.submitted += 1;

        if every > 0 && self.submitted % every == 0 {
            debug!(submitted = self.submitted, "flush checkpoint");
            self.store.flush()?;
        }
        Ok(result)
    }

    /// The store this session writes through, for collaborators that must
    /// write inside the same transaction.
    pub fn store_mut(&mut self) -> &mut dyn Store {
        &mut *self.store
    }

    pub fn counts(&self) -> BatchCounts {
        self.counts
    }

    pub fn finish(mut self) -> Result<BatchCounts, SyncError> {
        let _enter = self.span.clone().entered();
        self.store.commit()?;
        self.finished = true;
        info!(
            created = self.counts.created,
            updated = self.counts.updated,
            unchanged = self.counts.unchanged,
            "batch committed"
        );
        Ok(self.counts)
    }
}

impl<E: Entity> Drop for BatchSession<'_, E> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let _enter = self.span.enter();
        warn!(submitted = self.submitted, "batch abandoned before commit; rolling back");
        if let Err(err) = self.store.rollback() {
            warn!(error = %err, "rollback failed");
        }
    }
}
