use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use mpt_core::{query_all, stage_entity, Entity, Person, Store};
use strsim::jaro_winkler;
use tracing::{debug, info, warn};

use crate::SyncError;

/// Name pieces split on whitespace and hyphens, so that word order and
/// hyphenated double names do not matter.
pub fn name_tokens(name: &str) -> BTreeSet<&str> {
    name.split(|c: char| c.is_whitespace() || c == '-')
        .filter(|token| !token.is_empty())
        .collect()
}

/// Matches scraped author references to `Person` rows.
pub struct IdentityResolver {
    by_cdep_id: HashMap<i64, Person>,
    placeholders: HashMap<String, Person>,
}

impl IdentityResolver {
    pub fn new(store: &mut dyn Store) -> Result<Self, SyncError> {
        store.ensure_table(&Person::schema())?;
        let mut by_cdep_id = HashMap::new();
        let mut placeholders = HashMap::new();
        for person in query_all::<Person>(store)? {
            match (person.cdep_id, person.name.clone()) {
                (Some(cdep_id), _) => match by_cdep_id.entry(cdep_id) {
                    Entry::Vacant(slot) => {
                        slot.insert(person);
                    }
                    Entry::Occupied(_) => {
                        warn!(
                            cdep_id,
                            id = %person.id,
                            "duplicate cdep_id in stored people; keeping first"
                        );
                    }
                },
                (None, Some(name)) => {
                    placeholders.entry(name).or_insert(person);
                }
                (None, None) => {}
            }
        }
        debug!(
            members = by_cdep_id.len(),
            placeholders = placeholders.len(),
            "loaded people"
        );
        Ok(Self {
            by_cdep_id,
            placeholders,
        })
    }

    pub fn member(&self, cdep_id: i64) -> Option<&Person> {
        self.by_cdep_id.get(&cdep_id)
    }

    /// Find the person behind `name` and an optional `cdep_id`.
    ///
    /// A known id whose registered name has the same tokens wins. Otherwise
    /// strict mode fails, and non-strict mode falls back to the placeholder
    /// with exactly this name, creating and flushing it if needed. An id that
    /// nobody has fails in both modes.
    pub fn resolve(
        &mut self,
        store: &mut dyn Store,
        name: &str,
        cdep_id: Option<i64>,
        strict: bool,
    ) -> Result<&Person, SyncError> {
        if let Some(id) = cdep_id {
            let candidate = self
                .by_cdep_id
                .get(&id)
                .ok_or(SyncError::UnknownExternalId(id))?;
            let registered = candidate.name.as_deref().unwrap_or_default();
            if name_tokens(registered) == name_tokens(name) {
                return Ok(candidate);
            }
            if !strict {
                warn!(
                    cdep_id = id,
                    registered,
                    scraped = name,
                    similarity = jaro_winkler(registered, name),
                    "name does not match registered member; using placeholder"
                );
            }
        }

        if strict {
            return Err(SyncError::IdentityResolution {
                name: name.to_string(),
                cdep_id,
            });
        }

        match self.placeholders.entry(name.to_string()) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let person = Person::placeholder(name);
                stage_entity(store, &person)?;
                store.flush()?;
                info!(name, id = %person.id, "created placeholder person");
                Ok(slot.insert(person))
            }
        }
    }
}
