//! One reconciliation batch per scraped source.

use std::collections::HashMap;

use mpt_adapters::{normalize_county_name, ScrapedPerson, ScrapedQuestion, ScrapedSummary};
use mpt_core::{query_all, CommitteeSummary, County, Entity, Person, Question, Record, Store};
use tracing::{info_span, warn};
use uuid::Uuid;

use crate::identity::IdentityResolver;
use crate::reconcile::{BatchCounts, Reconciler};
use crate::SyncError;

pub fn sync_people(
    store: &mut dyn Store,
    people: Vec<ScrapedPerson>,
    flush_every: usize,
) -> Result<BatchCounts, SyncError> {
    let _span = info_span!("sync_people", records = people.len()).entered();
    store.ensure_table(&County::schema())?;
    let counties: HashMap<String, Uuid> = query_all::<County>(store)?
        .into_iter()
        .filter_map(|county| county.name.map(|name| (name, county.id)))
        .collect();

    let records = people.into_iter().map(|person| {
        let mut record = Record::new()
            .with("cdep_id", person.cdep_id)
            .with("name", person.name);
        if let Some(raw) = person.county_name.filter(|raw| !raw.trim().is_empty()) {
            let name = normalize_county_name(&raw);
            match counties.get(&name) {
                Some(id) => {
                    record.insert("county_id", *id);
                }
                None => warn!(county = %name, "can't match county name"),
            }
        }
        record
    });

    Reconciler::<Person>::new(store, &["cdep_id"])?
        .with_flush_every(flush_every)
        .process_all(store, records, true)
}

fn question_record(question: ScrapedQuestion, person_id: Uuid) -> Record {
    Record::new()
        .with("number", question.number)
        .with("type", question.q_type)
        .with("method", question.method)
        .with("title", question.title)
        .with("url", question.url)
        .with("pdf_url", question.pdf_url)
        .with("addressee", question.addressee.join("; "))
        .with("date", question.date)
        .with("person_id", person_id)
}

/// Authors are resolved strictly: a question whose author cannot be matched
/// to a registered member aborts the whole batch.
pub fn sync_questions(
    store: &mut dyn Store,
    questions: Vec<ScrapedQuestion>,
    flush_every: usize,
) -> Result<BatchCounts, SyncError> {
    let _span = info_span!("sync_questions", records = questions.len()).entered();
    let mut resolver = IdentityResolver::new(store)?;
    let mut reconciler =
        Reconciler::<Question>::new(store, &["number", "date"])?.with_flush_every(flush_every);

    let mut session = reconciler.begin(store);
    for question in questions {
        let person_id = resolver
            .resolve(
                session.store_mut(),
                &question.person_name,
                question.person_cdep_id,
                true,
            )?
            .id;
        session.submit(&question_record(question, person_id), true)?;
    }
    session.finish()
}

pub fn sync_committee_summaries(
    store: &mut dyn Store,
    summaries: Vec<ScrapedSummary>,
    flush_every: usize,
) -> Result<BatchCounts, SyncError> {
    let _span = info_span!("sync_committee_summaries", records = summaries.len()).entered();
    let records = summaries.into_iter().map(|summary| {
        let mut record = Record::new()
            .with("committee", summary.committee)
            .with("pdf_url", summary.pdf_url)
            .with("date", summary.date)
            .with("title", summary.title);
        // text comes from a separate PDF extraction pass and may be absent
        if let Some(text) = summary.text {
            record.insert("text", text);
        }
        record
    });

    Reconciler::<CommitteeSummary>::new(store, &["pdf_url"])?
        .with_flush_every(flush_every)
        .process_all(store, records, true)
}
