//! Reconciliation of scraped public records into the canonical mptracker tables.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mpt_adapters::{
    committee_summaries_adapter, people_adapter, questions_adapter, SourceAdapter,
    COMMITTEE_SUMMARIES_SOURCE, PEOPLE_SOURCE, QUESTIONS_SOURCE,
};
use mpt_core::{FieldError, Store, StoreError};
use mpt_storage::SqliteStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span};
use uuid::Uuid;

mod identity;
mod jobs;
mod reconcile;
mod tables;

pub use identity::{name_tokens, IdentityResolver};
pub use jobs::{sync_committee_summaries, sync_people, sync_questions};
pub use reconcile::{
    BatchCounts, BatchSession, KeyTuple, Reconciled, Reconciler, DEFAULT_FLUSH_EVERY,
};
pub use tables::{dump_table, load_table, DumpOptions, ModelRegistry, TableHandle};

pub const CRATE_NAME: &str = "mpt-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{table} record is missing key field {field:?}")]
    MissingKeyField { table: &'static str, field: String },
    #[error("could not find {table} row with key={key}")]
    RowNotFound { table: &'static str, key: KeyTuple },
    #[error("cannot resolve person {name:?} (cdep_id {cdep_id:?})")]
    IdentityResolution { name: String, cdep_id: Option<i64> },
    #[error("no person with cdep_id {0}")]
    UnknownExternalId(i64),
    #[error("unknown table {0:?}")]
    UnknownTable(String),
    #[error("line {line}: {message}")]
    Decode { line: usize, message: String },
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    People,
    Questions,
    CommitteeSummaries,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::People => PEOPLE_SOURCE,
            SourceKind::Questions => QUESTIONS_SOURCE,
            SourceKind::CommitteeSummaries => COMMITTEE_SUMMARIES_SOURCE,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: SourceKind,
    pub enabled: bool,
    #[serde(default)]
    pub years: Vec<i32>,
    #[serde(default)]
    pub flush_every: Option<usize>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub fixtures_dir: PathBuf,
    pub flush_every: usize,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("MPT_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./mptracker.db")),
            fixtures_dir: std::env::var("MPT_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures")),
            flush_every: std::env::var("MPT_FLUSH_EVERY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_FLUSH_EVERY),
            workspace_root: std::env::var("MPT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.database_path)
            .with_context(|| format!("opening {}", self.database_path.display()))?;
        ModelRegistry::standard()
            .ensure_all(&mut store)
            .context("creating tables")?;
        Ok(store)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunSummary {
    pub source_id: SourceKind,
    pub year: i32,
    pub counts: BatchCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRunSummary>,
}

impl SyncRunSummary {
    pub fn totals(&self) -> BatchCounts {
        self.sources
            .iter()
            .fold(BatchCounts::default(), |acc, source| BatchCounts {
                created: acc.created + source.counts.created,
                updated: acc.updated + source.counts.updated,
                unchanged: acc.unchanged + source.counts.unchanged,
            })
    }
}

/// Fetch one year of `kind` from the fixture tree and reconcile it as one batch.
pub fn sync_source(
    store: &mut dyn Store,
    fixtures_dir: &Path,
    kind: SourceKind,
    year: i32,
    flush_every: usize,
) -> Result<BatchCounts> {
    let counts = match kind {
        SourceKind::People => {
            let people = people_adapter(fixtures_dir).fetch(year)?;
            sync_people(store, people, flush_every)?
        }
        SourceKind::Questions => {
            let questions = questions_adapter(fixtures_dir).fetch(year)?;
            sync_questions(store, questions, flush_every)?
        }
        SourceKind::CommitteeSummaries => {
            let summaries = committee_summaries_adapter(fixtures_dir).fetch(year)?;
            sync_committee_summaries(store, summaries, flush_every)?
        }
    };
    Ok(counts)
}

/// Run every enabled source in `sources.yaml`, in file order, against `store`.
pub fn run_sync_with_store(config: &SyncConfig, store: &mut dyn Store) -> Result<SyncRunSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let registry = SourceRegistry::load(&config.workspace_root)?;

    let mut sources = Vec::new();
    for source in registry.sources.iter().filter(|s| s.enabled) {
        let flush_every = source.flush_every.unwrap_or(config.flush_every);
        for &year in &source.years {
            let _span =
                info_span!("sync", run_id = %run_id, source = %source.source_id, year).entered();
            let counts = sync_source(
                store,
                &config.fixtures_dir,
                source.source_id,
                year,
                flush_every,
            )
            .with_context(|| format!("syncing {} for {year}", source.source_id))?;
            sources.push(SourceRunSummary {
                source_id: source.source_id,
                year,
                counts,
            });
        }
    }

    let summary = SyncRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        sources,
    };
    let totals = summary.totals();
    info!(
        run_id = %run_id,
        created = totals.created,
        updated = totals.updated,
        unchanged = totals.unchanged,
        "sync run complete"
    );
    Ok(summary)
}

pub fn run_sync(config: &SyncConfig) -> Result<SyncRunSummary> {
    let mut store = config.open_store()?;
    run_sync_with_store(config, &mut store)
}

pub fn run_sync_from_env() -> Result<SyncRunSummary> {
    run_sync(&SyncConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_registry_parses_kebab_case_ids() {
        let registry: SourceRegistry = serde_yaml::from_str(
            r#"
sources:
  - source_id: people
    enabled: true
    years: [2012]
  - source_id: committee-summaries
    enabled: false
    years: [2013]
    flush_every: 200
    notes: pdf text extracted upstream
"#,
        )
        .expect("yaml");
        assert_eq!(registry.sources[0].source_id, SourceKind::People);
        assert_eq!(registry.sources[1].source_id, SourceKind::CommitteeSummaries);
        assert_eq!(registry.sources[1].flush_every, Some(200));
        assert_eq!(registry.sources[1].source_id.to_string(), "committee-summaries");
    }

    #[test]
    fn unknown_source_id_is_rejected() {
        let parsed: Result<SourceRegistry, _> = serde_yaml::from_str(
            "sources:\n  - source_id: proposals\n    enabled: true\n",
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn run_summary_totals_sum_sources() {
        let summary = SyncRunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            sources: vec![
                SourceRunSummary {
                    source_id: SourceKind::People,
                    year: 2012,
                    counts: BatchCounts { created: 3, updated: 1, unchanged: 0 },
                },
                SourceRunSummary {
                    source_id: SourceKind::Questions,
                    year: 2013,
                    counts: BatchCounts { created: 0, updated: 2, unchanged: 5 },
                },
            ],
        };
        assert_eq!(summary.totals(), BatchCounts { created: 3, updated: 3, unchanged: 5 });
    }
}
