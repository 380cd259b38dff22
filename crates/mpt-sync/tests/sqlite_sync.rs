use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use mpt_core::{query_all, Person, Question};
use mpt_storage::SqliteStore;
use mpt_sync::{
    dump_table, load_table, run_sync, BatchCounts, DumpOptions, ModelRegistry, SyncConfig,
};
use tempfile::TempDir;
use uuid::Uuid;

fn shipped_fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn copy_tree(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), target).unwrap();
        }
    }
}

/// Workspace with its own sources.yaml, a copy of the fixtures and a database
/// preloaded with the county table.
fn workspace() -> (TempDir, SyncConfig) {
    let dir = tempfile::tempdir().unwrap();
    copy_tree(&shipped_fixtures(), &dir.path().join("fixtures"));
    fs::copy(
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml"),
        dir.path().join("sources.yaml"),
    )
    .unwrap();

    let config = SyncConfig {
        database_path: dir.path().join("mptracker.db"),
        fixtures_dir: dir.path().join("fixtures"),
        flush_every: 2,
        workspace_root: dir.path().to_path_buf(),
    };

    let mut store = config.open_store().unwrap();
    let counties = fs::File::open(config.fixtures_dir.join("county.jsonl")).unwrap();
    let counts = load_table(
        &ModelRegistry::standard(),
        &mut store,
        "county",
        BufReader::new(counties),
        false,
    )
    .unwrap();
    assert_eq!(counts.created, 4);
    (dir, config)
}

#[test]
fn full_run_then_rerun_is_unchanged() {
    let (_dir, config) = workspace();

    let first = run_sync(&config).unwrap();
    assert_eq!(first.sources.len(), 3);
    assert_eq!(
        first.totals(),
        BatchCounts {
            created: 7,
            updated: 0,
            unchanged: 0
        }
    );

    let second = run_sync(&config).unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(
        second.totals(),
        BatchCounts {
            created: 0,
            updated: 0,
            unchanged: 7
        }
    );
}

#[test]
fn synced_people_link_counties_and_questions_link_people() {
    let (_dir, config) = workspace();
    run_sync(&config).unwrap();

    let mut store = SqliteStore::open(&config.database_path).unwrap();
    let people: Vec<Person> = query_all(&mut store).unwrap();
    let ana = people.iter().find(|p| p.cdep_id == Some(1)).unwrap();
    assert_eq!(
        ana.county_id,
        Some(Uuid::parse_str("2c1d9e77-6f0b-4a8e-b1d2-7e3f5a6b8c90").unwrap())
    );

    let popescu = people.iter().find(|p| p.cdep_id == Some(7)).unwrap();
    let questions: Vec<Question> = query_all(&mut store).unwrap();
    let question = questions
        .iter()
        .find(|q| q.number.as_deref() == Some("1234A"))
        .unwrap();
    assert_eq!(question.person_id, Some(popescu.id));
    assert!(people.iter().all(|p| !p.is_placeholder()));
}

#[test]
fn failed_question_batch_leaves_no_rows() {
    let (dir, config) = workspace();
    let bundle = config.fixtures_dir.join("questions/2013.json");
    let text = fs::read_to_string(&bundle)
        .unwrap()
        .replace("\"person_cdep_id\": 12", "\"person_cdep_id\": 99");
    fs::write(&bundle, text).unwrap();

    let err = run_sync(&config).unwrap_err();
    assert!(format!("{err:#}").contains("99"), "{err:#}");

    let mut store = SqliteStore::open(dir.path().join("mptracker.db")).unwrap();
    assert!(!store.in_transaction());
    let questions: Vec<Question> = query_all(&mut store).unwrap();
    assert!(questions.is_empty());
    // people ran in an earlier, committed batch
    let people: Vec<Person> = query_all(&mut store).unwrap();
    assert_eq!(people.len(), 3);
}

#[test]
fn dump_filters_committee_summaries_with_text() {
    let (_dir, config) = workspace();
    run_sync(&config).unwrap();

    let mut store = SqliteStore::open(&config.database_path).unwrap();
    let mut out = Vec::new();
    let options = DumpOptions {
        columns: vec!["committee".into(), "date".into()],
        filters: vec!["text".into()],
        limit: None,
    };
    let written = dump_table(
        &ModelRegistry::standard(),
        &mut store,
        "committee_summary",
        &options,
        &mut out,
    )
    .unwrap();
    assert_eq!(written, 1);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "{\"committee\":\"buget\",\"date\":\"2013-05-02\"}\n"
    );
}
