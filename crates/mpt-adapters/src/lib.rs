//! Source adapter contracts for the cdep.ro scrapers + fixture-first implementations.
//!
//! Page fetching and HTML/PDF parsing happen upstream; what crosses this
//! boundary is already-parsed records with dates as [`NaiveDate`].

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "mpt-adapters";

pub const PEOPLE_SOURCE: &str = "people";
pub const QUESTIONS_SOURCE: &str = "questions";
pub const COMMITTEE_SUMMARIES_SOURCE: &str = "committee-summaries";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("cannot derive committee code from pdf url {0:?}")]
    UnparseablePdfUrl(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A parliamentary question as scraped from the listing and detail pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedQuestion {
    pub number: String,
    #[serde(rename = "type")]
    pub q_type: String,
    #[serde(default)]
    pub method: Option<String>,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub addressee: Vec<String>,
    pub date: NaiveDate,
    pub person_name: String,
    #[serde(default)]
    pub person_cdep_id: Option<i64>,
}

/// A row of the deputies listing for one legislature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedPerson {
    pub cdep_id: i64,
    pub name: String,
    #[serde(default)]
    pub county_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedSummary {
    #[serde(default)]
    pub committee: Option<String>,
    pub pdf_url: String,
    pub date: NaiveDate,
    pub title: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Already-parsed output of one scraper run, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle<T> {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub records: Vec<T>,
}

pub trait SourceAdapter {
    type Item;

    fn source_id(&self) -> &'static str;

    fn fetch(&self, year: i32) -> Result<Vec<Self::Item>, AdapterError>;
}

pub fn load_fixture_bundle<T: DeserializeOwned>(
    path: impl AsRef<Path>,
) -> Result<FixtureBundle<T>> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Reads `<root>/<source_id>/<year>.json` bundles.
#[derive(Debug, Clone)]
pub struct FixtureAdapter<T> {
    source_id: &'static str,
    root: PathBuf,
    _item: PhantomData<fn() -> T>,
}

impl<T> FixtureAdapter<T> {
    pub fn new(source_id: &'static str, root: impl Into<PathBuf>) -> Self {
        Self {
            source_id,
            root: root.into(),
            _item: PhantomData,
        }
    }

    pub fn bundle_path(&self, year: i32) -> PathBuf {
        self.root.join(self.source_id).join(format!("{year}.json"))
    }
}

impl<T: DeserializeOwned> SourceAdapter for FixtureAdapter<T> {
    type Item = T;

    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn fetch(&self, year: i32) -> Result<Vec<T>, AdapterError> {
        let bundle: FixtureBundle<T> = load_fixture_bundle(self.bundle_path(year))?;
        if bundle.source_id != self.source_id {
            return Err(AdapterError::Message(format!(
                "bundle for {} handed to {} adapter",
                bundle.source_id, self.source_id
            )));
        }
        Ok(bundle.records)
    }
}

/// Summary bundles may leave `committee` out; it is recovered from the PDF url.
#[derive(Debug, Clone)]
pub struct CommitteeSummariesAdapter {
    inner: FixtureAdapter<ScrapedSummary>,
}

impl SourceAdapter for CommitteeSummariesAdapter {
    type Item = ScrapedSummary;

    fn source_id(&self) -> &'static str {
        self.inner.source_id()
    }

    fn fetch(&self, year: i32) -> Result<Vec<ScrapedSummary>, AdapterError> {
        self.inner
            .fetch(year)?
            .into_iter()
            .map(|mut summary| -> Result<ScrapedSummary, AdapterError> {
                if summary.committee.is_none() {
                    let code = committee_from_pdf_url(&summary.pdf_url)
                        .ok_or_else(|| AdapterError::UnparseablePdfUrl(summary.pdf_url.clone()))?;
                    summary.committee = Some(code.to_string());
                }
                Ok(summary)
            })
            .collect()
    }
}

pub fn people_adapter(root: impl Into<PathBuf>) -> FixtureAdapter<ScrapedPerson> {
    FixtureAdapter::new(PEOPLE_SOURCE, root)
}

pub fn questions_adapter(root: impl Into<PathBuf>) -> FixtureAdapter<ScrapedQuestion> {
    FixtureAdapter::new(QUESTIONS_SOURCE, root)
}

pub fn committee_summaries_adapter(root: impl Into<PathBuf>) -> CommitteeSummariesAdapter {
    CommitteeSummariesAdapter {
        inner: FixtureAdapter::new(COMMITTEE_SUMMARIES_SOURCE, root),
    }
}

pub fn parse_iso_date(text: &str) -> Result<NaiveDate, AdapterError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|e| AdapterError::Message(format!("invalid date {text:?}: {e}")))
}

/// Dates as printed in the cdep.ro listings, e.g. `04.06.2013`.
pub fn parse_listing_date(text: &str) -> Result<NaiveDate, AdapterError> {
    NaiveDate::parse_from_str(text.trim(), "%d.%m.%Y")
        .map_err(|e| AdapterError::Message(format!("invalid listing date {text:?}: {e}")))
}

/// Replace cedilla forms of s/t with the comma-below letters used in Romanian.
pub fn fix_local_chars(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'ş' => 'ș',
            'Ş' => 'Ș',
            'ţ' => 'ț',
            'Ţ' => 'Ț',
            other => other,
        })
        .collect()
}

/// Uppercase the first letter of every run of letters, lowercase the rest.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for ch in text.chars() {
        if in_word {
            out.extend(ch.to_lowercase());
        } else {
            out.extend(ch.to_uppercase());
        }
        in_word = ch.is_alphabetic();
    }
    out
}

/// County names as they appear in the canonical `county` table.
pub fn normalize_county_name(raw: &str) -> String {
    let name = fix_local_chars(&title_case(raw.trim()));
    if name == "Bistrița-Năsăud" {
        "Bistrița Năsăud".to_string()
    } else {
        name
    }
}

pub fn committee_from_pdf_url(url: &str) -> Option<&str> {
    const MARKER: &str = "cdep.ro/comisii/";
    let start = url.find(MARKER)? + MARKER.len();
    let (code, rest) = url[start..].split_once('/')?;
    if code.is_empty() || !rest.starts_with("pdf/") {
        return None;
    }
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cedillas_become_comma_below() {
        assert_eq!(fix_local_chars("Ştefan Ţepeş"), "Ștefan Țepeș");
    }

    #[test]
    fn county_names_are_title_cased_and_fixed() {
        assert_eq!(normalize_county_name("CONSTANŢA"), "Constanța");
        assert_eq!(normalize_county_name("BISTRIŢA-NĂSĂUD"), "Bistrița Năsăud");
        assert_eq!(normalize_county_name("caraş-severin"), "Caraș-Severin");
    }

    #[test]
    fn listing_dates_use_day_first_format() {
        let date = parse_listing_date("04.06.2013").expect("date");
        assert_eq!(date, NaiveDate::from_ymd_opt(2013, 6, 4).expect("date"));
        assert!(parse_listing_date("2013-06-04").is_err());
        assert_eq!(parse_iso_date("2013-06-04").expect("iso"), date);
    }

    #[test]
    fn committee_code_comes_from_pdf_path() {
        assert_eq!(
            committee_from_pdf_url("http://www.cdep.ro/comisii/buget/pdf/2013/rp437.pdf"),
            Some("buget")
        );
        assert_eq!(committee_from_pdf_url("http://www.cdep.ro/proiecte/bp/2013/pl346.pdf"), None);
        assert_eq!(committee_from_pdf_url("http://www.cdep.ro/comisii//pdf/x.pdf"), None);
    }

    #[test]
    fn bundle_path_is_per_source_and_year() {
        let adapter = questions_adapter("/data/fixtures");
        assert_eq!(
            adapter.bundle_path(2013),
            PathBuf::from("/data/fixtures/questions/2013.json")
        );
        assert_eq!(adapter.source_id(), QUESTIONS_SOURCE);
    }
}
