//! Canonical public-records entities.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{field_table, Entity, FieldDef};

/// A legislator, or a non-member placeholder when `cdep_id` is unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: Uuid,
    pub name: Option<String>,
    pub cdep_id: Option<i64>,
    pub county_id: Option<Uuid>,
}

impl Person {
    pub fn placeholder(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::new_row()
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.cdep_id.is_none()
    }
}

impl fmt::Display for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_deref().unwrap_or("<unnamed>"))
    }
}

impl Entity for Person {
    const TABLE: &'static str = "person";

    fn fields() -> &'static [FieldDef<Self>] {
        field_table!(Person {
            id: Uuid,
            name: Option<String>,
            cdep_id: Option<i64>,
            county_id: Option<Uuid>,
        })
    }

    fn new_row() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            cdep_id: None,
            county_id: None,
        }
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct County {
    pub id: Uuid,
    pub name: Option<String>,
    pub geonames_code: Option<i64>,
}

impl fmt::Display for County {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_deref().unwrap_or("<unnamed>"))
    }
}

impl Entity for County {
    const TABLE: &'static str = "county";

    fn fields() -> &'static [FieldDef<Self>] {
        field_table!(County {
            id: Uuid,
            name: Option<String>,
            geonames_code: Option<i64>,
        })
    }

    fn new_row() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            geonames_code: None,
        }
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

/// A written or oral question addressed by a legislator to the government.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub number: Option<String>,
    pub date: Option<NaiveDate>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub pdf_url: Option<String>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub method: Option<String>,
    pub addressee: Option<String>,
    pub text: Option<String>,
    pub match_data: Option<String>,
    pub match_score: Option<f64>,
    pub person_id: Option<Uuid>,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let number = self.number.as_deref().unwrap_or("?");
        match self.date {
            Some(date) => write!(f, "{number}/{}", date.format("%Y-%m-%d")),
            None => write!(f, "{number}/?"),
        }
    }
}

impl Entity for Question {
    const TABLE: &'static str = "question";

    fn fields() -> &'static [FieldDef<Self>] {
        field_table!(Question {
            id: Uuid,
            number: Option<String>,
            date: Option<NaiveDate>,
            title: Option<String>,
            url: Option<String>,
            pdf_url: Option<String>,
            type_ as "type": Option<String>,
            method: Option<String>,
            addressee: Option<String>,
            text: Option<String>,
            match_data: Option<String>,
            match_score: Option<f64>,
            person_id: Option<Uuid>,
        })
    }

    fn new_row() -> Self {
        Self {
            id: Uuid::new_v4(),
            number: None,
            date: None,
            title: None,
            url: None,
            pdf_url: None,
            type_: None,
            method: None,
            addressee: None,
            text: None,
            match_data: None,
            match_score: None,
            person_id: None,
        }
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Summary of a committee sitting, published as a PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeSummary {
    pub id: Uuid,
    pub committee: Option<String>,
    pub pdf_url: Option<String>,
    pub date: Option<NaiveDate>,
    pub title: Option<String>,
    pub text: Option<String>,
}

impl Entity for CommitteeSummary {
    const TABLE: &'static str = "committee_summary";

    fn fields() -> &'static [FieldDef<Self>] {
        field_table!(CommitteeSummary {
            id: Uuid,
            committee: Option<String>,
            pdf_url: Option<String>,
            date: Option<NaiveDate>,
            title: Option<String>,
            text: Option<String>,
        })
    }

    fn new_row() -> Self {
        Self {
            id: Uuid::new_v4(),
            committee: None,
            pdf_url: None,
            date: None,
            title: None,
            text: None,
        }
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn placeholder_has_no_external_id() {
        let person = Person::placeholder("Ion Popescu");
        assert!(person.is_placeholder());
        assert_eq!(person.to_string(), "Ion Popescu");
    }

    #[test]
    fn question_display_uses_number_and_date() {
        let mut question = Question::new_row();
        question.number = Some("1234A".into());
        question.date = NaiveDate::from_ymd_opt(2013, 3, 12);
        assert_eq!(question.to_string(), "1234A/2013-03-12");
    }

    #[test]
    fn every_model_declares_id_first() {
        assert_eq!(Person::fields()[0].name, "id");
        assert_eq!(County::fields()[0].name, "id");
        assert_eq!(Question::fields()[0].name, "id");
        assert_eq!(CommitteeSummary::fields()[0].name, "id");
        let person = Person::new_row();
        assert_eq!(person.get("id"), Ok(Value::Id(person.id)));
    }
}
