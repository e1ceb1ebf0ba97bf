//! Core domain model for the ISSN metadata sync pipeline.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "issnsync-core";

/// Provenance literal recorded on every persisted row: both upstream
/// services contribute fields to a single merged record.
pub const PROVENANCE: &str = "crossref+openalex";

/// Separator between field values in the fingerprint preimage. Not expected
/// to occur in any field value.
const FINGERPRINT_SEPARATOR: &str = "|";

/// Canonical rendering of a null field inside the fingerprint preimage.
/// The Postgres text-format null marker, chosen so a null field and a
/// genuinely empty string fingerprint differently. Changing this would
/// re-flag every persisted record as novel.
const NULL_MARKER: &str = "\\N";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IssnError {
    #[error("ISSN has wrong length: {0:?}")]
    Length(String),
    #[error("ISSN contains an invalid character: {0:?}")]
    Character(String),
}

/// Normalized serial identifier: four digits, hyphen, three digits, and a
/// check character that is a digit or `X`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Issn(String);

impl Issn {
    /// Parses and normalizes an identifier. Accepts `NNNN-NNNC` or the
    /// unhyphenated `NNNNNNNC`; whitespace is trimmed and a lowercase check
    /// character is uppercased.
    pub fn parse(raw: &str) -> Result<Self, IssnError> {
        let compact: Vec<char> = raw
            .trim()
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if compact.len() != 8 {
            return Err(IssnError::Length(raw.trim().to_string()));
        }
        let valid = compact
            .iter()
            .enumerate()
            .all(|(i, c)| c.is_ascii_digit() || (i == 7 && *c == 'X'));
        if !valid {
            return Err(IssnError::Character(raw.trim().to_string()));
        }

        let body: String = compact[..4].iter().collect();
        let tail: String = compact[4..].iter().collect();
        Ok(Self(format!("{body}-{tail}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Issn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Journal-level metadata extracted from the Crossref journals lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JournalMeta {
    pub title: Option<String>,
    pub publisher: Option<String>,
    pub subjects: Vec<String>,
    pub doi_prefix: Option<String>,
}

/// Source-level metadata extracted from the OpenAlex sources lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceMeta {
    pub country_code: Option<String>,
    pub is_oa: Option<bool>,
}

/// Outcome of one provider lookup. `Absent` means the upstream genuinely has
/// no record for the identifier; `Failed` means we could not find out
/// (timeout, unexpected status, malformed body). Record construction treats
/// both as missing data, but callers can log and count them separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    Found(T),
    Absent,
    Failed(String),
}

impl<T> FetchOutcome<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            FetchOutcome::Found(value) => Some(value),
            FetchOutcome::Absent | FetchOutcome::Failed(_) => None,
        }
    }
}

/// Merged view of one identifier on one run date. Field order here is the
/// insertion column order and the fingerprint preimage order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub issn: Issn,
    pub title: Option<String>,
    pub publisher: Option<String>,
    pub subjects: Option<String>,
    pub country: Option<String>,
    pub open_access: Option<bool>,
    pub doi_prefix: Option<String>,
    pub source: String,
    pub fetch_date: NaiveDate,
}

impl CanonicalRecord {
    /// Builds the merged record for one identifier. A provider that returned
    /// no data contributes nulls for all of its fields.
    pub fn merge(
        issn: Issn,
        journal: Option<JournalMeta>,
        source: Option<SourceMeta>,
        fetch_date: NaiveDate,
    ) -> Self {
        let (title, publisher, subjects, doi_prefix) = match journal {
            Some(j) => (j.title, j.publisher, Some(j.subjects.join(", ")), j.doi_prefix),
            None => (None, None, None, None),
        };
        let (country, open_access) = match source {
            Some(s) => (s.country_code, s.is_oa),
            None => (None, None),
        };

        Self {
            issn,
            title,
            publisher,
            subjects,
            country,
            open_access,
            doi_prefix,
            source: PROVENANCE.to_string(),
            fetch_date,
        }
    }

    /// Deterministic SHA-256 content fingerprint over the ordered field
    /// values, rendered as lowercase hex. Identical values (including
    /// identical nulls) always produce an identical digest; any single field
    /// change, including a null toggling to a value, changes it.
    pub fn fingerprint(&self) -> String {
        let fields = [
            Some(self.issn.as_str().to_string()),
            self.title.clone(),
            self.publisher.clone(),
            self.subjects.clone(),
            self.country.clone(),
            self.open_access.map(|b| b.to_string()),
            self.doi_prefix.clone(),
            Some(self.source.clone()),
            Some(self.fetch_date.format("%Y-%m-%d").to_string()),
        ];
        let preimage = fields
            .iter()
            .map(|v| v.as_deref().unwrap_or(NULL_MARKER))
            .collect::<Vec<_>>()
            .join(FINGERPRINT_SEPARATOR);

        let mut hasher = Sha256::new();
        hasher.update(preimage.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn into_fact_row(self) -> FactRow {
        let fingerprint = self.fingerprint();
        FactRow {
            record: self,
            fingerprint,
        }
    }
}

/// One prospective row of the append-only fact table: the merged record plus
/// its fingerprint. Rows are never updated or deleted by this system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRow {
    pub record: CanonicalRecord,
    pub fingerprint: String,
}
