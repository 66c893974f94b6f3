//! Core domain model for GSF.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "gsf-core";

pub const DEFAULT_TITLE: &str = "Untitled Program";
pub const DEFAULT_ORGANIZATION: &str = "Unknown Organization";
pub const DEFAULT_SUPPORT: &str = "Not specified";
pub const DEFAULT_FUNDING_TYPE: &str = "Not specified Funding Type";
pub const DEFAULT_APPLY_LINK: &str = "#";

/// Loosely typed scalar as produced by feed ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RawValue {
    /// Render the scalar back as the string the feed carried.
    pub fn as_text(&self) -> String {
        match self {
            RawValue::Bool(value) => value.to_string(),
            RawValue::Integer(value) => value.to_string(),
            RawValue::Float(value) => value.to_string(),
            RawValue::Text(value) => value.clone(),
        }
    }
}

/// One ingested row: trimmed column label mapped to a scalar. Ephemeral;
/// consumed by a normalizer and then discarded.
pub type RawRecord = BTreeMap<String, RawValue>;

/// Text content of a column, with empty values treated as absent.
pub fn record_text(record: &RawRecord, column: &str) -> Option<String> {
    record
        .get(column)
        .map(RawValue::as_text)
        .filter(|text| !text.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemeStatus {
    Open,
    Closed,
    Unknown,
}

impl SchemeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemeStatus::Open => "Open",
            SchemeStatus::Closed => "Closed",
            SchemeStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for SchemeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A funding opportunity. Status is derived from the deadline at an
/// evaluation instant and never stored on the entity: an open scheme
/// silently becomes closed as time passes without any write occurring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scheme {
    pub title: String,
    pub organization: String,
    pub focus_areas: Vec<String>,
    pub support: String,
    pub funding_type: String,
    pub deadline: Option<NaiveDate>,
    pub apply_link: String,
}

impl Scheme {
    /// `Unknown` without a deadline; `Closed` iff the deadline is strictly
    /// before `today`, so a deadline equal to today still counts as open.
    pub fn status_on(&self, today: NaiveDate) -> SchemeStatus {
        match self.deadline {
            None => SchemeStatus::Unknown,
            Some(deadline) if deadline < today => SchemeStatus::Closed,
            Some(_) => SchemeStatus::Open,
        }
    }

    pub fn is_open_on(&self, today: NaiveDate) -> bool {
        self.status_on(today) == SchemeStatus::Open
    }
}

/// A subscriber's standing request to be told when a specific scheme
/// (by program + organization) becomes open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub name: String,
    pub email: String,
    pub program: String,
    pub organization: String,
}

impl NotificationRequest {
    /// Dedup and dispatch identity: casefolded email plus the exact
    /// program and organization strings.
    pub fn identity_key(&self) -> (String, String, String) {
        (
            normalize_email(&self.email).unwrap_or_default(),
            self.program.clone(),
            self.organization.clone(),
        )
    }
}

/// One already-registered subscriber; identity key is the email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrantRecord {
    pub name: String,
    pub email: String,
}

/// A pairing of one request to one currently open scheme.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemeMatch {
    pub request: NotificationRequest,
    pub scheme: Scheme,
}

/// Outbound payload handed to the send capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub recipient_name: String,
    pub recipient_email: String,
    pub program: String,
    pub organization: String,
}

impl NotificationMessage {
    pub fn for_match(scheme_match: &SchemeMatch) -> Self {
        Self {
            recipient_name: scheme_match.request.name.clone(),
            recipient_email: scheme_match.request.email.clone(),
            program: scheme_match.request.program.clone(),
            organization: scheme_match.request.organization.clone(),
        }
    }
}

pub fn normalize_email(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// Cheap shape check for sign-up input. The feeds themselves are only
/// checked for non-emptiness.
pub fn plausible_email(value: &str) -> bool {
    let trimmed = value.trim();
    let Some((local, domain)) = trimmed.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !local.contains(char::is_whitespace)
        && domain.contains('.')
        && !domain.contains(char::is_whitespace)
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
