//! Feed ingestion (CSV over HTTP) and outbound delivery adapters for GSF.

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use csv::{ReaderBuilder, Trim};
use gsf_core::{
    record_text, NotificationMessage, NotificationRequest, RawRecord, RawValue, RegistrantRecord,
    Scheme, DEFAULT_APPLY_LINK, DEFAULT_FUNDING_TYPE, DEFAULT_ORGANIZATION, DEFAULT_SUPPORT,
    DEFAULT_TITLE,
};
use gsf_storage::{FeedFetcher, FetchError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gsf-adapters";

pub const CATALOG_FEED_ID: &str = "catalog";
pub const SUBSCRIPTION_FEED_ID: &str = "subscriptions";
pub const REGISTRANT_FEED_ID: &str = "registrants";

/// One malformed row, excluded from the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub line: u64,
    pub message: String,
}

/// Parsed feed body: ordered records plus the rows that failed to parse.
#[derive(Debug, Clone, Default)]
pub struct ParsedTable {
    pub records: Vec<RawRecord>,
    pub row_errors: Vec<RowError>,
}

/// Parse CSV text into loosely typed records. Header labels are trimmed,
/// scalar values are opportunistically typed, fully empty rows are
/// dropped, and a malformed row is collected as a `RowError` without
/// aborting the batch.
pub fn parse_table(text: &str) -> ParsedTable {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::Headers)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(headers) => headers.iter().map(|label| label.to_string()).collect(),
        Err(err) => {
            return ParsedTable {
                records: Vec::new(),
                row_errors: vec![RowError {
                    line: 1,
                    message: err.to_string(),
                }],
            }
        }
    };

    let mut table = ParsedTable::default();
    for result in reader.records() {
        match result {
            Ok(record) => {
                if record.iter().all(|field| field.is_empty()) {
                    continue;
                }
                let mut row = RawRecord::new();
                for (label, field) in headers.iter().zip(record.iter()) {
                    row.insert(label.clone(), type_scalar(field));
                }
                table.records.push(row);
            }
            Err(err) => {
                let line = err.position().map(|pos| pos.line()).unwrap_or_default();
                table.row_errors.push(RowError {
                    line,
                    message: err.to_string(),
                });
            }
        }
    }
    table
}

fn type_scalar(field: &str) -> RawValue {
    if field == "true" {
        return RawValue::Bool(true);
    }
    if field == "false" {
        return RawValue::Bool(false);
    }
    if let Ok(value) = field.parse::<i64>() {
        return RawValue::Integer(value);
    }
    if let Ok(value) = field.parse::<f64>() {
        if value.is_finite() {
            return RawValue::Float(value);
        }
    }
    RawValue::Text(field.to_string())
}

/// Knobs for row-to-entity conversion. The defaults reproduce the
/// upstream feed behavior exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizerConfig {
    /// Drop focus-area tokens that are empty after trimming. Off by
    /// default: a trailing comma in the feed yields an empty token.
    pub drop_empty_focus_tokens: bool,
}

/// Build a `Scheme` from one catalog row, applying display defaults for
/// absent columns. Pure; the status stays derived on the entity.
pub fn scheme_from_record(record: &RawRecord, config: &NormalizerConfig) -> Scheme {
    Scheme {
        title: record_text(record, "Program").unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        organization: record_text(record, "Organization")
            .unwrap_or_else(|| DEFAULT_ORGANIZATION.to_string()),
        focus_areas: record_text(record, "Focus_Area")
            .map(|raw| split_focus_areas(&raw, config))
            .unwrap_or_default(),
        support: record_text(record, "Grant/Support").unwrap_or_else(|| DEFAULT_SUPPORT.to_string()),
        funding_type: record_text(record, "Funding Type")
            .unwrap_or_else(|| DEFAULT_FUNDING_TYPE.to_string()),
        deadline: record_text(record, "Deadline").and_then(|value| parse_deadline(&value)),
        apply_link: record_text(record, "Link").unwrap_or_else(|| DEFAULT_APPLY_LINK.to_string()),
    }
}

fn split_focus_areas(raw: &str, config: &NormalizerConfig) -> Vec<String> {
    let stripped = raw.trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'');
    let tokens = stripped.split(',').map(|token| token.trim().to_string());
    if config.drop_empty_focus_tokens {
        tokens.filter(|token| !token.is_empty()).collect()
    } else {
        tokens.collect()
    }
}

const DEADLINE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d %B %Y", "%B %d, %Y"];

/// Lenient calendar-date parsing. Anything unparsable is an absent
/// deadline, never an error.
pub fn parse_deadline(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    DEADLINE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}

/// A row without an `Email` is invalid; it is skipped, never an error.
pub fn request_from_record(record: &RawRecord) -> Option<NotificationRequest> {
    let email = record_text(record, "Email")?;
    Some(NotificationRequest {
        name: record_text(record, "Name").unwrap_or_default(),
        email,
        program: record_text(record, "Program").unwrap_or_default(),
        organization: record_text(record, "Organization").unwrap_or_default(),
    })
}

pub fn registrant_from_record(record: &RawRecord) -> Option<RegistrantRecord> {
    let email = record_text(record, "Email")?;
    Some(RegistrantRecord {
        name: record_text(record, "Name").unwrap_or_default(),
        email,
    })
}

/// Successfully ingested feed: normalized entities plus the rows dropped
/// on the way (parse failures and validation skips).
#[derive(Debug, Clone)]
pub struct FeedBatch<T> {
    pub items: Vec<T>,
    pub row_errors: Vec<RowError>,
    pub skipped_rows: usize,
}

pub async fn fetch_catalog(
    fetcher: &FeedFetcher,
    run_id: Uuid,
    url: &str,
    config: &NormalizerConfig,
) -> Result<FeedBatch<Scheme>, FetchError> {
    let feed = fetcher.fetch_text(run_id, CATALOG_FEED_ID, url).await?;
    let table = parse_table(&feed.body);
    let items = table
        .records
        .iter()
        .map(|record| scheme_from_record(record, config))
        .collect();
    Ok(FeedBatch {
        items,
        row_errors: table.row_errors,
        skipped_rows: 0,
    })
}

pub async fn fetch_requests(
    fetcher: &FeedFetcher,
    run_id: Uuid,
    url: &str,
) -> Result<FeedBatch<NotificationRequest>, FetchError> {
    let feed = fetcher.fetch_text(run_id, SUBSCRIPTION_FEED_ID, url).await?;
    let table = parse_table(&feed.body);
    let total = table.records.len();
    let items: Vec<NotificationRequest> =
        table.records.iter().filter_map(request_from_record).collect();
    let skipped_rows = total - items.len();
    Ok(FeedBatch {
        items,
        row_errors: table.row_errors,
        skipped_rows,
    })
}

pub async fn fetch_registrants(
    fetcher: &FeedFetcher,
    run_id: Uuid,
    url: &str,
) -> Result<FeedBatch<RegistrantRecord>, FetchError> {
    let feed = fetcher.fetch_text(run_id, REGISTRANT_FEED_ID, url).await?;
    let table = parse_table(&feed.body);
    let total = table.records.len();
    let items: Vec<RegistrantRecord> = table
        .records
        .iter()
        .filter_map(registrant_from_record)
        .collect();
    let skipped_rows = total - items.len();
    Ok(FeedBatch {
        items,
        row_errors: table.row_errors,
        skipped_rows,
    })
}

/// Credentials for the external send capability, an EmailJS-style HTTP
/// API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderCredentials {
    pub endpoint: String,
    pub service_id: String,
    pub template_id: String,
    pub user_id: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Message(String),
    #[error("send request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("send rejected with http status {0}")]
    HttpStatus(u16),
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, message: &NotificationMessage) -> Result<(), DispatchError>;
}

/// Posts one JSON payload per message to the configured send endpoint.
/// Nothing beyond success or failure of the transport is inspected.
#[derive(Debug, Clone)]
pub struct EmailApiSender {
    client: reqwest::Client,
    credentials: SenderCredentials,
}

impl EmailApiSender {
    pub fn new(credentials: SenderCredentials) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building send client")?;
        Ok(Self {
            client,
            credentials,
        })
    }

    fn payload(&self, message: &NotificationMessage) -> serde_json::Value {
        serde_json::json!({
            "service_id": self.credentials.service_id,
            "template_id": self.credentials.template_id,
            "user_id": self.credentials.user_id,
            "template_params": {
                "to_name": message.recipient_name,
                "to_email": message.recipient_email,
                "program_name": message.program,
                "organization_name": message.organization,
                "message": format!(
                    "Hi {},\n\nThe program '{}' by '{}' is currently open. Don't miss out!",
                    message.recipient_name, message.program, message.organization
                ),
            },
        })
    }
}

#[async_trait]
impl NotificationSender for EmailApiSender {
    async fn send(&self, message: &NotificationMessage) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.credentials.endpoint)
            .json(&self.payload(message))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::HttpStatus(status.as_u16()));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("write rejected with http status {0}")]
    HttpStatus(u16),
}

#[async_trait]
pub trait RegistrantWriter: Send + Sync {
    /// Append a new registrant (`Name`/`Email`) to the external dataset.
    async fn append_registrant(&self, name: &str, email: &str) -> Result<(), WriteError>;

    /// Append a notification request (`Name`/`Email`/`Program`/
    /// `Organization`) to the external dataset.
    async fn append_request(&self, request: &NotificationRequest) -> Result<(), WriteError>;
}

/// Form-encoded POST writer matching the collaborator script endpoint.
#[derive(Debug, Clone)]
pub struct FormPostWriter {
    client: reqwest::Client,
    endpoint: String,
}

impl FormPostWriter {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building write client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn post_form(&self, fields: &[(&str, &str)]) -> Result<(), WriteError> {
        let response = self.client.post(&self.endpoint).form(fields).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WriteError::HttpStatus(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistrantWriter for FormPostWriter {
    async fn append_registrant(&self, name: &str, email: &str) -> Result<(), WriteError> {
        self.post_form(&[("Name", name), ("Email", email)]).await
    }

    async fn append_request(&self, request: &NotificationRequest) -> Result<(), WriteError> {
        self.post_form(&[
            ("Name", request.name.as_str()),
            ("Email", request.email.as_str()),
            ("Program", request.program.as_str()),
            ("Organization", request.organization.as_str()),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_trimmed_and_values_typed() {
        let table = parse_table(" Program , Count ,Active\nGrant A,42,true\nGrant B,3.5,false\n");
        assert!(table.row_errors.is_empty());
        assert_eq!(table.records.len(), 2);

        let first = &table.records[0];
        assert_eq!(
            first.get("Program"),
            Some(&RawValue::Text("Grant A".to_string()))
        );
        assert_eq!(first.get("Count"), Some(&RawValue::Integer(42)));
        assert_eq!(first.get("Active"), Some(&RawValue::Bool(true)));

        let second = &table.records[1];
        assert_eq!(second.get("Count"), Some(&RawValue::Float(3.5)));
        assert_eq!(second.get("Active"), Some(&RawValue::Bool(false)));
    }

    #[test]
    fn empty_lines_are_dropped() {
        let table = parse_table("Program,Organization\n\nGrant A,Org1\n\n");
        assert_eq!(table.records.len(), 1);
        assert!(table.row_errors.is_empty());
    }

    #[test]
    fn malformed_rows_are_collected_without_aborting_the_batch() {
        let text = "Program,Organization\nGrant A,Org1\nGrant B,Org2,extra,cells\nGrant C,Org3\n";
        let table = parse_table(text);
        assert_eq!(table.records.len(), 2);
        assert_eq!(table.row_errors.len(), 1);
        assert_eq!(table.row_errors[0].line, 3);
    }

    fn record(pairs: &[(&str, &str)]) -> RawRecord {
        pairs
            .iter()
            .map(|(label, value)| (label.to_string(), RawValue::Text(value.to_string())))
            .collect()
    }

    #[test]
    fn scheme_defaults_apply_for_absent_columns() {
        let scheme = scheme_from_record(&record(&[]), &NormalizerConfig::default());
        assert_eq!(scheme.title, DEFAULT_TITLE);
        assert_eq!(scheme.organization, DEFAULT_ORGANIZATION);
        assert_eq!(scheme.support, DEFAULT_SUPPORT);
        assert_eq!(scheme.funding_type, DEFAULT_FUNDING_TYPE);
        assert_eq!(scheme.apply_link, DEFAULT_APPLY_LINK);
        assert!(scheme.focus_areas.is_empty());
        assert_eq!(scheme.deadline, None);
    }

    #[test]
    fn focus_areas_are_quote_stripped_and_split() {
        let scheme = scheme_from_record(
            &record(&[("Focus_Area", "\" Education, Rural Health ,Water\"")]),
            &NormalizerConfig::default(),
        );
        assert_eq!(
            scheme.focus_areas,
            vec!["Education", "Rural Health", "Water"]
        );
    }

    #[test]
    fn empty_focus_tokens_are_preserved_unless_configured() {
        let raw = record(&[("Focus_Area", "Education,,Water,")]);

        let preserved = scheme_from_record(&raw, &NormalizerConfig::default());
        assert_eq!(preserved.focus_areas, vec!["Education", "", "Water", ""]);

        let dropped = scheme_from_record(
            &raw,
            &NormalizerConfig {
                drop_empty_focus_tokens: true,
            },
        );
        assert_eq!(dropped.focus_areas, vec!["Education", "Water"]);
    }

    #[test]
    fn deadline_accepts_common_formats_and_rejects_garbage() {
        let expected = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        assert_eq!(parse_deadline("2026-03-05"), Some(expected));
        assert_eq!(parse_deadline("2026/03/05"), Some(expected));
        assert_eq!(parse_deadline("03/05/2026"), Some(expected));
        assert_eq!(parse_deadline("5 March 2026"), Some(expected));
        assert_eq!(parse_deadline("March 5, 2026"), Some(expected));
        assert_eq!(parse_deadline(" 2026-03-05 "), Some(expected));

        assert_eq!(parse_deadline(""), None);
        assert_eq!(parse_deadline("rolling"), None);
        assert_eq!(parse_deadline("2026-13-40"), None);
    }

    #[test]
    fn unparsable_deadline_yields_unknown_status_not_an_error() {
        let scheme = scheme_from_record(
            &record(&[("Program", "Grant A"), ("Deadline", "until funds last")]),
            &NormalizerConfig::default(),
        );
        assert_eq!(scheme.deadline, None);
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(scheme.status_on(today), gsf_core::SchemeStatus::Unknown);
    }

    #[test]
    fn requests_without_email_are_skipped() {
        assert_eq!(
            request_from_record(&record(&[("Name", "Ada"), ("Program", "Grant A")])),
            None
        );
        assert_eq!(request_from_record(&record(&[("Email", "")])), None);

        let request = request_from_record(&record(&[
            ("Name", "Ada"),
            ("Email", "ada@example.com"),
            ("Program", "Grant A"),
            ("Organization", "Org1"),
        ]))
        .expect("request");
        assert_eq!(request.email, "ada@example.com");
        assert_eq!(request.program, "Grant A");
    }

    #[test]
    fn registrants_only_need_an_email() {
        assert_eq!(registrant_from_record(&record(&[("Name", "Ada")])), None);
        let registrant =
            registrant_from_record(&record(&[("Email", "ada@example.com")])).expect("registrant");
        assert_eq!(registrant.email, "ada@example.com");
        assert_eq!(registrant.name, "");
    }

    #[test]
    fn sender_payload_carries_template_fields() {
        let sender = EmailApiSender::new(SenderCredentials {
            endpoint: "https://mail.invalid/send".to_string(),
            service_id: "svc".to_string(),
            template_id: "tpl".to_string(),
            user_id: "usr".to_string(),
        })
        .expect("sender");

        let payload = sender.payload(&NotificationMessage {
            recipient_name: "Ada".to_string(),
            recipient_email: "ada@example.com".to_string(),
            program: "Grant A".to_string(),
            organization: "Org1".to_string(),
        });

        assert_eq!(payload["service_id"], "svc");
        assert_eq!(payload["template_params"]["to_email"], "ada@example.com");
        assert_eq!(payload["template_params"]["program_name"], "Grant A");
        assert_eq!(
            payload["template_params"]["organization_name"],
            "Org1"
        );
    }
}
