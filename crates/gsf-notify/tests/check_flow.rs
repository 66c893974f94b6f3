//! End-to-end check flow: CSV text through parsing, normalization,
//! matching, and ledger-gated dispatch, with a recording sender standing
//! in for the external send capability.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use gsf_adapters::{
    parse_table, request_from_record, scheme_from_record, DispatchError, NormalizerConfig,
    NotificationSender,
};
use gsf_core::{NotificationMessage, NotificationRequest, Scheme};
use gsf_notify::{dispatch_matches, match_requests, MatchConfig};
use gsf_storage::NotifiedLedger;
use tempfile::tempdir;

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<NotificationMessage>>,
    fail_for: Option<String>,
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, message: &NotificationMessage) -> Result<(), DispatchError> {
        if self.fail_for.as_deref() == Some(message.recipient_email.as_str()) {
            return Err(DispatchError::Message("simulated send failure".to_string()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn schemes_from_csv(text: &str) -> Vec<Scheme> {
    let table = parse_table(text);
    assert!(table.row_errors.is_empty(), "fixture rows must parse");
    table
        .records
        .iter()
        .map(|record| scheme_from_record(record, &NormalizerConfig::default()))
        .collect()
}

fn requests_from_csv(text: &str) -> Vec<NotificationRequest> {
    let table = parse_table(text);
    assert!(table.row_errors.is_empty(), "fixture rows must parse");
    table
        .records
        .iter()
        .filter_map(request_from_record)
        .collect()
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
}

const SUBSCRIPTIONS: &str = "\
Name,Email,Organization,Program
Ada,a@b.com,Org1,Grant A
";

#[tokio::test]
async fn past_deadline_means_closed_and_zero_dispatches() {
    let schemes = schemes_from_csv(
        "Program,Organization,Focus_Area,Grant/Support,Deadline,Link,Funding Type\n\
         Grant A,Org1,Education,Grant,2000-01-01,https://example.org/a,Grant\n",
    );
    let requests = requests_from_csv(SUBSCRIPTIONS);

    let matches = match_requests(&schemes, &requests, today(), &MatchConfig::default());
    assert!(matches.is_empty());

    let dir = tempdir().expect("tempdir");
    let ledger = NotifiedLedger::open(dir.path().join("notified.json"))
        .await
        .expect("ledger");
    let sender = RecordingSender::default();

    let outcome = dispatch_matches(&matches, &sender, &ledger).await;
    assert_eq!(outcome.dispatched, 0);
    assert!(sender.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn future_deadline_dispatches_exactly_once() {
    let schemes = schemes_from_csv(
        "Program,Organization,Focus_Area,Grant/Support,Deadline,Link,Funding Type\n\
         Grant A,Org1,Education,Grant,2999-12-31,https://example.org/a,Grant\n",
    );
    let requests = requests_from_csv(SUBSCRIPTIONS);

    let matches = match_requests(&schemes, &requests, today(), &MatchConfig::default());
    assert_eq!(matches.len(), 1);

    let dir = tempdir().expect("tempdir");
    let ledger = NotifiedLedger::open(dir.path().join("notified.json"))
        .await
        .expect("ledger");
    let sender = RecordingSender::default();

    let outcome = dispatch_matches(&matches, &sender, &ledger).await;
    assert_eq!(outcome.dispatched, 1);
    assert_eq!(outcome.failures, 0);

    let sent = sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient_email, "a@b.com");
    assert_eq!(sent[0].program, "Grant A");
    assert_eq!(sent[0].organization, "Org1");
}

#[tokio::test]
async fn ledger_suppresses_repeat_dispatch_on_the_next_run() {
    let schemes = schemes_from_csv(
        "Program,Organization,Focus_Area,Grant/Support,Deadline,Link,Funding Type\n\
         Grant A,Org1,Education,Grant,2999-12-31,https://example.org/a,Grant\n",
    );
    let requests = requests_from_csv(SUBSCRIPTIONS);
    let matches = match_requests(&schemes, &requests, today(), &MatchConfig::default());

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("notified.json");
    let sender = RecordingSender::default();

    let ledger = NotifiedLedger::open(&path).await.expect("ledger");
    let first = dispatch_matches(&matches, &sender, &ledger).await;
    assert_eq!(first.dispatched, 1);

    // A later run reopens the ledger the way a fresh process would.
    let reopened = NotifiedLedger::open(&path).await.expect("reopen");
    let second = dispatch_matches(&matches, &sender, &reopened).await;
    assert_eq!(second.dispatched, 0);
    assert_eq!(second.already_notified, 1);
    assert_eq!(sender.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rows_without_email_are_skipped_without_error() {
    let requests = requests_from_csv(
        "Name,Email,Organization,Program\n\
         NoMail,,Org1,Grant A\n\
         Ada,a@b.com,Org1,Grant A\n",
    );
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].name, "Ada");

    let schemes = schemes_from_csv(
        "Program,Organization,Focus_Area,Grant/Support,Deadline,Link,Funding Type\n\
         Grant B,Org1,Education,Grant,2999-12-31,https://example.org/b,Grant\n",
    );
    let matches = match_requests(&schemes, &requests, today(), &MatchConfig::default());
    assert!(matches.is_empty());
}

#[tokio::test]
async fn one_failed_send_does_not_stop_the_rest() {
    let schemes = schemes_from_csv(
        "Program,Organization,Focus_Area,Grant/Support,Deadline,Link,Funding Type\n\
         Grant A,Org1,Education,Grant,2999-12-31,https://example.org/a,Grant\n\
         Grant B,Org2,Water,Grant,2999-12-31,https://example.org/b,Grant\n",
    );
    let requests = requests_from_csv(
        "Name,Email,Organization,Program\n\
         Ada,a@b.com,Org1,Grant A\n\
         Grace,g@h.com,Org2,Grant B\n",
    );
    let matches = match_requests(&schemes, &requests, today(), &MatchConfig::default());
    assert_eq!(matches.len(), 2);

    let dir = tempdir().expect("tempdir");
    let ledger = NotifiedLedger::open(dir.path().join("notified.json"))
        .await
        .expect("ledger");
    let sender = RecordingSender {
        fail_for: Some("a@b.com".to_string()),
        ..Default::default()
    };

    let outcome = dispatch_matches(&matches, &sender, &ledger).await;
    assert_eq!(outcome.failures, 1);
    assert_eq!(outcome.dispatched, 1);

    let sent = sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient_email, "g@h.com");

    // The failed recipient stays out of the ledger so a later run can
    // retry them.
    assert_eq!(ledger.len().await, 1);
}
