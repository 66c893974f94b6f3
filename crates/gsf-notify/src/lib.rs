//! Notification check pipeline, sign-up flows, and scheduling for GSF.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use gsf_adapters::{
    fetch_catalog, fetch_registrants, fetch_requests, NormalizerConfig, NotificationSender,
    RegistrantWriter, SenderCredentials,
};
use gsf_core::{
    normalize_email, plausible_email, NotificationMessage, NotificationRequest, RegistrantRecord,
    Scheme, SchemeMatch, SchemeStatus,
};
use gsf_storage::{
    FeedFetcher, FetchError, FileIdentityStore, HttpClientConfig, LedgerKey, NotifiedLedger,
    SessionIdentity,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gsf-notify";

/// Explicit runtime configuration; feed locations and credentials are
/// passed in here rather than living in module constants.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub catalog_url: String,
    pub subscription_url: String,
    pub registrant_url: String,
    pub registrant_write_url: String,
    pub subscription_write_url: String,
    pub sender: SenderCredentials,
    pub ledger_path: PathBuf,
    pub identity_path: PathBuf,
    pub identity_ttl_days: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub check_cron: String,
}

impl NotifyConfig {
    pub fn from_env() -> Self {
        Self {
            catalog_url: std::env::var("GSF_CATALOG_URL").unwrap_or_default(),
            subscription_url: std::env::var("GSF_SUBSCRIPTION_URL").unwrap_or_default(),
            registrant_url: std::env::var("GSF_REGISTRANT_URL").unwrap_or_default(),
            registrant_write_url: std::env::var("GSF_REGISTRANT_WRITE_URL").unwrap_or_default(),
            subscription_write_url: std::env::var("GSF_SUBSCRIPTION_WRITE_URL")
                .unwrap_or_default(),
            sender: SenderCredentials {
                endpoint: std::env::var("GSF_SENDER_ENDPOINT").unwrap_or_else(|_| {
                    "https://api.emailjs.com/api/v1.0/email/send".to_string()
                }),
                service_id: std::env::var("GSF_SENDER_SERVICE_ID").unwrap_or_default(),
                template_id: std::env::var("GSF_SENDER_TEMPLATE_ID").unwrap_or_default(),
                user_id: std::env::var("GSF_SENDER_USER_ID").unwrap_or_default(),
            },
            ledger_path: std::env::var("GSF_LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state/notified.json")),
            identity_path: std::env::var("GSF_IDENTITY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state/identity.json")),
            identity_ttl_days: 365,
            user_agent: std::env::var("GSF_USER_AGENT")
                .unwrap_or_else(|_| "gsf-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("GSF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("GSF_SCHEDULER_ENABLED")
                .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            check_cron: std::env::var("GSF_CHECK_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }

    pub fn identity_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_ttl_days * 24 * 60 * 60)
    }
}

/// Match-key comparison knobs. The default reproduces the exact,
/// case-sensitive comparison between the two independently authored
/// feeds, mismatches and all.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchConfig {
    /// Trim and casefold program/organization before comparing.
    pub normalize_keys: bool,
}

fn keys_equal(a: &str, b: &str, normalize: bool) -> bool {
    if normalize {
        a.trim().eq_ignore_ascii_case(b.trim())
    } else {
        a == b
    }
}

/// Pair each request that carries an email with the first scheme whose
/// title and organization equal the requested program and organization
/// and whose status is open on `today`. Holds no state between runs; a
/// request with zero matches produces nothing and is not an error.
pub fn match_requests(
    schemes: &[Scheme],
    requests: &[NotificationRequest],
    today: NaiveDate,
    config: &MatchConfig,
) -> Vec<SchemeMatch> {
    let mut matches = Vec::new();
    for request in requests {
        if request.email.trim().is_empty() {
            continue;
        }
        let found = schemes.iter().find(|scheme| {
            keys_equal(&scheme.title, &request.program, config.normalize_keys)
                && keys_equal(
                    &scheme.organization,
                    &request.organization,
                    config.normalize_keys,
                )
                && scheme.status_on(today) == SchemeStatus::Open
        });
        if let Some(scheme) = found {
            matches.push(SchemeMatch {
                request: request.clone(),
                scheme: scheme.clone(),
            });
        }
    }
    matches
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub dispatched: usize,
    pub already_notified: usize,
    pub failures: usize,
}

/// Send one message per match, gated by the ledger. A failed send is
/// logged and counted; it never stops the remaining matches, and nothing
/// is retried here. The ledger is updated only after a confirmed send.
pub async fn dispatch_matches(
    matches: &[SchemeMatch],
    sender: &dyn NotificationSender,
    ledger: &NotifiedLedger,
) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();
    for scheme_match in matches {
        let message = NotificationMessage::for_match(scheme_match);
        let key = LedgerKey::new(
            &message.recipient_email,
            &message.program,
            &message.organization,
        );
        if ledger.contains(&key).await {
            outcome.already_notified += 1;
            continue;
        }
        match sender.send(&message).await {
            Ok(()) => {
                if let Err(err) = ledger.record(key, Utc::now()).await {
                    warn!(
                        error = %err,
                        recipient = %message.recipient_email,
                        "notification sent but not recorded in ledger"
                    );
                }
                outcome.dispatched += 1;
            }
            Err(err) => {
                warn!(
                    error = %err,
                    recipient = %message.recipient_email,
                    program = %message.program,
                    "notification dispatch failed"
                );
                outcome.failures += 1;
            }
        }
    }
    outcome
}

#[derive(Debug, Clone, Serialize)]
pub struct NotifyRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub schemes: usize,
    pub requests: usize,
    pub skipped_requests: usize,
    pub dropped_rows: usize,
    pub matches: usize,
    pub already_notified: usize,
    pub dispatched: usize,
    pub dispatch_failures: usize,
}

pub struct NotifyPipeline {
    config: NotifyConfig,
    fetcher: FeedFetcher,
    sender: Arc<dyn NotificationSender>,
    ledger: NotifiedLedger,
    normalizer: NormalizerConfig,
    matcher: MatchConfig,
}

impl NotifyPipeline {
    pub async fn new(config: NotifyConfig, sender: Arc<dyn NotificationSender>) -> Result<Self> {
        let fetcher = FeedFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let ledger = NotifiedLedger::open(&config.ledger_path).await?;
        Ok(Self {
            config,
            fetcher,
            sender,
            ledger,
            normalizer: NormalizerConfig::default(),
            matcher: MatchConfig::default(),
        })
    }

    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_matcher(mut self, matcher: MatchConfig) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    /// One full check: both feeds fetched concurrently, matching once
    /// both are in, ledger-gated dispatch per match. Either feed failing
    /// fails the whole run; the caller decides the fallback (typically an
    /// empty listing plus a visible error). Dropping the returned future
    /// cancels in-flight fetches without surfacing anything.
    pub async fn run_once(&self) -> Result<NotifyRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let today = started_at.date_naive();

        let (catalog, subscriptions) = tokio::join!(
            fetch_catalog(
                &self.fetcher,
                run_id,
                &self.config.catalog_url,
                &self.normalizer
            ),
            fetch_requests(&self.fetcher, run_id, &self.config.subscription_url),
        );
        let catalog = catalog.context("fetching scheme catalog")?;
        let subscriptions = subscriptions.context("fetching subscription requests")?;

        let matches = match_requests(&catalog.items, &subscriptions.items, today, &self.matcher);
        let outcome = dispatch_matches(&matches, self.sender.as_ref(), &self.ledger).await;

        Ok(NotifyRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            schemes: catalog.items.len(),
            requests: subscriptions.items.len(),
            skipped_requests: subscriptions.skipped_rows,
            dropped_rows: catalog.row_errors.len() + subscriptions.row_errors.len(),
            matches: matches.len(),
            already_notified: outcome.already_notified,
            dispatched: outcome.dispatched,
            dispatch_failures: outcome.failures,
        })
    }
}

/// Optional recurring check; the external trigger of the source, made
/// explicit. Returns `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(pipeline: Arc<NotifyPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().check_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    matches = summary.matches,
                    dispatched = summary.dispatched,
                    "scheduled check complete"
                ),
                Err(err) => warn!(error = %err, "scheduled check failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[derive(Debug, Error)]
pub enum SignupError {
    #[error("'{0}' does not look like a valid email address")]
    InvalidEmail(String),
    #[error("{0} is already registered")]
    Duplicate(String),
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error(transparent)]
    Write(#[from] gsf_adapters::WriteError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Case-insensitive existence check on trimmed emails.
pub fn registrant_exists(snapshot: &[RegistrantRecord], candidate: &str) -> bool {
    let Some(candidate) = normalize_email(candidate) else {
        return false;
    };
    snapshot
        .iter()
        .any(|registrant| normalize_email(&registrant.email).as_deref() == Some(candidate.as_str()))
}

/// Sign-up: fresh registrant fetch, duplicate gate, append, then persist
/// the session identity. The check and the write are not atomic across
/// concurrent clients; the external dataset is the only serialization
/// point.
pub async fn sign_up(
    fetcher: &FeedFetcher,
    writer: &dyn RegistrantWriter,
    identity_store: &FileIdentityStore,
    registrant_url: &str,
    name: &str,
    email: &str,
) -> Result<SessionIdentity, SignupError> {
    if !plausible_email(email) {
        return Err(SignupError::InvalidEmail(email.to_string()));
    }
    let registrants = fetch_registrants(fetcher, Uuid::new_v4(), registrant_url).await?;
    if registrant_exists(&registrants.items, email) {
        return Err(SignupError::Duplicate(email.trim().to_string()));
    }
    writer.append_registrant(name, email).await?;
    let identity = SessionIdentity {
        name: name.to_string(),
        email: email.trim().to_string(),
    };
    identity_store
        .save(&identity, Utc::now())
        .await
        .map_err(SignupError::Other)?;
    Ok(identity)
}

/// Standing-request sign-up: dedup on the `(email, program, organization)`
/// identity key against the current subscription feed, then append.
pub async fn request_notification(
    fetcher: &FeedFetcher,
    writer: &dyn RegistrantWriter,
    subscription_url: &str,
    request: &NotificationRequest,
) -> Result<(), SignupError> {
    if !plausible_email(&request.email) {
        return Err(SignupError::InvalidEmail(request.email.clone()));
    }
    let existing = fetch_requests(fetcher, Uuid::new_v4(), subscription_url).await?;
    let key = request.identity_key();
    if existing
        .items
        .iter()
        .any(|existing_request| existing_request.identity_key() == key)
    {
        return Err(SignupError::Duplicate(format!(
            "{} for '{}' by '{}'",
            request.email.trim(),
            request.program,
            request.organization
        )));
    }
    writer.append_request(request).await?;
    Ok(())
}
