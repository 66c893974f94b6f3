//! Feed fetching over HTTP plus durable local state for GSF: the
//! notified-dispatch ledger and the expiring session identity entry.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gsf-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_feed_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_feed_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A successfully fetched feed body, decoded to text.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// HTTP GET client for the CSV feeds, with retry classification,
/// exponential backoff, and global plus per-feed concurrency limits.
#[derive(Debug)]
pub struct FeedFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_feed_limit: usize,
    per_feed: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl FeedFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_feed_limit: config.per_feed_concurrency.max(1),
            per_feed: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_feed_semaphore(&self, feed_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_feed.lock().await;
        map.entry(feed_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_feed_limit)))
            .clone()
    }

    /// Fetch one feed body. Non-success status or transport failure after
    /// retries surfaces as a single batch-level `FetchError`; dropping the
    /// returned future cancels the request without surfacing anything.
    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        feed_id: &str,
        url: &str,
    ) -> Result<FetchedFeed, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_feed = self.per_feed_semaphore(feed_id).await;
        let _feed = per_feed.acquire().await.expect("semaphore not closed");

        let span = info_span!("feed_fetch", %run_id, feed_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedFeed {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// Key of one confirmed dispatch: casefolded trimmed email plus the exact
/// program and organization strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub email: String,
    pub program: String,
    pub organization: String,
}

impl LedgerKey {
    pub fn new(email: &str, program: &str, organization: &str) -> Self {
        Self {
            email: email.trim().to_ascii_lowercase(),
            program: program.to_string(),
            organization: organization.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    email: String,
    program: String,
    organization: String,
    notified_at: DateTime<Utc>,
}

/// Durable set of dispatches already made, keyed by
/// `(email, program, organization)`. Consulted before each dispatch and
/// updated only after a confirmed send; a crash in between can at worst
/// repeat one notification. Deleting the file re-arms all notifications.
#[derive(Debug)]
pub struct NotifiedLedger {
    path: PathBuf,
    entries: Mutex<BTreeMap<LedgerKey, DateTime<Utc>>>,
}

impl NotifiedLedger {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path).await {
            Ok(text) => {
                let list: Vec<LedgerEntry> = serde_json::from_str(&text)
                    .with_context(|| format!("parsing ledger {}", path.display()))?;
                list.into_iter()
                    .map(|entry| {
                        (
                            LedgerKey::new(&entry.email, &entry.program, &entry.organization),
                            entry.notified_at,
                        )
                    })
                    .collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading ledger {}", path.display()))
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub async fn contains(&self, key: &LedgerKey) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Record one confirmed dispatch and persist the whole set atomically.
    /// Recording an already-present key is a no-op.
    pub async fn record(&self, key: LedgerKey, notified_at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&key) {
            return Ok(());
        }
        entries.insert(key, notified_at);
        let list: Vec<LedgerEntry> = entries
            .iter()
            .map(|(key, notified_at)| LedgerEntry {
                email: key.email.clone(),
                program: key.program.clone(),
                organization: key.organization.clone(),
                notified_at: *notified_at,
            })
            .collect();
        write_json_atomic(&self.path, &list).await
    }
}

/// The current user session: `{name, email}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredIdentity {
    name: String,
    email: String,
    expires_at: DateTime<Utc>,
}

/// Scoped, expiring `{name, email}` entry written on successful sign-up
/// and read by features needing the current identity.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
    ttl: Duration,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub async fn save(&self, identity: &SessionIdentity, now: DateTime<Utc>) -> anyhow::Result<()> {
        let ttl = chrono::Duration::from_std(self.ttl).context("identity ttl out of range")?;
        let stored = StoredIdentity {
            name: identity.name.clone(),
            email: identity.email.clone(),
            expires_at: now + ttl,
        };
        write_json_atomic(&self.path, &stored).await
    }

    /// Missing or expired entries read as absent.
    pub async fn load(&self, now: DateTime<Utc>) -> anyhow::Result<Option<SessionIdentity>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading identity {}", self.path.display()))
            }
        };
        let stored: StoredIdentity = serde_json::from_str(&text)
            .with_context(|| format!("parsing identity {}", self.path.display()))?;
        if stored.expires_at <= now {
            return Ok(None);
        }
        Ok(Some(SessionIdentity {
            name: stored.name,
            email: stored.email,
        }))
    }
}

/// Serialize to a temp file in the target directory, then rename into
/// place so readers never observe a partial write.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serializing state file")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }
    }

    let temp_path = path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp state file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}
