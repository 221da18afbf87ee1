//! Airtable fetch client + immutable table dump storage for TFP.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tfp_core::SourceRecord;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tfp-source";

/// Airtable caps list-records pages at 100.
pub const PAGE_SIZE: u32 = 100;

/// The three Airtable tables the widget mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceTable {
    StateReps,
    NationalReps,
    NegativeBills,
}

impl SourceTable {
    pub const ALL: [SourceTable; 3] = [
        SourceTable::StateReps,
        SourceTable::NationalReps,
        SourceTable::NegativeBills,
    ];

    /// Name used for dump files and log lines.
    pub fn dump_name(&self) -> &'static str {
        match self {
            SourceTable::StateReps => "state_reps",
            SourceTable::NationalReps => "national_reps",
            SourceTable::NegativeBills => "negative_bills",
        }
    }

    /// Environment variable holding the Airtable table id.
    pub fn env_key(&self) -> &'static str {
        match self {
            SourceTable::StateReps => "STATE_REPS_TABLE",
            SourceTable::NationalReps => "NATIONAL_REPS_TABLE",
            SourceTable::NegativeBills => "NEGATIVE_BILLS_TABLE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredDump {
    pub table: String,
    pub content_hash: String,
    pub path: PathBuf,
    pub record_count: usize,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Directory of JSON table dumps, one file per fetch.
#[derive(Debug, Clone)]
pub struct DumpStore {
    root: PathBuf,
}

impl DumpStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn dump_file_name(table: &str, fetched_at: DateTime<Utc>, content_hash: &str) -> String {
        let short_hash = &content_hash[..content_hash.len().min(12)];
        format!("{table}_{}_{short_hash}.json", fetched_at.timestamp())
    }

    /// Write `records` as a JSON array using a temp file + atomic rename.
    pub async fn write_table(
        &self,
        table: &str,
        fetched_at: DateTime<Utc>,
        records: &[SourceRecord],
    ) -> anyhow::Result<StoredDump> {
        let bytes = serde_json::to_vec_pretty(records)
            .with_context(|| format!("serializing {table} dump"))?;
        let content_hash = Self::sha256_hex(&bytes);
        let path = self
            .root
            .join(Self::dump_file_name(table, fetched_at, &content_hash));
        let stored = |deduplicated| StoredDump {
            table: table.to_string(),
            content_hash: content_hash.clone(),
            path: path.clone(),
            record_count: records.len(),
            byte_size: bytes.len(),
            deduplicated,
        };

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating dump directory {}", self.root.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking dump path {}", path.display()))?
        {
            return Ok(stored(true));
        }

        // Written beside the target so the rename stays on one filesystem.
        let temp_path = self.root.join(format!(".{}.json.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing temp dump {}", temp_path.display()))?;

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(stored(true));
            }
            return Err(err).with_context(|| {
                format!("moving dump {} into place at {}", temp_path.display(), path.display())
            });
        }
        Ok(stored(false))
    }
}

/// Read a JSON array of source records, as written by [`DumpStore::write_table`].
pub async fn load_table(path: impl AsRef<Path>) -> anyhow::Result<Vec<SourceRecord>> {
    let path = path.as_ref();
    let data = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    pub fn per_second(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: Duration::from_secs(1) / requests,
        }
    }
}

/// Request gate shared by every page fetch of one client.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucketState {
    /// Credit whole refill periods elapsed since `last_refill`. The
    /// unfinished part of the current period carries over.
    fn refill(&mut self, now: Instant, capacity: u32, refill_every: Duration) {
        if refill_every.is_zero() {
            self.tokens = capacity;
            self.last_refill = now;
            return;
        }
        let periods = now.saturating_duration_since(self.last_refill).as_nanos()
            / refill_every.as_nanos();
        if periods == 0 {
            return;
        }
        let periods = u32::try_from(periods).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(periods).min(capacity);
        self.last_refill = if self.tokens == capacity {
            now
        } else {
            self.last_refill + refill_every * periods
        };
    }
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a request may be sent.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.refill(now, self.capacity, self.refill_every);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                (state.last_refill + self.refill_every).saturating_duration_since(now)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub api_url: String,
    pub base_id: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for AirtableConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.airtable.com/v0".to_string(),
            base_id: String::new(),
            token: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            token_bucket: Some(TokenBucketConfig::per_second(5)),
        }
    }
}

/// One page of the list-records response.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<SourceRecord>,
    #[serde(default)]
    pub offset: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed records page from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Paginating, rate-limited reader for Airtable tables.
#[derive(Debug)]
pub struct AirtableClient {
    client: reqwest::Client,
    api_url: String,
    base_id: String,
    token: String,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl AirtableClient {
    pub fn new(config: AirtableConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            base_id: config.base_id,
            token: config.token,
            token_bucket,
        })
    }

    pub fn table_url(&self, table_id: &str) -> String {
        format!("{}/{}/{}", self.api_url, self.base_id, table_id)
    }

    /// Fetch a single page; `offset` is the cursor returned by the previous page.
    pub async fn fetch_page(
        &self,
        table_id: &str,
        offset: Option<&str>,
    ) -> Result<RecordPage, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let url = self.table_url(table_id);
        let page_size = PAGE_SIZE.to_string();
        let mut params = vec![("pageSize", page_size.as_str())];
        if let Some(offset) = offset {
            params.push(("offset", offset));
        }

        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&params)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode { url, source })
    }

    /// Fetch every record of a table by following `offset` cursors.
    pub async fn fetch_table(&self, table_id: &str) -> Result<Vec<SourceRecord>, FetchError> {
        let span = info_span!("airtable_fetch", table_id);
        async {
            let first = self.fetch_page(table_id, None).await?;
            let mut records = first.records;
            let mut offset = first.offset;

            while let Some(cursor) = offset {
                let page = self.fetch_page(table_id, Some(&cursor)).await?;
                records.extend(page.records);
                offset = page.offset;
                info!(records = records.len(), "fetched page");
            }

            Ok(records)
        }
        .instrument(span)
        .await
    }
}
