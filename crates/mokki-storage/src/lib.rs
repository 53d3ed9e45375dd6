//! Snapshot file store + HTTP fetch utilities for the cabin pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info_span;

pub const CRATE_NAME: &str = "mokki-storage";

/// Filename timestamp format shared by all snapshot files,
/// e.g. `etuovi_data_20260823-060000.json`.
pub const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

const RAW_PREFIX: &str = "etuovi_data_";
const RAW_SUFFIX: &str = ".json";
const RECONCILED_SUFFIX: &str = ".reconciled.json";

/// One snapshot file on disk, with the scrape timestamp recovered from
/// its filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub stamp: NaiveDateTime,
}

impl SnapshotFile {
    /// The snapshot date used for posting-date bookkeeping.
    pub fn snapshot_date(&self) -> NaiveDate {
        self.stamp.date()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading snapshot directory {dir}: {source}")]
    ListDir {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[error("writing snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Directory of timestamped snapshot files: raw scrape output
/// (`etuovi_data_<stamp>.json`) and reconciled pipeline output
/// (`etuovi_data_<stamp>.reconciled.json`).
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
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

    pub fn raw_path(&self, stamp: NaiveDateTime) -> PathBuf {
        self.root
            .join(format!("{RAW_PREFIX}{}{RAW_SUFFIX}", stamp.format(STAMP_FORMAT)))
    }

    pub fn reconciled_path(&self, stamp: NaiveDateTime) -> PathBuf {
        self.root.join(format!(
            "{RAW_PREFIX}{}{RECONCILED_SUFFIX}",
            stamp.format(STAMP_FORMAT)
        ))
    }

    /// Most recent raw scrape snapshot, by filename timestamp.
    pub async fn latest_raw(&self) -> Result<Option<SnapshotFile>, StoreError> {
        self.latest_with_suffix(RAW_SUFFIX, Some(RECONCILED_SUFFIX))
            .await
    }

    /// Most recent reconciled snapshot, by filename timestamp.
    pub async fn latest_reconciled(&self) -> Result<Option<SnapshotFile>, StoreError> {
        self.latest_with_suffix(RECONCILED_SUFFIX, None).await
    }

    async fn latest_with_suffix(
        &self,
        suffix: &str,
        exclude_suffix: Option<&str>,
    ) -> Result<Option<SnapshotFile>, StoreError> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|source| {
            StoreError::ListDir {
                dir: self.root.clone(),
                source,
            }
        })?;

        let mut latest: Option<SnapshotFile> = None;
        while let Some(entry) = entries.next_entry().await.map_err(|source| {
            StoreError::ListDir {
                dir: self.root.clone(),
                source,
            }
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(excluded) = exclude_suffix {
                if name.ends_with(excluded) {
                    continue;
                }
            }
            let Some(stamp) = parse_stamp(&name, suffix) else {
                continue;
            };
            let candidate = SnapshotFile {
                path: entry.path(),
                stamp,
            };
            if latest
                .as_ref()
                .map(|current| candidate.stamp > current.stamp)
                .unwrap_or(true)
            {
                latest = Some(candidate);
            }
        }
        Ok(latest)
    }

    /// Write a reconciled snapshot atomically via temp file + rename and
    /// return its path with the sha256 of the written bytes.
    pub async fn store_reconciled(
        &self,
        stamp: NaiveDateTime,
        bytes: &[u8],
    ) -> Result<(PathBuf, String), StoreError> {
        let path = self.reconciled_path(stamp);
        self.write_atomic(&path, bytes).await?;
        Ok((path, Self::sha256_hex(bytes)))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let wrap = |source: std::io::Error| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };

        fs::create_dir_all(&self.root).await.map_err(wrap)?;
        let temp_path = self.root.join(format!(
            ".{}.{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "snapshot".to_string()),
            bytes.len()
        ));

        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(wrap)?;
        file.write_all(bytes).await.map_err(wrap)?;
        file.flush().await.map_err(wrap)?;
        drop(file);

        fs::rename(&temp_path, path).await.map_err(wrap)
    }
}

fn parse_stamp(file_name: &str, suffix: &str) -> Option<NaiveDateTime> {
    let rest = file_name.strip_prefix(RAW_PREFIX)?;
    let stamp = rest.strip_suffix(suffix)?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()
}

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
    pub backoff: BackoffPolicy,
    pub min_call_spacing: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            min_call_spacing: None,
        }
    }
}

/// Enforces a minimum spacing between calls. The free geocoding provider's
/// usage policy requires at least one second between requests.
#[derive(Debug)]
pub struct CallSpacer {
    min_spacing: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CallSpacer {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_call: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_spacing {
                tokio::time::sleep(self.min_spacing - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

/// HTTP client with retry/backoff and optional inter-call spacing.
///
/// The pipeline is sequential, so there is no concurrency limiting here;
/// rate limiting is the only contention concern.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    spacer: Option<Arc<CallSpacer>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let spacer = config
            .min_call_spacing
            .map(|spacing| Arc::new(CallSpacer::new(spacing)));

        Ok(Self {
            client,
            spacer,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        if let Some(spacer) = &self.spacer {
            spacer.wait().await;
        }

        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
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
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stamp(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, STAMP_FORMAT).expect("stamp")
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn filename_stamp_round_trips() {
        let store = SnapshotStore::new("/tmp/cabins");
        let at = stamp("20260823-060000");
        let raw = store.raw_path(at);
        let name = raw.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "etuovi_data_20260823-060000.json");
        assert_eq!(parse_stamp(&name, ".json"), Some(at));
    }

    #[tokio::test]
    async fn latest_raw_picks_newest_and_skips_reconciled() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());

        for name in [
            "etuovi_data_20260809-060000.json",
            "etuovi_data_20260816-060000.json",
            "etuovi_data_20260816-060000.reconciled.json",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"{}").expect("write fixture");
        }

        let latest = store.latest_raw().await.expect("list").expect("some");
        assert_eq!(latest.stamp, stamp("20260816-060000"));
        assert_eq!(
            latest.snapshot_date(),
            NaiveDate::from_ymd_opt(2026, 8, 16).unwrap()
        );
        assert!(latest
            .path
            .to_string_lossy()
            .ends_with("etuovi_data_20260816-060000.json"));

        let reconciled = store
            .latest_reconciled()
            .await
            .expect("list")
            .expect("some");
        assert!(reconciled
            .path
            .to_string_lossy()
            .ends_with(".reconciled.json"));
    }

    #[tokio::test]
    async fn reconciled_writes_are_atomic_and_hashed() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let at = stamp("20260823-060000");

        let (path, sha256) = store
            .store_reconciled(at, b"[{\"url\":\"u\"}]")
            .await
            .expect("store");

        assert!(path.exists());
        assert_eq!(sha256, SnapshotStore::sha256_hex(b"[{\"url\":\"u\"}]"));
        assert_eq!(std::fs::read(&path).unwrap(), b"[{\"url\":\"u\"}]");
        // no leftover temp files
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn call_spacer_enforces_minimum_gap() {
        let spacer = CallSpacer::new(Duration::from_millis(50));
        let started = Instant::now();
        spacer.wait().await;
        spacer.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
