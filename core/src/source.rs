use crate::{RawRecord, SourceError};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Paged access to the remote catalog. An empty page marks the end.
pub trait PageSource: Send + Sync {
    fn fetch_page(&self, limit: usize, offset: u64) -> impl Future<Output = Result<Vec<RawRecord>, SourceError>> + Send;
}

/// Fetches `GET {base}?limit=N&offset=M` and decodes a JSON list of records.
#[derive(Clone)]
pub struct HttpPageSource {
    client: Client,
    base: Url,
}

// Some endpoints wrap the page in an envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum PageBody {
    List(Vec<RawRecord>),
    Envelope { data: Vec<RawRecord> },
}

impl HttpPageSource {
    pub fn new(base: &str, user_agent: &str, timeout: Duration) -> Result<Self, SourceError> {
        let base = Url::parse(base).map_err(|e| SourceError::new(format!("invalid source url {base}: {e}")))?;
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, base })
    }
}

impl PageSource for HttpPageSource {
    async fn fetch_page(&self, limit: usize, offset: u64) -> Result<Vec<RawRecord>, SourceError> {
        let resp = self
            .client
            .get(self.base.clone())
            .query(&[("limit", limit as u64), ("offset", offset)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::new(format!("{} returned {status}", self.base)));
        }
        let bytes = resp.bytes().await?;
        let body: PageBody = serde_json::from_slice(&bytes)
            .map_err(|e| SourceError::new(format!("undecodable page at offset {offset}: {e}")))?;
        Ok(match body {
            PageBody::List(v) => v,
            PageBody::Envelope { data } => data,
        })
    }
}

/// Exponential backoff, doubling from `base` and capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(100), max: Duration::from_secs(5) }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32 << attempt.min(16)).min(self.max)
    }
}

/// Run `op` up to `max_attempts` times, sleeping `backoff(attempt)` between
/// failures. Returns the last error if every attempt fails.
pub async fn with_retry<T, E, F, Fut, B>(mut op: F, max_attempts: u32, backoff: B) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: Fn(u32) -> Duration,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < max_attempts => {
                let delay = backoff(attempt);
                tracing::debug!(attempt, error = %e, ?delay, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wraps a source so each page request is retried with backoff.
pub struct RetryingSource<S> {
    inner: S,
    max_attempts: u32,
    backoff: Backoff,
}

impl<S: PageSource> RetryingSource<S> {
    pub fn new(inner: S, max_attempts: u32, backoff: Backoff) -> Self {
        Self { inner, max_attempts, backoff }
    }
}

impl<S: PageSource> PageSource for RetryingSource<S> {
    async fn fetch_page(&self, limit: usize, offset: u64) -> Result<Vec<RawRecord>, SourceError> {
        let backoff = self.backoff;
        with_retry(|| self.inner.fetch_page(limit, offset), self.max_attempts, move |n| backoff.delay(n)).await
    }
}
