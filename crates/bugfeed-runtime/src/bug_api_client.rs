//! Tracker REST client used to fetch authoritative bug representations.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bugfeed_timeline::BugRecord;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::transport_helpers::{
    is_retryable_tracker_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};

/// Attachment payloads are never pulled through the bug endpoint.
pub const ATTACHMENT_DATA_FIELD: &str = "attachments.data";

pub const DEFAULT_INCLUDE_FIELDS: &[&str] = &[
    "id",
    "summary",
    "status",
    "resolution",
    "product",
    "component",
    "severity",
    "priority",
    "assigned_to",
    "creator",
    "creation_time",
    "last_change_time",
    "keywords",
    "whiteboard",
    "cc",
    "depends_on",
    "blocks",
    "see_also",
    "dupe_of",
    "flags",
    "comments",
    "attachments",
    "history",
];

#[derive(Debug, Clone, PartialEq, Eq)]
/// `include_fields` / `exclude_fields` projection sent with every bug fetch.
pub struct FieldProjection {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Default for FieldProjection {
    fn default() -> Self {
        Self::new(DEFAULT_INCLUDE_FIELDS.iter().copied(), Vec::<String>::new())
    }
}

impl FieldProjection {
    /// Builds a projection; `attachments.data` is always excluded.
    pub fn new<I, E, S, T>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let mut exclude = exclude
            .into_iter()
            .map(Into::<String>::into)
            .collect::<Vec<_>>();
        if !exclude.iter().any(|field| field == ATTACHMENT_DATA_FIELD) {
            exclude.push(ATTACHMENT_DATA_FIELD.to_string());
        }
        Self {
            include: include
                .into_iter()
                .map(Into::<String>::into)
                .filter(|field| !field.trim().is_empty())
                .collect(),
            exclude,
        }
    }

    pub fn include(&self) -> &[String] {
        &self.include
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if !self.include.is_empty() {
            pairs.push(("include_fields", self.include.join(",")));
        }
        pairs.push(("exclude_fields", self.exclude.join(",")));
        pairs
    }
}

#[async_trait]
/// Trait contract for fetching one bug with a field projection.
pub trait BugFetcher: Send + Sync {
    async fn fetch_bug(&self, bug_id: u64, projection: &FieldProjection) -> Result<BugRecord>;
}

#[derive(Debug, Deserialize)]
struct TrackerBugsResponse {
    #[serde(default)]
    bugs: Vec<BugRecord>,
}

#[derive(Clone)]
pub struct TrackerApiClient {
    http: reqwest::Client,
    api_base: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl TrackerApiClient {
    pub fn new(
        api_base: String,
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("bugfeed-client"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create tracker api client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
        })
    }

    pub async fn get_bug(&self, bug_id: u64, projection: &FieldProjection) -> Result<BugRecord> {
        let query = projection.query_pairs();
        let response: TrackerBugsResponse = self
            .request_json("get bug", || {
                self.http
                    .get(format!("{}/bug/{bug_id}", self.api_base))
                    .query(&query)
            })
            .await?;
        let bug = response
            .bugs
            .into_iter()
            .find(|bug| bug.id == bug_id)
            .ok_or_else(|| anyhow!("tracker response did not include bug {bug_id}"))?;
        if bug.comments.is_none() {
            bail!("tracker response for bug {bug_id} did not include comments");
        }
        Ok(bug)
    }

    async fn request_json<T, F>(&self, operation: &str, mut request_builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = request_builder()
                .header("x-bugfeed-retry-attempt", attempt.saturating_sub(1).to_string())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed = response
                            .json::<T>()
                            .await
                            .with_context(|| format!("failed to decode tracker {operation}"))?;
                        return Ok(parsed);
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts
                        && is_retryable_tracker_status(status.as_u16())
                    {
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    bail!(
                        "tracker api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("tracker api {operation} request failed"));
                }
            }
        }
    }
}

#[async_trait]
impl BugFetcher for TrackerApiClient {
    async fn fetch_bug(&self, bug_id: u64, projection: &FieldProjection) -> Result<BugRecord> {
        self.get_bug(bug_id, projection).await
    }
}
