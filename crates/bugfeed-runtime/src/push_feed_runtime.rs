//! Wires the tracker client, bug cache, reconciler and push channel together.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bugfeed_timeline::{BugRecord, SortOrder};
use tokio::sync::mpsc;

use crate::bug_api_client::{BugFetcher, FieldProjection, TrackerApiClient};
use crate::bug_cache_store::{BugStore, JsonFileBugCache};
use crate::change_reconciler::{AppliedChange, ChangeReconciler};
use crate::live_timeline::LiveTimeline;
use crate::push_channel::{
    spawn_push_channel, PushChannelConfig, PushChannelHandle, DEFAULT_RECONNECT_INTERVAL,
};

pub const DEFAULT_API_BASE: &str = "https://bugzilla.mozilla.org/rest";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
/// Runtime configuration for the push-driven bug feed.
pub struct PushFeedRuntimeConfig {
    /// Push service url; `None` runs without live updates.
    pub websocket_endpoint: Option<String>,
    pub api_base: String,
    pub cache_dir: PathBuf,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub reconnect_interval: Duration,
    pub field_projection: FieldProjection,
    pub sort_order: SortOrder,
    pub event_buffer: usize,
}

impl Default for PushFeedRuntimeConfig {
    fn default() -> Self {
        Self {
            websocket_endpoint: None,
            api_base: DEFAULT_API_BASE.to_string(),
            cache_dir: PathBuf::from(".bugfeed/bugs"),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            field_projection: FieldProjection::default(),
            sort_order: SortOrder::Ascending,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Running feed: the channel handle plus the stream of applied changes.
pub struct PushFeed {
    pub channel: PushChannelHandle,
    pub updates: mpsc::Receiver<AppliedChange>,
    pub store: Arc<BugStore>,
    fetcher: Arc<dyn BugFetcher>,
    projection: FieldProjection,
    sort_order: SortOrder,
}

impl PushFeed {
    /// Returns the cached bug, fetching full details first when the cache
    /// holds none or flags the record for an update.
    ///
    /// The boolean is true when details had to be fetched.
    pub async fn load_bug(&self, bug_id: u64) -> Result<(BugRecord, bool)> {
        if let Some(bug) = self.store.get(bug_id).await? {
            if !bug.needs_details() {
                return Ok((bug, false));
            }
        }
        let fetched = self
            .fetcher
            .fetch_bug(bug_id, &self.projection)
            .await
            .with_context(|| format!("failed to load bug {bug_id}"))?;
        Ok((self.store.store_full_fetch(fetched).await?, true))
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    pub async fn live_timeline(&self, bug_id: u64) -> Result<LiveTimeline> {
        let (bug, delayed) = self.load_bug(bug_id).await?;
        Ok(LiveTimeline::from_bug(&bug, self.sort_order, delayed))
    }

    pub async fn shutdown(self) -> Result<()> {
        self.channel.shutdown().await
    }
}

/// Builds every collaborator and spawns the push channel worker.
///
/// The channel is left disconnected; callers subscribe and connect.
pub fn start_push_feed(config: PushFeedRuntimeConfig) -> Result<PushFeed> {
    let client = TrackerApiClient::new(
        config.api_base.clone(),
        config.request_timeout_ms,
        config.retry_max_attempts,
        config.retry_base_delay_ms,
    )?;
    let cache = JsonFileBugCache::open(config.cache_dir.clone())?;
    start_push_feed_with(config, Arc::new(client), Arc::new(BugStore::new(Arc::new(cache))))
}

pub fn start_push_feed_with(
    config: PushFeedRuntimeConfig,
    fetcher: Arc<dyn BugFetcher>,
    store: Arc<BugStore>,
) -> Result<PushFeed> {
    let event_buffer = config.event_buffer.max(1);
    let reconciler = ChangeReconciler::new(
        fetcher.clone(),
        store.clone(),
        config.field_projection.clone(),
    );
    let (updates_tx, updates_rx) = mpsc::channel(event_buffer);
    let channel = spawn_push_channel(
        PushChannelConfig {
            endpoint: config.websocket_endpoint.clone(),
            reconnect_interval: config.reconnect_interval,
            event_buffer,
        },
        Arc::new(reconciler),
        updates_tx,
    );
    tracing::debug!(
        api_base = %config.api_base,
        live = config.websocket_endpoint.is_some(),
        "push feed started"
    );
    Ok(PushFeed {
        channel,
        updates: updates_rx,
        store,
        fetcher,
        projection: config.field_projection,
        sort_order: config.sort_order,
    })
}
