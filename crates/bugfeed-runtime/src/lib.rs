//! Async runtime for Bugfeed live bug updates.
//!
//! Hosts the tracker REST client, the bug cache collaborators, the change
//! reconciler and the push channel that keeps subscribed bugs current.

pub mod bug_api_client;
pub mod bug_cache_store;
pub mod change_reconciler;
pub mod live_timeline;
pub mod push_channel;
pub mod push_feed_runtime;
pub mod push_protocol;
pub mod subscription_registry;
mod transport_helpers;

pub use bug_api_client::{
    BugFetcher, FieldProjection, TrackerApiClient, ATTACHMENT_DATA_FIELD, DEFAULT_INCLUDE_FIELDS,
};
pub use bug_cache_store::{BugCache, BugLockGuard, BugStore, InMemoryBugCache, JsonFileBugCache};
pub use change_reconciler::{AppliedChange, ChangeReconciler, ReconcileError, ReconcileOutcome};
pub use live_timeline::LiveTimeline;
pub use push_channel::{
    spawn_push_channel, ChannelAction, ChannelEvent, ConnectionState, PushChannelConfig,
    PushChannelHandle, PushChannelMachine, UpdateReconciler, DEFAULT_RECONNECT_INTERVAL,
};
pub use push_feed_runtime::{
    start_push_feed, start_push_feed_with, PushFeed, PushFeedRuntimeConfig, DEFAULT_API_BASE,
};
pub use push_protocol::{
    parse_inbound_message, InboundMessage, OutboundCommand, ProtocolError, NORMAL_CLOSE_CODE,
};
pub use subscription_registry::SubscriptionRegistry;
