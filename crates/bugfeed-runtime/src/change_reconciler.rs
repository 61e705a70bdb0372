//! Turns a push notification into concrete cache mutations.

use std::sync::Arc;

use bugfeed_timeline::{BugRecord, ChangeKind, ChangeRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::bug_api_client::{BugFetcher, FieldProjection};
use crate::bug_cache_store::BugStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
/// One record appended to the cache, handed to whoever renders the bug.
pub struct AppliedChange {
    pub bug_id: u64,
    pub kind: ChangeKind,
    pub record: ChangeRecord,
    /// Scalar fields mirrored from the fetched bug for a history change.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mirrored_fields: Vec<String>,
}

impl AppliedChange {
    /// Scalar fields a renderer should redraw after this change.
    pub fn partial_fields(&self) -> Vec<&str> {
        match &self.record {
            ChangeRecord::History(history) => {
                let mut fields = Vec::new();
                for field_name in history.field_names() {
                    if !fields.contains(&field_name) {
                        fields.push(field_name);
                    }
                }
                fields
            }
            ChangeRecord::Comment(_) | ChangeRecord::Attachment(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied(Vec<AppliedChange>),
    /// No record carries the notified timestamp.
    Stale,
    /// Every matching record is already cached.
    Duplicate,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Stale => "stale",
            Self::Duplicate => "duplicate",
        }
    }

    pub fn applied(&self) -> &[AppliedChange] {
        match self {
            Self::Applied(changes) => changes,
            Self::Stale | Self::Duplicate => &[],
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to fetch bug: {0:#}")]
    Fetch(anyhow::Error),
    #[error("failed to load cached bug: {0:#}")]
    CacheLoad(anyhow::Error),
    #[error("failed to save cached bug: {0:#}")]
    CacheSave(anyhow::Error),
}

#[derive(Clone)]
pub struct ChangeReconciler {
    fetcher: Arc<dyn BugFetcher>,
    store: Arc<BugStore>,
    projection: FieldProjection,
}

impl ChangeReconciler {
    pub fn new(
        fetcher: Arc<dyn BugFetcher>,
        store: Arc<BugStore>,
        projection: FieldProjection,
    ) -> Self {
        Self {
            fetcher,
            store,
            projection,
        }
    }

    pub fn store(&self) -> &Arc<BugStore> {
        &self.store
    }

    /// Fetches `bug_id`, finds the records stamped exactly `when` and appends
    /// the ones the cache does not hold yet.
    ///
    /// The fetch runs outside the per-bug lock; the cache read-modify-write
    /// runs inside it.
    pub async fn reconcile(
        &self,
        bug_id: u64,
        when: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let fetched = self
            .fetcher
            .fetch_bug(bug_id, &self.projection)
            .await
            .map_err(ReconcileError::Fetch)?;
        let matched = fetched.records_at(when);
        if matched.is_empty() {
            tracing::debug!(bug_id, %when, "dropping stale bug notification");
            return Ok(ReconcileOutcome::Stale);
        }

        let _guard = self.store.lock_bug(bug_id).await;
        let mut cached = self
            .store
            .get(bug_id)
            .await
            .map_err(ReconcileError::CacheLoad)?
            .unwrap_or_else(|| BugRecord::seed_from(&fetched));

        let mut applied = Vec::new();
        for record in matched {
            if !cached.append_record(&record) {
                continue;
            }
            applied.push(AppliedChange {
                bug_id,
                kind: record.kind(),
                record,
                mirrored_fields: Vec::new(),
            });
        }
        if applied.is_empty() {
            tracing::debug!(bug_id, %when, "bug notification already reconciled");
            return Ok(ReconcileOutcome::Duplicate);
        }

        for change in &mut applied {
            if let ChangeRecord::History(history) = &change.record {
                change.mirrored_fields = cached.mirror_history_fields(&fetched, history);
            }
        }

        self.store
            .cache()
            .save(&cached)
            .await
            .map_err(ReconcileError::CacheSave)?;
        tracing::debug!(
            bug_id,
            %when,
            applied = applied.len(),
            "reconciled bug notification"
        );
        Ok(ReconcileOutcome::Applied(applied))
    }
}
