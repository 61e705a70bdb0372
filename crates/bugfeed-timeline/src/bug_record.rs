//! Cached bug aggregate shared by the reconciler and the renderer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::change_record::{Attachment, ChangeRecord, Comment, HistoryChange};
use crate::timeline_merge::{SortOrder, Timeline};

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Authoritative local copy of one bug.
///
/// The three record lists are append-only. Scalar tracker fields (status,
/// summary, assignee, ...) live in `fields` and are last-writer-wins.
/// Underscore-prefixed keys are client annotations that never come from the
/// tracker.
pub struct BugRecord {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<Vec<Comment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryChange>>,
    #[serde(rename = "_update_needed", default, skip_serializing_if = "is_false")]
    pub update_needed: bool,
    #[serde(
        rename = "_last_viewed",
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_viewed: Option<DateTime<Utc>>,
    #[serde(rename = "_unread", default, skip_serializing_if = "is_false")]
    pub unread: bool,
    #[serde(rename = "_starred", default, skip_serializing_if = "is_false")]
    pub starred: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl BugRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn summary(&self) -> Option<&str> {
        self.fields
            .get("summary")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    /// True while only the id is known and nothing can be drawn yet.
    pub fn is_loading(&self) -> bool {
        self.summary().is_none() && !self.update_needed
    }

    /// True when comments, attachments and history must be (re)fetched
    /// before a full timeline render.
    pub fn needs_details(&self) -> bool {
        self.comments.is_none() || self.update_needed
    }

    /// Returns the first record of each kind whose join key equals `time`
    /// exactly, in comment, attachment, history order.
    pub fn records_at(&self, time: DateTime<Utc>) -> Vec<ChangeRecord> {
        let mut matched = Vec::new();
        if let Some(comment) = self
            .comments
            .iter()
            .flatten()
            .find(|comment| comment.creation_time == time)
        {
            matched.push(ChangeRecord::Comment(comment.clone()));
        }
        if let Some(attachment) = self
            .attachments
            .iter()
            .flatten()
            .find(|attachment| attachment.creation_time == time)
        {
            matched.push(ChangeRecord::Attachment(attachment.clone()));
        }
        if let Some(history) = self
            .history
            .iter()
            .flatten()
            .find(|history| history.change_time == time)
        {
            matched.push(ChangeRecord::History(history.clone()));
        }
        matched
    }

    pub fn contains_record(&self, record: &ChangeRecord) -> bool {
        match record {
            ChangeRecord::Comment(comment) => self
                .comments
                .iter()
                .flatten()
                .any(|existing| existing.id == comment.id),
            ChangeRecord::Attachment(attachment) => self
                .attachments
                .iter()
                .flatten()
                .any(|existing| existing.id == attachment.id),
            ChangeRecord::History(history) => {
                self.history.iter().flatten().any(|existing| existing == history)
            }
        }
    }

    /// Appends a record to its list, creating the list when absent.
    ///
    /// Returns false and leaves the record untouched when the record is
    /// already present.
    pub fn append_record(&mut self, record: &ChangeRecord) -> bool {
        if self.contains_record(record) {
            return false;
        }
        match record {
            ChangeRecord::Comment(comment) => self
                .comments
                .get_or_insert_with(Vec::new)
                .push(comment.clone()),
            ChangeRecord::Attachment(attachment) => self
                .attachments
                .get_or_insert_with(Vec::new)
                .push(attachment.clone()),
            ChangeRecord::History(history) => self
                .history
                .get_or_insert_with(Vec::new)
                .push(history.clone()),
        }
        true
    }

    /// Copies the current value of every field touched by `history` from
    /// `source` and flags the record for a full re-merge.
    ///
    /// Fields `source` did not carry keep their cached value until the full
    /// re-fetch. Returns the mirrored names.
    pub fn mirror_history_fields(
        &mut self,
        source: &BugRecord,
        history: &HistoryChange,
    ) -> Vec<String> {
        let mut mirrored = Vec::new();
        for field_name in history.field_names() {
            if field_name.starts_with('_') || mirrored.iter().any(|name| name == field_name) {
                continue;
            }
            let Some(value) = source.fields.get(field_name) else {
                continue;
            };
            self.fields.insert(field_name.to_string(), value.clone());
            mirrored.push(field_name.to_string());
        }
        self.update_needed = true;
        mirrored
    }

    /// Carries records from `cached` that this (freshly fetched) record lacks.
    ///
    /// A list the fetch did not return is taken over whole. Otherwise cached
    /// records missing from the fetch are appended after the fetched ones.
    /// Returns how many records were appended that way.
    pub fn retain_cached_records(&mut self, cached: &BugRecord) -> usize {
        if self.comments.is_none() {
            self.comments = cached.comments.clone();
        }
        if self.attachments.is_none() {
            self.attachments = cached.attachments.clone();
        }
        if self.history.is_none() {
            self.history = cached.history.clone();
        }
        let comments = cached.comments.iter().flatten().cloned().map(ChangeRecord::from);
        let attachments = cached
            .attachments
            .iter()
            .flatten()
            .cloned()
            .map(ChangeRecord::from);
        let history = cached.history.iter().flatten().cloned().map(ChangeRecord::from);
        comments
            .chain(attachments)
            .chain(history)
            .filter(|record| self.append_record(record))
            .count()
    }

    /// Builds the cache shell for a bug first seen through a push update.
    pub fn seed_from(source: &BugRecord) -> Self {
        Self {
            id: source.id,
            fields: source.fields.clone(),
            update_needed: true,
            ..Self::default()
        }
    }

    pub fn timeline(&self, order: SortOrder) -> Timeline {
        Timeline::from_bug(self, order)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use serde_json::json;

    use super::BugRecord;
    use crate::change_record::{ChangeKind, ChangeRecord};

    fn parse_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("rfc3339")
            .with_timezone(&Utc)
    }

    fn sample_bug() -> BugRecord {
        serde_json::from_value(json!({
            "id": 42,
            "summary": "Crash on startup",
            "status": "ASSIGNED",
            "comments": [{
                "id": 1,
                "creator": "alice@example.com",
                "creation_time": "2014-09-12T10:00:00Z",
                "raw_text": "first"
            }],
            "attachments": [{
                "id": 9,
                "creation_time": "2014-09-12T11:00:00Z",
                "description": "log",
                "file_name": "log.txt",
                "content_type": "text/plain",
                "size": 12
            }],
            "history": [{
                "change_time": "2014-09-12T11:00:00Z",
                "changer": "bob@example.com",
                "changes": [{"field_name": "status", "removed": "NEW", "added": "ASSIGNED"}]
            }],
            "_last_viewed": 1410519600000_i64
        }))
        .expect("bug record")
    }

    #[test]
    fn unit_bug_record_round_trips_client_annotations() {
        let bug = sample_bug();
        assert_eq!(bug.summary(), Some("Crash on startup"));
        assert_eq!(
            bug.last_viewed.map(|time| time.timestamp_millis()),
            Some(1_410_519_600_000)
        );
        assert!(!bug.fields.contains_key("_last_viewed"));

        let encoded = serde_json::to_value(&bug).expect("encode");
        assert_eq!(encoded["_last_viewed"], json!(1_410_519_600_000_i64));
        assert_eq!(encoded["status"], json!("ASSIGNED"));
        assert!(encoded.get("_update_needed").is_none());
    }

    #[test]
    fn functional_records_at_matches_exact_timestamps_per_kind() {
        let bug = sample_bug();
        let matched = bug.records_at(parse_time("2014-09-12T11:00:00Z"));
        let kinds = matched.iter().map(ChangeRecord::kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![ChangeKind::Attachment, ChangeKind::History]);

        assert!(bug
            .records_at(parse_time("2014-09-12T11:00:01Z"))
            .is_empty());
    }

    #[test]
    fn functional_append_record_creates_missing_lists_and_skips_duplicates() {
        let source = sample_bug();
        let mut cache = BugRecord::new(42);
        assert!(cache.needs_details());

        let records = source.records_at(parse_time("2014-09-12T11:00:00Z"));
        for record in &records {
            assert!(cache.append_record(record));
        }
        for record in &records {
            assert!(!cache.append_record(record));
        }
        assert_eq!(cache.attachments.as_ref().map(Vec::len), Some(1));
        assert_eq!(cache.history.as_ref().map(Vec::len), Some(1));
        assert!(cache.comments.is_none());
    }

    #[test]
    fn integration_mirror_history_fields_copies_values_and_flags_update() {
        let source = sample_bug();
        let mut cache: BugRecord =
            serde_json::from_value(json!({"id": 42, "status": "NEW", "comments": []}))
                .expect("cache");
        let Some(ChangeRecord::History(history)) = source
            .records_at(parse_time("2014-09-12T11:00:00Z"))
            .into_iter()
            .find(|record| matches!(record, ChangeRecord::History(_)))
        else {
            panic!("history record expected");
        };

        let mirrored = cache.mirror_history_fields(&source, &history);
        assert_eq!(mirrored, vec!["status".to_string()]);
        assert_eq!(cache.fields["status"], json!("ASSIGNED"));
        assert!(cache.update_needed);
        assert!(cache.needs_details());
    }

    #[test]
    fn regression_mirror_keeps_fields_missing_from_a_narrow_fetch() {
        let source: BugRecord =
            serde_json::from_value(json!({"id": 42, "summary": "Crash"})).expect("source");
        let mut cache: BugRecord =
            serde_json::from_value(json!({"id": 42, "status": "NEW", "comments": []}))
                .expect("cache");
        let Some(ChangeRecord::History(history)) = sample_bug()
            .records_at(parse_time("2014-09-12T11:00:00Z"))
            .into_iter()
            .find(|record| matches!(record, ChangeRecord::History(_)))
        else {
            panic!("history record expected");
        };

        let mirrored = cache.mirror_history_fields(&source, &history);
        assert!(mirrored.is_empty());
        assert_eq!(cache.fields["status"], json!("NEW"));
        assert!(cache.update_needed);
    }

    #[test]
    fn functional_retain_cached_records_keeps_records_missing_from_fetch() {
        let cached = sample_bug();
        let mut fetched: BugRecord = serde_json::from_value(json!({
            "id": 42,
            "comments": [{
                "id": 1,
                "creator": "alice@example.com",
                "creation_time": "2014-09-12T10:00:00Z",
                "raw_text": "first"
            }, {
                "id": 2,
                "creator": "bob@example.com",
                "creation_time": "2014-09-12T12:00:00Z",
                "raw_text": "second"
            }],
            "attachments": []
        }))
        .expect("fetched");

        assert_eq!(fetched.retain_cached_records(&cached), 1);
        let comment_ids = fetched
            .comments
            .iter()
            .flatten()
            .map(|comment| comment.id)
            .collect::<Vec<_>>();
        assert_eq!(comment_ids, vec![1, 2]);
        assert_eq!(fetched.attachments.as_ref().map(Vec::len), Some(1));
        assert_eq!(fetched.history, cached.history);
        assert_eq!(fetched.retain_cached_records(&cached), 0);
    }

    #[test]
    fn regression_loading_state_requires_summary_or_update_marker() {
        let mut bug = BugRecord::new(7);
        assert!(bug.is_loading());
        bug.update_needed = true;
        assert!(!bug.is_loading());
        let seeded = BugRecord::seed_from(&sample_bug());
        assert!(!seeded.is_loading());
        assert!(seeded.update_needed);
        assert!(seeded.comments.is_none());
    }
}
