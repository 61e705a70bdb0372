//! Rendered-timeline state kept current by pushed changes.

use bugfeed_timeline::{
    describe_history, partition, BugRecord, ChangeLine, ChangeRecord, FieldCatalog, ReadPartition,
    SortOrder, Timeline, TimelineUpdate,
};
use chrono::{DateTime, Utc};

use crate::change_reconciler::AppliedChange;

#[derive(Debug, Clone)]
pub struct LiveTimeline {
    timeline: Timeline,
    last_viewed: Option<DateTime<Utc>>,
    delayed: bool,
    dirty_fields: Vec<String>,
}

impl LiveTimeline {
    /// Builds the timeline from a cached bug.
    ///
    /// `delayed` marks a bug whose details were fetched after it was opened.
    pub fn from_bug(bug: &BugRecord, order: SortOrder, delayed: bool) -> Self {
        Self {
            timeline: bug.timeline(order),
            last_viewed: bug.last_viewed,
            delayed,
            dirty_fields: Vec::new(),
        }
    }

    pub fn bug_id(&self) -> u64 {
        self.timeline.bug_id()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn last_viewed(&self) -> Option<DateTime<Utc>> {
        self.last_viewed
    }

    /// Extends the timeline with one pushed record. Changes for other bugs
    /// are ignored; a record the timeline already shows comes back as a
    /// `duplicate` update.
    pub fn apply(&mut self, change: &AppliedChange) -> Option<TimelineUpdate> {
        if change.bug_id != self.bug_id() {
            return None;
        }
        let update = self.timeline.apply(change.record.clone());
        if update.duplicate {
            return Some(update);
        }
        for field_name in change.partial_fields() {
            if !self.dirty_fields.iter().any(|dirty| dirty == field_name) {
                self.dirty_fields.push(field_name.to_string());
            }
        }
        Some(update)
    }

    /// Scalar fields changed by pushed history since the last call.
    pub fn take_dirty_fields(&mut self) -> Vec<String> {
        std::mem::take(&mut self.dirty_fields)
    }

    pub fn mark_viewed(&mut self, time: DateTime<Utc>) {
        self.last_viewed = Some(time);
        self.delayed = false;
    }

    pub fn partition(&self) -> ReadPartition<'_> {
        partition(
            self.timeline.entries(),
            self.last_viewed,
            self.delayed,
            self.timeline.order(),
        )
    }

    /// History lines of the entry at `index`, including overflow records.
    pub fn change_lines(&self, index: usize, catalog: &FieldCatalog) -> Vec<ChangeLine> {
        let Some(entry) = self.timeline.entries().get(index) else {
            return Vec::new();
        };
        let overflow = entry.overflow.iter().filter_map(|record| match record {
            ChangeRecord::History(history) => Some(history),
            ChangeRecord::Comment(_) | ChangeRecord::Attachment(_) => None,
        });
        entry
            .history
            .iter()
            .chain(overflow)
            .flat_map(|history| describe_history(history, catalog))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bugfeed_timeline::{
        BugRecord, ChangeKind, ChangeRecord, Comment, FieldCatalog, FieldDelta, FieldMetadata,
        HistoryChange, Person, ReadState, SortOrder,
    };
    use chrono::{DateTime, TimeZone, Utc};

    use super::LiveTimeline;
    use crate::change_reconciler::AppliedChange;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_420_000_000 + seconds, 0)
            .single()
            .expect("valid timestamp")
    }

    fn comment(id: u64, seconds: i64) -> Comment {
        Comment {
            id,
            creator: Person::new("alice@example.com"),
            creation_time: at(seconds),
            raw_text: format!("comment {id}"),
            text: None,
        }
    }

    fn bug() -> BugRecord {
        let mut bug = BugRecord::new(42);
        bug.comments = Some(vec![comment(1, 10), comment(2, 20), comment(3, 30)]);
        bug.last_viewed = Some(at(35));
        bug
    }

    fn applied(bug_id: u64, record: ChangeRecord) -> AppliedChange {
        AppliedChange {
            bug_id,
            kind: record.kind(),
            record,
            mirrored_fields: Vec::new(),
        }
    }

    #[test]
    fn functional_pushed_comment_is_appended_and_unread() {
        let mut live = LiveTimeline::from_bug(&bug(), SortOrder::Ascending, false);
        let update = live
            .apply(&applied(42, comment(4, 40).into()))
            .expect("applied to this bug");
        assert!(update.created);
        assert_eq!(update.index, 3);

        let partition = live.partition();
        assert_eq!(partition.read_count, 3);
        assert_eq!(partition.unread_count, 1);
        assert_eq!(partition.entries[3].state, ReadState::Unread);
        assert_eq!(
            partition.summary.map(|summary| summary.label),
            Some("2 older comments".to_string())
        );
    }

    #[test]
    fn functional_descending_timeline_inserts_pushed_entries_first() {
        let mut live = LiveTimeline::from_bug(&bug(), SortOrder::Descending, false);
        let update = live
            .apply(&applied(42, comment(4, 40).into()))
            .expect("applied");
        assert_eq!(update.index, 0);
        assert_eq!(live.timeline().entries()[0].time, at(40));
    }

    #[test]
    fn regression_change_already_in_cache_is_not_rendered_twice() {
        let mut cached = bug();
        cached.comments.get_or_insert_with(Vec::new).push(comment(4, 40));
        let mut live = LiveTimeline::from_bug(&cached, SortOrder::Ascending, false);

        let update = live
            .apply(&applied(42, comment(4, 40).into()))
            .expect("same bug");
        assert!(update.duplicate);
        assert!(!update.created);
        assert_eq!(live.timeline().len(), 4);
        assert_eq!(live.timeline().entries()[3].record_count(), 1);
        assert!(live.timeline().entries()[3].overflow.is_empty());
        assert!(live.take_dirty_fields().is_empty());
    }

    #[test]
    fn regression_changes_for_other_bugs_are_ignored() {
        let mut live = LiveTimeline::from_bug(&bug(), SortOrder::Ascending, false);
        assert!(live.apply(&applied(7, comment(9, 50).into())).is_none());
        assert_eq!(live.timeline().len(), 3);
    }

    #[test]
    fn integration_history_push_extends_entry_and_marks_fields_dirty() {
        let mut live = LiveTimeline::from_bug(&bug(), SortOrder::Ascending, false);
        let history = HistoryChange {
            change_time: at(30),
            changer: Person::new("bob@example.com"),
            changes: vec![FieldDelta {
                field_name: "status".to_string(),
                removed: "NEW".to_string(),
                added: "RESOLVED".to_string(),
            }],
        };
        let change = applied(42, history.into());
        assert_eq!(change.kind, ChangeKind::History);
        let update = live.apply(&change).expect("applied");
        assert!(!update.created);
        assert_eq!(update.index, 2);
        assert_eq!(live.take_dirty_fields(), vec!["status".to_string()]);
        assert!(live.take_dirty_fields().is_empty());

        let catalog = FieldCatalog::from_fields([FieldMetadata {
            name: "status".to_string(),
            description: "Status".to_string(),
        }]);
        let lines = live.change_lines(2, &catalog);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].render_plain(), "Status: NEW → RESOLVED");
        assert!(live.change_lines(99, &catalog).is_empty());
    }

    #[test]
    fn functional_mark_viewed_moves_watermark_and_clears_delay() {
        let mut live = LiveTimeline::from_bug(&bug(), SortOrder::Ascending, true);
        assert_eq!(live.partition().read_count, 0);
        live.mark_viewed(at(25));
        assert_eq!(live.last_viewed(), Some(at(25)));
        assert_eq!(live.partition().read_count, 2);
    }
}
