//! Timestamp join of comments, attachments and history into timeline entries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bug_record::BugRecord;
use crate::change_record::{Attachment, ChangeRecord, Comment, HistoryChange, Person};

const CC_FIELD_NAME: &str = "cc";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Enumerates supported timeline sort orders.
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ascending => "ascending",
            Self::Descending => "descending",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ascending" | "asc" => Some(Self::Ascending),
            "descending" | "desc" => Some(Self::Descending),
            _ => None,
        }
    }

    /// True when an entry at `time` belongs before an entry at `other`.
    fn precedes(&self, time: DateTime<Utc>, other: DateTime<Utc>) -> bool {
        match self {
            Self::Ascending => time < other,
            Self::Descending => time > other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One merged, timestamp-keyed unit of a bug timeline.
///
/// At most one record of each kind occupies the slots. A second record of
/// the same kind sharing the exact timestamp is kept in `overflow` in
/// arrival order so that nothing is dropped and the entry stays unique
/// per `(bug_id, time)`.
pub struct Entry {
    pub bug_id: u64,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<Comment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overflow: Vec<ChangeRecord>,
}

impl Entry {
    fn new(bug_id: u64, time: DateTime<Utc>) -> Self {
        Self {
            bug_id,
            time,
            comment: None,
            attachment: None,
            history: None,
            overflow: Vec::new(),
        }
    }

    /// True when the record already sits in a slot or in `overflow`.
    pub fn contains_record(&self, record: &ChangeRecord) -> bool {
        let in_slot = match record {
            ChangeRecord::Comment(comment) => self
                .comment
                .as_ref()
                .is_some_and(|existing| existing.id == comment.id),
            ChangeRecord::Attachment(attachment) => self
                .attachment
                .as_ref()
                .is_some_and(|existing| existing.id == attachment.id),
            ChangeRecord::History(history) => self.history.as_ref() == Some(history),
        };
        in_slot
            || self
                .overflow
                .iter()
                .any(|existing| same_record(existing, record))
    }

    fn absorb(&mut self, record: ChangeRecord) {
        if self.contains_record(&record) {
            return;
        }
        match record {
            ChangeRecord::Comment(comment) if self.comment.is_none() => {
                self.comment = Some(comment);
            }
            ChangeRecord::Attachment(attachment) if self.attachment.is_none() => {
                self.attachment = Some(attachment);
            }
            ChangeRecord::History(history) if self.history.is_none() => {
                self.history = Some(history);
            }
            other => self.overflow.push(other),
        }
    }

    pub fn is_no_comment(&self) -> bool {
        self.comment.is_none()
    }

    /// Field names touched by the history change, in delta order.
    pub fn changed_fields(&self) -> Vec<&str> {
        self.history
            .as_ref()
            .map(|history| history.field_names().collect())
            .unwrap_or_default()
    }

    /// True for a comment-less entry whose single change is a CC list edit.
    pub fn is_cc_only(&self) -> bool {
        self.is_no_comment() && self.changed_fields() == [CC_FIELD_NAME]
    }

    pub fn author(&self) -> Option<&Person> {
        self.comment
            .as_ref()
            .map(|comment| &comment.creator)
            .or_else(|| self.history.as_ref().map(|history| &history.changer))
    }

    /// The history changer when a comment author is shown and their
    /// display names differ.
    pub fn secondary_author(&self) -> Option<&Person> {
        let comment = self.comment.as_ref()?;
        let history = self.history.as_ref()?;
        (history.changer.display_name() != comment.creator.display_name())
            .then_some(&history.changer)
    }

    pub fn record_count(&self) -> usize {
        usize::from(self.comment.is_some())
            + usize::from(self.attachment.is_some())
            + usize::from(self.history.is_some())
            + self.overflow.len()
    }
}

fn same_record(left: &ChangeRecord, right: &ChangeRecord) -> bool {
    match (left, right) {
        (ChangeRecord::Comment(left), ChangeRecord::Comment(right)) => left.id == right.id,
        (ChangeRecord::Attachment(left), ChangeRecord::Attachment(right)) => left.id == right.id,
        (ChangeRecord::History(left), ChangeRecord::History(right)) => left == right,
        _ => false,
    }
}

/// Joins the three record streams of one bug into ordered entries.
///
/// Records are bucketed by exact timestamp: comments first, then
/// attachments, then history, so a history change sharing a comment's
/// timestamp lands on the comment's entry. The result is stably sorted by
/// time in the requested order.
pub fn merge_timeline(
    bug_id: u64,
    comments: &[Comment],
    attachments: &[Attachment],
    history: &[HistoryChange],
    order: SortOrder,
) -> Vec<Entry> {
    let mut entries: Vec<Entry> = Vec::new();
    let mut index_by_time: HashMap<DateTime<Utc>, usize> = HashMap::new();

    let records = comments
        .iter()
        .cloned()
        .map(ChangeRecord::from)
        .chain(attachments.iter().cloned().map(ChangeRecord::from))
        .chain(history.iter().cloned().map(ChangeRecord::from));
    for record in records {
        let time = record.time();
        let index = *index_by_time.entry(time).or_insert_with(|| {
            entries.push(Entry::new(bug_id, time));
            entries.len() - 1
        });
        entries[index].absorb(record);
    }

    match order {
        SortOrder::Ascending => entries.sort_by(|left, right| left.time.cmp(&right.time)),
        SortOrder::Descending => entries.sort_by(|left, right| right.time.cmp(&left.time)),
    }
    entries
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where an incremental record landed in the timeline.
pub struct TimelineUpdate {
    pub index: usize,
    pub created: bool,
    /// The record was already rendered; the timeline is unchanged.
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Ordered, incrementally extendable timeline for one bug.
pub struct Timeline {
    bug_id: u64,
    order: SortOrder,
    entries: Vec<Entry>,
}

impl Timeline {
    pub fn new(bug_id: u64, order: SortOrder) -> Self {
        Self {
            bug_id,
            order,
            entries: Vec::new(),
        }
    }

    pub fn from_records(
        bug_id: u64,
        comments: &[Comment],
        attachments: &[Attachment],
        history: &[HistoryChange],
        order: SortOrder,
    ) -> Self {
        Self {
            bug_id,
            order,
            entries: merge_timeline(bug_id, comments, attachments, history, order),
        }
    }

    pub fn from_bug(bug: &BugRecord, order: SortOrder) -> Self {
        Self::from_records(
            bug.id,
            bug.comments.as_deref().unwrap_or_default(),
            bug.attachments.as_deref().unwrap_or_default(),
            bug.history.as_deref().unwrap_or_default(),
            order,
        )
    }

    pub fn bug_id(&self) -> u64 {
        self.bug_id
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Entry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds one record into the timeline without re-merging.
    ///
    /// The record extends the entry at its exact timestamp when one exists;
    /// otherwise a new entry is inserted at its sorted position, which is the
    /// tail for ascending order and the head for descending order when the
    /// record is the newest. A record the entry already holds is reported
    /// as `duplicate` and leaves the timeline untouched.
    pub fn apply(&mut self, record: ChangeRecord) -> TimelineUpdate {
        let time = record.time();
        let index = self
            .entries
            .partition_point(|entry| self.order.precedes(entry.time, time));
        if let Some(entry) = self.entries.get_mut(index).filter(|entry| entry.time == time) {
            let duplicate = entry.contains_record(&record);
            if !duplicate {
                entry.absorb(record);
            }
            return TimelineUpdate {
                index,
                created: false,
                duplicate,
            };
        }
        let mut entry = Entry::new(self.bug_id, time);
        entry.absorb(record);
        self.entries.insert(index, entry);
        TimelineUpdate {
            index,
            created: true,
            duplicate: false,
        }
    }
}
