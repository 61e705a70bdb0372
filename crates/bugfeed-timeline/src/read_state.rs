//! Read/unread partitioning of timeline entries against a last-viewed watermark.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::timeline_merge::{Entry, SortOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadState {
    Read,
    Unread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
/// Where the collapsed-history expander sits relative to the entries.
pub enum SummaryPosition {
    /// Before the first entry (ascending timelines).
    Leading,
    /// After the last entry (descending timelines).
    Trailing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollapseSummary {
    pub hidden_count: usize,
    pub label: String,
    pub position: SummaryPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaggedEntry<'a> {
    pub entry: &'a Entry,
    pub state: ReadState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadPartition<'a> {
    pub entries: Vec<TaggedEntry<'a>>,
    /// Read entries that count toward the collapse summary.
    pub read_count: usize,
    pub unread_count: usize,
    pub summary: Option<CollapseSummary>,
}

/// True when the entry was already seen.
///
/// `delayed` is set when details were fetched after the bug was opened; the
/// watermark has already moved past everything by then, so nothing counts
/// as read.
pub fn is_entry_read(
    entry_time: DateTime<Utc>,
    last_viewed: Option<DateTime<Utc>>,
    delayed: bool,
) -> bool {
    !delayed && last_viewed.is_some_and(|watermark| watermark > entry_time)
}

pub fn older_comments_label(hidden_count: usize) -> String {
    if hidden_count == 1 {
        "1 older comment".to_string()
    } else {
        format!("{hidden_count} older comments")
    }
}

/// Summary line hiding all but the most recent read entry; none for fewer
/// than two read entries.
pub fn collapse_summary(read_count: usize, order: SortOrder) -> Option<CollapseSummary> {
    if read_count <= 1 {
        return None;
    }
    let hidden_count = read_count - 1;
    Some(CollapseSummary {
        hidden_count,
        label: older_comments_label(hidden_count),
        position: match order {
            SortOrder::Ascending => SummaryPosition::Leading,
            SortOrder::Descending => SummaryPosition::Trailing,
        },
    })
}

pub fn partition(
    entries: &[Entry],
    last_viewed: Option<DateTime<Utc>>,
    delayed: bool,
    order: SortOrder,
) -> ReadPartition<'_> {
    let mut read_count = 0_usize;
    let mut unread_count = 0_usize;
    let tagged = entries
        .iter()
        .map(|entry| {
            let state = if is_entry_read(entry.time, last_viewed, delayed) {
                if !entry.is_cc_only() {
                    read_count = read_count.saturating_add(1);
                }
                ReadState::Read
            } else {
                unread_count = unread_count.saturating_add(1);
                ReadState::Unread
            };
            TaggedEntry { entry, state }
        })
        .collect::<Vec<_>>();

    ReadPartition {
        entries: tagged,
        read_count,
        unread_count,
        summary: collapse_summary(read_count, order),
    }
}
