//! Bug timeline model and merge helpers for Bugfeed.
//!
//! This crate owns the pure side of the client: the change-record shapes
//! mirrored from the tracker, the cached bug aggregate, the timestamp join
//! that turns comments, attachments and history into timeline entries, and
//! the read-state partitioning applied before an external renderer draws
//! them. Nothing here performs I/O.

pub mod bug_record;
pub mod change_record;
pub mod field_catalog;
pub mod read_state;
pub mod timeline_merge;

pub use bug_record::BugRecord;
pub use change_record::{
    Attachment, ChangeKind, ChangeRecord, Comment, FieldDelta, HistoryChange, Person,
};
pub use field_catalog::{
    describe_history, ChangeLine, FieldCatalog, FieldLookupStrategy, FieldMetadata,
    DEFAULT_LOOKUP_CHAIN,
};
pub use read_state::{
    collapse_summary, is_entry_read, older_comments_label, partition, CollapseSummary,
    ReadPartition, ReadState, SummaryPosition, TaggedEntry,
};
pub use timeline_merge::{merge_timeline, Entry, SortOrder, Timeline, TimelineUpdate};
