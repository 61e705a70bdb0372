//! Change-record shapes mirrored from the tracker's bug representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const ATTACHMENT_PREAMBLE_PREFIX: &str = "Created attachment ";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PersonRepr")]
/// Account reference attached to comments and history changes.
pub struct Person {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PersonRepr {
    Login(String),
    Detailed {
        #[serde(default)]
        name: String,
        #[serde(default)]
        real_name: Option<String>,
    },
}

impl From<PersonRepr> for Person {
    fn from(value: PersonRepr) -> Self {
        match value {
            PersonRepr::Login(name) => Self {
                name,
                real_name: None,
            },
            PersonRepr::Detailed { name, real_name } => Self {
                name,
                real_name: real_name.filter(|value| !value.trim().is_empty()),
            },
        }
    }
}

impl Person {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            real_name: None,
        }
    }

    /// Returns the real name when the tracker reports one, else the login.
    pub fn display_name(&self) -> &str {
        self.real_name.as_deref().unwrap_or(self.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub creator: Person,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Comment {
    /// Returns the comment body, preferring `raw_text`.
    ///
    /// Older tracker responses only carry the rendered `text`, which starts
    /// with a "Created attachment N" line plus the attachment description when
    /// the comment was generated by an upload. That preamble is dropped.
    pub fn body(&self) -> String {
        if !self.raw_text.is_empty() {
            return self.raw_text.clone();
        }
        strip_attachment_preamble(self.text.as_deref().unwrap_or_default())
    }
}

fn strip_attachment_preamble(text: &str) -> String {
    let Some(rest) = text.strip_prefix(ATTACHMENT_PREAMBLE_PREFIX) else {
        return text.to_string();
    };
    let Some((id, after_id)) = rest.split_once('\n') else {
        return text.to_string();
    };
    if id.is_empty() || !id.bytes().all(|byte| byte.is_ascii_digit()) {
        return text.to_string();
    }
    let Some((description, body)) = after_id.split_once('\n') else {
        return String::new();
    };
    if description.is_empty() {
        return text.to_string();
    }
    body.strip_prefix('\n').unwrap_or(body).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: u64,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_patch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One `{field_name, removed, added}` delta inside a history change.
pub struct FieldDelta {
    pub field_name: String,
    #[serde(default)]
    pub removed: String,
    #[serde(default)]
    pub added: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryChange {
    #[serde(alias = "when")]
    pub change_time: DateTime<Utc>,
    #[serde(alias = "who")]
    pub changer: Person,
    #[serde(default)]
    pub changes: Vec<FieldDelta>,
}

impl HistoryChange {
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|change| change.field_name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates the three timeline record kinds.
pub enum ChangeKind {
    Comment,
    Attachment,
    History,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::Attachment => "attachment",
            Self::History => "history",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
/// A single timestamped comment, attachment or history change.
pub enum ChangeRecord {
    Comment(Comment),
    Attachment(Attachment),
    History(HistoryChange),
}

impl ChangeRecord {
    /// Returns the join key: `creation_time` for comments and attachments,
    /// `change_time` for history.
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Self::Comment(comment) => comment.creation_time,
            Self::Attachment(attachment) => attachment.creation_time,
            Self::History(history) => history.change_time,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Comment(_) => ChangeKind::Comment,
            Self::Attachment(_) => ChangeKind::Attachment,
            Self::History(_) => ChangeKind::History,
        }
    }
}

impl From<Comment> for ChangeRecord {
    fn from(value: Comment) -> Self {
        Self::Comment(value)
    }
}

impl From<Attachment> for ChangeRecord {
    fn from(value: Attachment) -> Self {
        Self::Attachment(value)
    }
}

impl From<HistoryChange> for ChangeRecord {
    fn from(value: HistoryChange) -> Self {
        Self::History(value)
    }
}
