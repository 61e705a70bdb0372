//! Field metadata lookup and history change description lines.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::change_record::HistoryChange;

const BUG_LINK_FIELDS: &[&str] = &["blocks", "depends_on"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Tracker configuration entry describing one bug field.
pub struct FieldMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates the strategies tried, in order, to resolve a history field name.
pub enum FieldLookupStrategy {
    /// The name exactly as the history record spells it.
    Exact,
    /// History sometimes reports plural names (`groups`) for singular
    /// config fields (`group`).
    SingularFallback,
    /// The raw field name is used as its own description.
    RawName,
}

pub const DEFAULT_LOOKUP_CHAIN: &[FieldLookupStrategy] = &[
    FieldLookupStrategy::Exact,
    FieldLookupStrategy::SingularFallback,
    FieldLookupStrategy::RawName,
];

#[derive(Debug, Clone)]
pub struct FieldCatalog {
    fields: HashMap<String, FieldMetadata>,
    lookup_chain: Vec<FieldLookupStrategy>,
}

impl Default for FieldCatalog {
    fn default() -> Self {
        Self {
            fields: HashMap::new(),
            lookup_chain: DEFAULT_LOOKUP_CHAIN.to_vec(),
        }
    }
}

impl FieldCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: impl IntoIterator<Item = FieldMetadata>) -> Self {
        let mut catalog = Self::default();
        for field in fields {
            catalog.insert(field);
        }
        catalog
    }

    pub fn with_lookup_chain(mut self, chain: &[FieldLookupStrategy]) -> Self {
        self.lookup_chain = chain.to_vec();
        self
    }

    pub fn insert(&mut self, field: FieldMetadata) {
        self.fields.insert(field.name.clone(), field);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn resolve(&self, strategy: FieldLookupStrategy, field_name: &str) -> Option<String> {
        match strategy {
            FieldLookupStrategy::Exact => self
                .fields
                .get(field_name)
                .map(|field| field.description.clone()),
            FieldLookupStrategy::SingularFallback => field_name
                .strip_suffix('s')
                .filter(|singular| !singular.is_empty())
                .and_then(|singular| self.fields.get(singular))
                .map(|field| field.description.clone()),
            FieldLookupStrategy::RawName => Some(field_name.to_string()),
        }
    }

    /// Human description for a field name; never fails.
    pub fn describe(&self, field_name: &str) -> String {
        self.lookup_chain
            .iter()
            .find_map(|strategy| self.resolve(*strategy, field_name))
            .filter(|description| !description.is_empty())
            .unwrap_or_else(|| field_name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// One rendered `{field}: removed → added` line of a history change.
pub struct ChangeLine {
    pub field_name: String,
    pub description: String,
    pub removed: Option<String>,
    pub added: Option<String>,
    /// Values are bug ids the renderer links to.
    pub links_bugs: bool,
}

impl ChangeLine {
    pub fn render_plain(&self) -> String {
        let mut line = format!("{}: ", self.description);
        if let Some(removed) = self.removed.as_deref() {
            line.push_str(removed);
        }
        if self.removed.is_some() && self.added.is_some() {
            line.push_str(" → ");
        }
        if let Some(added) = self.added.as_deref() {
            line.push_str(added);
        }
        line
    }
}

pub fn describe_history(history: &HistoryChange, catalog: &FieldCatalog) -> Vec<ChangeLine> {
    history
        .changes
        .iter()
        .map(|change| ChangeLine {
            field_name: change.field_name.clone(),
            description: catalog.describe(&change.field_name),
            removed: Some(change.removed.clone()).filter(|value| !value.is_empty()),
            added: Some(change.added.clone()).filter(|value| !value.is_empty()),
            links_bugs: BUG_LINK_FIELDS.contains(&change.field_name.as_str()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{describe_history, FieldCatalog, FieldLookupStrategy, FieldMetadata};
    use crate::change_record::{FieldDelta, HistoryChange, Person};

    fn catalog() -> FieldCatalog {
        FieldCatalog::from_fields([
            FieldMetadata {
                name: "status".to_string(),
                description: "Status".to_string(),
            },
            FieldMetadata {
                name: "group".to_string(),
                description: "Group".to_string(),
            },
            FieldMetadata {
                name: "depends_on".to_string(),
                description: "Depends on".to_string(),
            },
        ])
    }

    #[test]
    fn unit_describe_walks_exact_singular_then_raw_name() {
        let catalog = catalog();
        assert_eq!(catalog.describe("status"), "Status");
        assert_eq!(catalog.describe("groups"), "Group");
        assert_eq!(catalog.describe("cf_crash_signature"), "cf_crash_signature");
        assert_eq!(catalog.describe("s"), "s");
    }

    #[test]
    fn regression_describe_never_fails_without_raw_name_strategy() {
        let catalog = catalog().with_lookup_chain(&[FieldLookupStrategy::Exact]);
        assert_eq!(catalog.describe("groups"), "groups");
        assert_eq!(FieldCatalog::new().describe("whiteboard"), "whiteboard");
    }

    #[test]
    fn functional_describe_history_renders_arrows_and_bug_links() {
        let history = HistoryChange {
            change_time: Utc::now(),
            changer: Person::new("bob@example.com"),
            changes: vec![
                FieldDelta {
                    field_name: "status".to_string(),
                    removed: "NEW".to_string(),
                    added: "ASSIGNED".to_string(),
                },
                FieldDelta {
                    field_name: "depends_on".to_string(),
                    removed: String::new(),
                    added: "1001".to_string(),
                },
            ],
        };
        let lines = describe_history(&history, &catalog());
        assert_eq!(lines[0].render_plain(), "Status: NEW → ASSIGNED");
        assert!(!lines[0].links_bugs);
        assert_eq!(lines[1].render_plain(), "Depends on: 1001");
        assert!(lines[1].links_bugs);
        assert_eq!(lines[1].removed, None);
    }
}
