use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Bug ids the client wants live updates for.
///
/// Owned by one push channel; survives reconnects and is replayed in full on
/// every open.
pub struct SubscriptionRegistry {
    bug_ids: BTreeSet<u64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ids that were not already present.
    pub fn add(&mut self, bug_ids: impl IntoIterator<Item = u64>) -> Vec<u64> {
        bug_ids
            .into_iter()
            .filter(|bug_id| self.bug_ids.insert(*bug_id))
            .collect()
    }

    /// Returns the ids that were actually removed.
    pub fn remove(&mut self, bug_ids: impl IntoIterator<Item = u64>) -> Vec<u64> {
        bug_ids
            .into_iter()
            .filter(|bug_id| self.bug_ids.remove(bug_id))
            .collect()
    }

    pub fn contains(&self, bug_id: u64) -> bool {
        self.bug_ids.contains(&bug_id)
    }

    /// Ascending snapshot of every subscribed id.
    pub fn snapshot(&self) -> Vec<u64> {
        self.bug_ids.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.bug_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bug_ids.is_empty()
    }
}
