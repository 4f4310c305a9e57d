use std::collections::BTreeSet;

/// Set of identity ids currently online. Global, not per conversation.
///
/// Every mutator reports whether the set actually changed so callers only
/// publish real transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSet {
    online: BTreeSet<String>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the set with a full roster.
    pub fn replace_roster<I>(&mut self, roster: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let next: BTreeSet<String> = roster.into_iter().collect();
        if next == self.online {
            return false;
        }
        self.online = next;
        true
    }

    /// Idempotent add.
    pub fn mark_online(&mut self, identity_id: impl Into<String>) -> bool {
        self.online.insert(identity_id.into())
    }

    /// Idempotent remove.
    pub fn mark_offline(&mut self, identity_id: &str) -> bool {
        self.online.remove(identity_id)
    }

    /// Online ids in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.online.iter().map(String::as_str)
    }

    /// Sorted copy of the online ids.
    pub fn snapshot(&self) -> Vec<String> {
        self.online.iter().cloned().collect()
    }

    pub fn clear(&mut self) -> bool {
        if self.online.is_empty() {
            return false;
        }
        self.online.clear();
        true
    }
}
