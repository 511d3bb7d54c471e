//! Items queued for backup.

use std::collections::HashSet;

/// Reserved identifier of the package-manager metadata item.
pub const METADATA_SENTINEL: &str = "@pm@";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupItem {
    pub id: String,
}

impl BackupItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn metadata() -> Self {
        Self::new(METADATA_SENTINEL)
    }

    pub fn is_metadata(&self) -> bool {
        self.id == METADATA_SENTINEL
    }
}

/// Caller queue after normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Queue {
    /// The caller listed the sentinel explicitly
    pub metadata_requested: bool,
    /// Real items, first occurrence wins
    pub items: Vec<BackupItem>,
}

impl Queue {
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut queue = Queue::default();
        let mut seen = HashSet::new();

        for id in ids {
            let item = BackupItem::new(id);
            if item.is_metadata() {
                queue.metadata_requested = true;
                continue;
            }
            if item.id.is_empty() {
                tracing::warn!("Ignoring empty item identifier");
                continue;
            }
            if seen.insert(item.id.clone()) {
                queue.items.push(item);
            } else {
                tracing::debug!(item = %item.id, "Dropping duplicate queue entry");
            }
        }

        queue
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && !self.metadata_requested
    }
}
