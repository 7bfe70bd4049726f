use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;
use votewatch_core::{Fullname, Item};

/// The listings currently being watched, keyed by fullname.
///
/// Two merge disciplines apply. Snapshots pulled from storage may be older
/// than what is already held, so [`TrackedSet::merge_absent`] never replaces
/// an entry. Discovery and refresh results are always the newest data, so
/// [`TrackedSet::upsert`] replaces unconditionally.
#[derive(Debug, Default)]
pub struct TrackedSet {
    items: RwLock<HashMap<Fullname, Item>>,
}

impl TrackedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds items not yet tracked. Returns how many were added.
    pub async fn merge_absent(&self, items: impl IntoIterator<Item = Item>) -> usize {
        let mut tracked = self.items.write().await;
        let mut added = 0;
        for item in items {
            let Some(id) = checked_id(&item) else {
                continue;
            };
            if tracked.contains_key(&id) {
                continue;
            }
            tracked.insert(id, item);
            added += 1;
        }
        added
    }

    /// Inserts or replaces items. Returns how many were not tracked before.
    pub async fn upsert(&self, items: impl IntoIterator<Item = Item>) -> usize {
        let mut tracked = self.items.write().await;
        let mut added = 0;
        for item in items {
            let Some(id) = checked_id(&item) else {
                continue;
            };
            if tracked.insert(id, item).is_none() {
                added += 1;
            }
        }
        added
    }

    pub async fn ids(&self) -> Vec<Fullname> {
        self.items.read().await.keys().cloned().collect()
    }

    pub async fn get(&self, id: &Fullname) -> Option<Item> {
        self.items.read().await.get(id).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<Fullname, Item> {
        self.items.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Drops items created before `cutoff` (unix seconds). Returns how many
    /// were dropped.
    pub async fn retain_created_since(&self, cutoff: i64) -> usize {
        let mut tracked = self.items.write().await;
        let before = tracked.len();
        tracked.retain(|_, item| item.created_utc >= cutoff);
        before - tracked.len()
    }
}

fn checked_id(item: &Item) -> Option<Fullname> {
    let id = item.fullname();
    if id.is_valid() {
        Some(id)
    } else {
        warn!("Not tracking listing with invalid ID \"{}\"", id);
        None
    }
}
