use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use votewatch_core::{CoreError, Fullname, Item};


/// Where tracked listings and their metric history are kept.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Inserts listings not stored yet; ones already present are ignored.
    /// Returns how many were inserted.
    async fn save_new(&self, items: &[Item]) -> Result<usize, CoreError>;

    /// Appends a metrics snapshot under each already stored listing; unknown
    /// listings are skipped. Returns how many snapshots were recorded.
    async fn update_existing(&self, items: &[Item]) -> Result<usize, CoreError>;

    /// Every listing created within the last `max_age_secs`, carrying its
    /// most recent metrics.
    async fn pull_all(&self, max_age_secs: u64) -> Result<Vec<Item>, CoreError>;

    /// Deletes listings created more than `max_age_secs` ago. Returns how
    /// many were deleted.
    async fn cull_expired(&self, max_age_secs: u64) -> Result<u64, CoreError>;
}

/// One recorded observation of a listing's mutable metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEntry {
    pub upvotes: i64,
    pub comments: u32,
    /// Unix seconds the platform served this snapshot at
    pub queried_at: i64,
}

impl From<&Item> for MetricsEntry {
    fn from(item: &Item) -> Self {
        Self {
            upvotes: item.upvotes,
            comments: item.comments,
            queried_at: item.queried_at,
        }
    }
}

/// A listing as first discovered, plus every snapshot recorded since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub listing: Item,
    pub entries: Vec<MetricsEntry>,
}

impl StoredListing {
    fn new(listing: Item) -> Self {
        Self {
            listing,
            entries: Vec::new(),
        }
    }

    /// The discovery record with the newest snapshot's metrics applied.
    pub fn latest(&self) -> Item {
        let mut item = self.listing.clone();
        if let Some(entry) = self.entries.iter().max_by_key(|e| e.queried_at) {
            if entry.queried_at >= item.queried_at {
                item.upvotes = entry.upvotes;
                item.comments = entry.comments;
                item.queried_at = entry.queried_at;
            }
        }
        item
    }

    fn is_expired_at(&self, now: i64, max_age_secs: u64) -> bool {
        now - self.listing.created_utc > max_age_secs as i64
    }
}

/// Process-local [`ListingStore`]. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    listings: RwLock<HashMap<Fullname, StoredListing>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.listings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listings.read().await.is_empty()
    }

    pub async fn get(&self, id: &Fullname) -> Option<StoredListing> {
        self.listings.read().await.get(id).cloned()
    }

    pub(crate) async fn pull_all_at(&self, max_age_secs: u64, now: i64) -> Vec<Item> {
        self.listings
            .read()
            .await
            .values()
            .filter(|stored| !stored.is_expired_at(now, max_age_secs))
            .map(StoredListing::latest)
            .collect()
    }

    pub(crate) async fn cull_expired_at(&self, max_age_secs: u64, now: i64) -> u64 {
        let mut listings = self.listings.write().await;
        let before = listings.len();
        listings.retain(|_, stored| !stored.is_expired_at(now, max_age_secs));
        (before - listings.len()) as u64
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn save_new(&self, items: &[Item]) -> Result<usize, CoreError> {
        let mut listings = self.listings.write().await;
        let mut inserted = 0;
        for item in items {
            let id = item.fullname();
            if !id.is_valid() {
                warn!("Refusing to store listing with invalid ID \"{}\"", id);
                continue;
            }
            if listings.contains_key(&id) {
                continue;
            }
            listings.insert(id, StoredListing::new(item.clone()));
            inserted += 1;
        }
        debug!("Stored {} of {} new listings", inserted, items.len());
        Ok(inserted)
    }

    async fn update_existing(&self, items: &[Item]) -> Result<usize, CoreError> {
        let mut listings = self.listings.write().await;
        let mut recorded = 0;
        for item in items {
            match listings.get_mut(&item.fullname()) {
                Some(stored) => {
                    stored.entries.push(MetricsEntry::from(item));
                    recorded += 1;
                }
                None => debug!("No stored listing for {}, skipping update", item.fullname()),
            }
        }
        Ok(recorded)
    }

    async fn pull_all(&self, max_age_secs: u64) -> Result<Vec<Item>, CoreError> {
        Ok(self.pull_all_at(max_age_secs, Utc::now().timestamp()).await)
    }

    async fn cull_expired(&self, max_age_secs: u64) -> Result<u64, CoreError> {
        let deleted = self
            .cull_expired_at(max_age_secs, Utc::now().timestamp())
            .await;
        if deleted > 0 {
            info!("Culled {} listings older than {}s", deleted, max_age_secs);
        }
        Ok(deleted)
    }
}
