//! In-memory stand-in for the platform, for exercising walks, bulk fetches
//! and the scheduler without a network.

use crate::api::{ListingApi, ListingPage};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::RedditClient;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use votewatch_core::{ContentKind, CoreError, Fullname, Item, RedditApiError};

/// A call the scripted platform received.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    ListNew {
        feed: String,
        limit: usize,
        after: Option<String>,
    },
    Lookup {
        ids: Vec<Fullname>,
    },
}

#[derive(Debug, Default)]
struct Script {
    /// Newest first, like the platform's `/new` listing
    feeds: HashMap<String, Vec<Item>>,
    /// Current state of every thing a lookup can return
    catalog: HashMap<Fullname, Item>,
    failing_feeds: HashSet<String>,
    failing_ids: HashSet<Fullname>,
    calls: Vec<ApiCall>,
}

#[derive(Debug, Default)]
pub struct ScriptedApi {
    script: Mutex<Script>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `items` (newest first) to the top of `feed`, ahead of anything
    /// already published there.
    pub fn publish(&self, feed: &str, items: Vec<Item>) {
        let mut script = self.script();
        for item in &items {
            script.catalog.insert(item.fullname(), item.clone());
        }
        let older = script.feeds.remove(feed).unwrap_or_default();
        let mut listing = items;
        listing.extend(older);
        script.feeds.insert(feed.to_string(), listing);
    }

    /// Replaces the state lookups return for an already published item.
    pub fn update(&self, item: Item) {
        self.script().catalog.insert(item.fullname(), item);
    }

    /// Makes lookups silently omit `id`, as the platform does for deleted things.
    pub fn remove(&self, id: &Fullname) {
        self.script().catalog.remove(id);
    }

    pub fn fail_feed(&self, feed: &str) {
        self.script().failing_feeds.insert(feed.to_string());
    }

    pub fn heal_feed(&self, feed: &str) {
        self.script().failing_feeds.remove(feed);
    }

    /// Fails every lookup batch that includes `id`.
    pub fn fail_lookups_of(&self, id: &Fullname) {
        self.script().failing_ids.insert(id.clone());
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.script().calls.clone()
    }

    pub fn list_calls(&self, feed: &str) -> Vec<(usize, Option<String>)> {
        self.script()
            .calls
            .iter()
            .filter_map(|call| match call {
                ApiCall::ListNew { feed: f, limit, after } if f == feed => {
                    Some((*limit, after.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn lookup_calls(&self) -> Vec<Vec<Fullname>> {
        self.script()
            .calls
            .iter()
            .filter_map(|call| match call {
                ApiCall::Lookup { ids } => Some(ids.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.script().calls.clear();
    }
}

#[async_trait]
impl ListingApi for ScriptedApi {
    async fn list_new(
        &self,
        feed: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<ListingPage, CoreError> {
        let mut script = self.script();
        script.calls.push(ApiCall::ListNew {
            feed: feed.to_string(),
            limit,
            after: after.map(str::to_string),
        });

        if script.failing_feeds.contains(feed) {
            return Err(CoreError::RedditApi(RedditApiError::ServerError {
                status_code: 503,
            }));
        }

        let Some(listing) = script.feeds.get(feed) else {
            return Ok(ListingPage::default());
        };
        let start = match after {
            None => 0,
            Some(after) => match listing
                .iter()
                .position(|item| item.fullname().as_str() == after)
            {
                Some(position) => position + 1,
                None => return Ok(ListingPage::default()),
            },
        };

        let end = (start + limit).min(listing.len());
        let items = listing[start..end].to_vec();
        let after = if end < listing.len() {
            items.last().map(|item| item.fullname().to_string())
        } else {
            None
        };
        Ok(ListingPage { items, after })
    }

    async fn lookup(&self, ids: &[Fullname]) -> Result<Vec<Item>, CoreError> {
        let mut script = self.script();
        script.calls.push(ApiCall::Lookup { ids: ids.to_vec() });

        if ids.iter().any(|id| script.failing_ids.contains(id)) {
            return Err(CoreError::RedditApi(RedditApiError::ServerError {
                status_code: 500,
            }));
        }
        Ok(ids
            .iter()
            .filter_map(|id| script.catalog.get(id).cloned())
            .collect())
    }
}

/// A limiter roomy enough that tests never wait on it.
pub fn unthrottled_limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(RateLimitConfig {
        max_requests: 100_000,
        time_window: Duration::from_secs(60),
        burst_allowance: 10_000,
    }))
}

pub fn client_over(api: Arc<ScriptedApi>) -> RedditClient {
    RedditClient::new(api, unthrottled_limiter())
}

/// A link post with id `p{n:05}`, created at second `n`.
pub fn numbered_link(n: u32) -> Item {
    Item {
        kind: ContentKind::Link,
        id: format!("p{:05}", n),
        title: format!("post {}", n),
        upvotes: 1,
        comments: 0,
        created_utc: n as i64,
        queried_at: n as i64,
    }
}

/// Links `from..to`, newest (highest number) first.
pub fn numbered_links(from: u32, to: u32) -> Vec<Item> {
    (from..to).rev().map(numbered_link).collect()
}
