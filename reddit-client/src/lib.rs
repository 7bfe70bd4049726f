pub mod api;
pub mod auth;
pub mod bulk;
pub mod feed;
pub mod metrics;
pub mod oauth;
pub mod pagination;
pub mod rate_limiter;
pub mod token_cache;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use api::{ListingApi, ListingPage, RedditApiClient, MAX_PAGE_SIZE};
pub use auth::{RefreshSchedule, TokenCache, TokenManager, TokenRecord, TokenSource};
pub use bulk::{BatchFailure, BulkFetch};
pub use feed::{Disposition, Feed, FeedStatus};
pub use metrics::{ApiMetrics, MetricsCollector};
pub use oauth::PasswordGrant;
pub use pagination::FeedWalk;
pub use rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
pub use token_cache::FileTokenCache;

use std::sync::Arc;

/// The ingestion operations built on top of a [`ListingApi`]: walking feeds
/// for new items and refreshing known ones in bulk.
#[derive(Clone)]
pub struct RedditClient {
    api: Arc<dyn ListingApi>,
    rate_limiter: Arc<RateLimiter>,
}

impl RedditClient {
    /// `rate_limiter` must be the limiter `api` draws its per-request permits
    /// from, so bulk reservations and single calls share one budget.
    pub fn new(api: Arc<dyn ListingApi>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self { api, rate_limiter }
    }

    pub fn api(&self) -> &Arc<dyn ListingApi> {
        &self.api
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }
}

impl std::fmt::Debug for RedditClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditClient")
            .field("rate_limiter", &self.rate_limiter)
            .finish_non_exhaustive()
    }
}
