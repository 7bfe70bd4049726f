use crate::auth::TokenManager;
use crate::metrics::{ApiMetrics, MetricsCollector, RequestMetrics};
use crate::rate_limiter::{RateLimitStatus, RateLimiter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, DATE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};
use votewatch_core::{ContentKind, CoreError, Fullname, Item, RedditApiError, RedditConfig};

/// Most items the platform returns from one listing or lookup call.
pub const MAX_PAGE_SIZE: usize = 100;

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListing {
    pub kind: String,
    pub data: RedditListingData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListingData {
    pub children: Vec<RedditListingChild>,
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub dist: Option<u32>,
}

/// Child payloads stay untyped until the kind is known; a listing can mix
/// things with different shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListingChild {
    pub kind: String,
    pub data: serde_json::Value,
}

/// The fields every tracked kind shares. Kinds without a title (comments)
/// come through with it blank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditThingData {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub ups: i64,
    #[serde(default)]
    pub num_comments: u32,
    #[serde(default)]
    pub created_utc: f64,
}

impl RedditListing {
    /// Converts the children into items stamped with `queried_at`, skipping
    /// kinds this crate does not model.
    pub fn into_page(self, queried_at: i64) -> Result<ListingPage, CoreError> {
        let mut items = Vec::with_capacity(self.data.children.len());
        for child in self.data.children {
            let Some(kind) = ContentKind::from_tag(&child.kind) else {
                warn!("Skipping listing child of unknown kind \"{}\"", child.kind);
                continue;
            };
            let thing: RedditThingData = serde_json::from_value(child.data).map_err(|e| {
                CoreError::RedditApi(RedditApiError::InvalidResponse {
                    details: format!("malformed {} in listing: {}", kind, e),
                })
            })?;
            items.push(Item {
                kind,
                id: thing.id,
                title: thing.title,
                upvotes: thing.ups,
                comments: thing.num_comments,
                created_utc: thing.created_utc as i64,
                queried_at,
            });
        }

        Ok(ListingPage {
            items,
            after: self.data.after,
        })
    }
}

/// One page of a listing, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    pub items: Vec<Item>,
    /// Continuation cursor for the next page; `None` once the listing is exhausted
    pub after: Option<String>,
}

/// The two read-only platform calls the ingestion engine is built on.
#[async_trait]
pub trait ListingApi: Send + Sync {
    /// Newest items of `feed`, at most `limit` (capped at [`MAX_PAGE_SIZE`]).
    async fn list_new(
        &self,
        feed: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<ListingPage, CoreError>;

    /// Current state of up to [`MAX_PAGE_SIZE`] things. Ids the platform no
    /// longer knows are silently left out of the result.
    async fn lookup(&self, ids: &[Fullname]) -> Result<Vec<Item>, CoreError>;

    /// Request statistics, for implementations that keep them.
    async fn metrics(&self) -> Option<ApiMetrics> {
        None
    }
}

enum Route<'a> {
    NewListing { feed: &'a str },
    Info,
}

impl Route<'_> {
    fn path(&self) -> String {
        match self {
            Route::NewListing { feed } => format!("/r/{}/new", feed),
            Route::Info => "/api/info".to_string(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Route::NewListing { .. } => "/r/{feed}/new",
            Route::Info => "/api/info",
        }
    }
}

#[derive(Debug)]
pub struct RedditApiClient {
    http_client: Client,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    tokens: Arc<TokenManager>,
    api_base: String,
}

impl RedditApiClient {
    pub fn new(
        config: &RedditConfig,
        rate_limiter: Arc<RateLimiter>,
        tokens: Arc<TokenManager>,
    ) -> Result<Self, CoreError> {
        let http_client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http_client,
            rate_limiter,
            metrics: Arc::new(MetricsCollector::new()),
            tokens,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn make_request(
        &self,
        route: Route<'_>,
        query_params: &[(&str, String)],
    ) -> Result<Response, CoreError> {
        let endpoint = route.path();
        let url = format!("{}{}", self.api_base, endpoint);

        let permit = self.rate_limiter.acquire_permit().await;
        debug!(
            "Acquired rate limit permit for GET {} after {:?}",
            endpoint, permit.queue_wait_time
        );

        let token = self.tokens.current().await;
        let start_time = Instant::now();
        let result = self
            .http_client
            .get(&url)
            .header(AUTHORIZATION, token.authorization_header())
            .query(query_params)
            .send()
            .await;
        let status_code = result.as_ref().ok().map(|r| r.status().as_u16());

        let outcome = match result {
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response) => {
                error!(
                    "Request failed with status: {} for {}",
                    response.status(),
                    endpoint
                );
                Err(status_error(
                    response.status(),
                    response.headers(),
                    &route,
                    &endpoint,
                ))
            }
            Err(e) => {
                error!("Network error for GET {}: {}", endpoint, e);
                if e.is_timeout() {
                    Err(CoreError::RedditApi(RedditApiError::RequestTimeout))
                } else {
                    Err(CoreError::Network(e))
                }
            }
        };

        self.metrics
            .record_request(RequestMetrics {
                endpoint: route.label().to_string(),
                status_code,
                response_time: start_time.elapsed(),
                success: outcome.is_ok(),
                rate_limited: matches!(
                    outcome,
                    Err(CoreError::RedditApi(RedditApiError::RateLimitExceeded { .. }))
                ),
            })
            .await;

        outcome
    }

    async fn fetch_listing(
        &self,
        route: Route<'_>,
        query_params: &[(&str, String)],
    ) -> Result<ListingPage, CoreError> {
        let response = self.make_request(route, query_params).await?;
        let queried_at = query_date(response.headers());

        let listing: RedditListing = response.json().await.map_err(|e| {
            error!("Failed to parse listing: {}", e);
            CoreError::RedditApi(RedditApiError::InvalidResponse {
                details: format!("failed to parse listing: {}", e),
            })
        })?;
        listing.into_page(queried_at)
    }

    pub async fn get_metrics(&self) -> ApiMetrics {
        self.metrics.get_metrics().await
    }

    pub async fn get_rate_limit_status(&self) -> RateLimitStatus {
        self.rate_limiter.get_rate_limit_status().await
    }
}

#[async_trait]
impl ListingApi for RedditApiClient {
    async fn list_new(
        &self,
        feed: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<ListingPage, CoreError> {
        let mut params = vec![("limit", limit.clamp(1, MAX_PAGE_SIZE).to_string())];
        if let Some(after) = after {
            params.push(("after", after.to_string()));
        }

        let page = self
            .fetch_listing(Route::NewListing { feed }, &params)
            .await?;
        debug!("Retrieved {} items from r/{}", page.items.len(), feed);
        Ok(page)
    }

    async fn lookup(&self, ids: &[Fullname]) -> Result<Vec<Item>, CoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        if ids.len() > MAX_PAGE_SIZE {
            return Err(CoreError::InvalidInput {
                message: format!(
                    "lookup of {} ids exceeds the {} id limit",
                    ids.len(),
                    MAX_PAGE_SIZE
                ),
            });
        }

        let joined = ids
            .iter()
            .map(Fullname::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let page = self.fetch_listing(Route::Info, &[("id", joined)]).await?;
        debug!("Looked up {} of {} requested ids", page.items.len(), ids.len());
        Ok(page.items)
    }

    async fn metrics(&self) -> Option<ApiMetrics> {
        Some(self.get_metrics().await)
    }
}

fn status_error(
    status: StatusCode,
    headers: &HeaderMap,
    route: &Route<'_>,
    endpoint: &str,
) -> CoreError {
    let error = match status {
        StatusCode::UNAUTHORIZED => RedditApiError::InvalidToken,
        StatusCode::FORBIDDEN => RedditApiError::Forbidden {
            resource: endpoint.to_string(),
        },
        StatusCode::NOT_FOUND => match route {
            Route::NewListing { feed } => RedditApiError::SubredditNotFound {
                subreddit: feed.to_string(),
            },
            Route::Info => RedditApiError::InvalidResponse {
                details: "Resource not found".to_string(),
            },
        },
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = headers
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            warn!("Rate limited, retry after {} seconds", retry_after);
            RedditApiError::RateLimitExceeded { retry_after }
        }
        status if status.is_server_error() => RedditApiError::ServerError {
            status_code: status.as_u16(),
        },
        status => RedditApiError::UnexpectedStatus {
            status_code: status.as_u16(),
            endpoint: endpoint.to_string(),
        },
    };
    CoreError::RedditApi(error)
}

/// When the platform served the response, from its `Date` header. Falls back
/// to local time when the header is missing or unreadable.
pub(crate) fn query_date(headers: &HeaderMap) -> i64 {
    headers
        .get(DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        .map(|date| date.timestamp())
        .unwrap_or_else(|| {
            debug!("Response carried no usable Date header, using local time");
            Utc::now().timestamp()
        })
}
