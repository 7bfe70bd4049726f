//! Access token lifecycle.
//!
//! [`TokenManager`] owns the bearer token every API call reads. The token is
//! published as an immutable `Arc<TokenRecord>` behind a lock, so the refresh
//! loop swaps the whole record at once while readers clone the current
//! snapshot and never observe a half-written token.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use votewatch_core::{AuthConfig, CoreError, RedditApiError};

/// Lowest leniency accepted; anything smaller would refresh almost continuously.
pub const MINIMUM_LENIENCY: f64 = 0.0001;

/// Upper bound on any computed refresh delay, keeping timer deadlines representable.
pub const LONGEST_REFRESH_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub token_type: String,
    /// Lifetime in seconds, as declared by the token endpoint
    pub expires_in: u64,
    #[serde(default)]
    pub scope: String,
    /// Local unix time the token was received at
    pub obtained_at: i64,
}

impl TokenRecord {
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.remaining_at(now) > 0
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now().timestamp())
    }

    /// Seconds of validity left at `now`, negative once expired.
    pub fn remaining_at(&self, now: i64) -> i64 {
        let lifetime = i64::try_from(self.expires_in).unwrap_or(i64::MAX);
        self.obtained_at.saturating_add(lifetime).saturating_sub(now)
    }

    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"<REDACTED>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// Performs the credential exchange.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(&self) -> Result<TokenRecord, CoreError>;
}

/// Persists a token between runs. `load` returns `Ok(None)` when nothing has
/// been stored yet.
#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn load(&self) -> Result<Option<TokenRecord>, CoreError>;
    async fn store(&self, record: &TokenRecord) -> Result<(), CoreError>;
}

/// When to refresh, relative to a token's lifetime.
#[derive(Debug, Clone)]
pub struct RefreshSchedule {
    leniency: f64,
    retry_delay: Duration,
}

impl RefreshSchedule {
    pub fn new(leniency: f64, retry_delay: Duration) -> Self {
        let mut leniency = leniency;
        if leniency < MINIMUM_LENIENCY {
            warn!(
                "Token refresh leniency {} is dangerously low, raising it to {}",
                leniency, MINIMUM_LENIENCY
            );
            leniency = MINIMUM_LENIENCY;
        }
        if leniency >= 1.0 {
            warn!(
                "Token refresh leniency {} is very high; tokens will expire before they are refreshed",
                leniency
            );
        }

        Self {
            leniency,
            retry_delay,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.refresh_leniency, config.refresh_retry_delay())
    }

    pub fn leniency(&self) -> f64 {
        self.leniency
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// The delay a freshly obtained token waits before being refreshed.
    pub fn regular_delay(&self, record: &TokenRecord) -> Duration {
        Duration::try_from_secs_f64(record.expires_in as f64 * self.leniency)
            .unwrap_or(LONGEST_REFRESH_DELAY)
            .min(LONGEST_REFRESH_DELAY)
    }

    /// Time until `record` is due for refresh at `now`. A token loaded from
    /// cache may already be partway through its life, so this never waits
    /// past its expiry.
    pub fn next_delay(&self, record: &TokenRecord, now: i64) -> Duration {
        let remaining = Duration::from_secs(record.remaining_at(now).max(0) as u64);
        self.regular_delay(record).min(remaining)
    }
}

pub struct TokenManager {
    current: RwLock<Arc<TokenRecord>>,
    source: Arc<dyn TokenSource>,
    cache: Option<Arc<dyn TokenCache>>,
    schedule: RefreshSchedule,
}

impl TokenManager {
    /// Resolves the startup token: a still-valid cached one if caching is on,
    /// otherwise a fresh exchange. Failing to get any token is fatal for the
    /// caller, since no API call can succeed without one.
    pub async fn start(
        source: Arc<dyn TokenSource>,
        cache: Option<Arc<dyn TokenCache>>,
        schedule: RefreshSchedule,
    ) -> Result<Self, CoreError> {
        let cached = match &cache {
            Some(cache) => load_valid(cache.as_ref()).await,
            None => None,
        };

        let record = match cached {
            Some(record) => {
                info!("Found valid access token in cache");
                record
            }
            None => {
                info!("Requesting access token from Reddit");
                let record = source.acquire().await?;
                info!("Received access token, valid for {}s", record.expires_in);
                if let Some(cache) = &cache {
                    persist(cache.as_ref(), &record).await;
                }
                record
            }
        };

        Ok(Self::from_record(record, source, cache, schedule))
    }

    pub fn from_record(
        record: TokenRecord,
        source: Arc<dyn TokenSource>,
        cache: Option<Arc<dyn TokenCache>>,
        schedule: RefreshSchedule,
    ) -> Self {
        Self {
            current: RwLock::new(Arc::new(record)),
            source,
            cache,
            schedule,
        }
    }

    /// Snapshot of the active token.
    pub async fn current(&self) -> Arc<TokenRecord> {
        Arc::clone(&*self.current.read().await)
    }

    pub fn schedule(&self) -> &RefreshSchedule {
        &self.schedule
    }

    pub async fn time_to_next_refresh(&self) -> Duration {
        let record = self.current().await;
        self.schedule.next_delay(&record, Utc::now().timestamp())
    }

    /// Exchanges credentials for a new token and publishes it.
    pub async fn refresh(&self) -> Result<Arc<TokenRecord>, CoreError> {
        let record = Arc::new(self.source.acquire().await?);
        *self.current.write().await = Arc::clone(&record);

        if let Some(cache) = &self.cache {
            persist(cache.as_ref(), &record).await;
        }
        Ok(record)
    }

    /// Spawns the refresh cycle. The task never exits on its own: a failed
    /// cycle is logged and retried after the schedule's retry delay.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay = manager.time_to_next_refresh().await;
            loop {
                debug!("Next access token refresh in {:?}", delay);
                sleep(delay).await;

                info!("Refreshing access token");
                delay = match manager.refresh().await {
                    Ok(record) => {
                        info!("Access token refreshed, valid for {}s", record.expires_in);
                        manager.time_to_next_refresh().await
                    }
                    Err(e) => {
                        error!(
                            "Error during token refresh cycle, retrying in {:?}: {}",
                            manager.schedule.retry_delay, e
                        );
                        manager.schedule.retry_delay
                    }
                };
            }
        })
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("schedule", &self.schedule)
            .field("caching", &self.cache.is_some())
            .finish()
    }
}

async fn load_valid(cache: &dyn TokenCache) -> Option<TokenRecord> {
    match cache.load().await {
        Ok(Some(record)) if record.is_valid() => Some(record),
        Ok(Some(_)) => {
            info!("Access token from cache is expired");
            None
        }
        Ok(None) => {
            info!("No cached access token found");
            None
        }
        Err(e) => {
            warn!("Error pulling access token from cache: {}", e);
            None
        }
    }
}

async fn persist(cache: &dyn TokenCache, record: &TokenRecord) {
    match cache.store(record).await {
        Ok(()) => debug!("Cached access token"),
        Err(e) => warn!("Unable to cache access token: {}", e),
    }
}

pub(crate) fn auth_failed(reason: impl Into<String>) -> CoreError {
    CoreError::RedditApi(RedditApiError::AuthenticationFailed {
        reason: reason.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn record(obtained_at: i64, expires_in: u64) -> TokenRecord {
        TokenRecord {
            access_token: "secret-token".to_string(),
            token_type: "bearer".to_string(),
            expires_in,
            scope: "*".to_string(),
            obtained_at,
        }
    }

    /// Hands out numbered tokens; fails the calls listed in `failing`.
    struct CountingSource {
        calls: AtomicUsize,
        failing: Vec<usize>,
        lifetime: u64,
    }

    impl CountingSource {
        fn new(lifetime: u64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing: Vec::new(),
                lifetime,
            }
        }

        fn failing_on(mut self, calls: &[usize]) -> Self {
            self.failing = calls.to_vec();
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn acquire(&self) -> Result<TokenRecord, CoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.contains(&call) {
                return Err(auth_failed("invalid_grant"));
            }
            let mut fresh = record(Utc::now().timestamp(), self.lifetime);
            fresh.access_token = format!("token-{}", call);
            Ok(fresh)
        }
    }

    #[derive(Default)]
    struct MemoryCache {
        stored: Mutex<Option<TokenRecord>>,
        broken: bool,
    }

    #[async_trait]
    impl TokenCache for MemoryCache {
        async fn load(&self) -> Result<Option<TokenRecord>, CoreError> {
            if self.broken {
                return Err(CoreError::Internal {
                    message: "cache unreadable".to_string(),
                });
            }
            Ok(self.stored.lock().unwrap().clone())
        }

        async fn store(&self, record: &TokenRecord) -> Result<(), CoreError> {
            if self.broken {
                return Err(CoreError::Internal {
                    message: "cache unwritable".to_string(),
                });
            }
            *self.stored.lock().unwrap() = Some(record.clone());
            Ok(())
        }
    }

    #[test]
    fn test_token_validity_window() {
        let token = record(1000, 3600);
        assert!(token.is_valid_at(4000));
        assert!(!token.is_valid_at(4700));
        assert!(!token.is_valid_at(4600));
        assert!(token.is_valid_at(4599));
    }

    #[test]
    fn test_debug_redacts_access_token() {
        let rendered = format!("{:?}", record(0, 3600));
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<REDACTED>"));
    }

    #[test]
    fn test_schedule_clamps_leniency() {
        let schedule = RefreshSchedule::new(0.0, Duration::from_secs(30));
        assert_eq!(schedule.leniency(), MINIMUM_LENIENCY);

        // warned about but kept
        let schedule = RefreshSchedule::new(1.5, Duration::from_secs(30));
        assert_eq!(schedule.leniency(), 1.5);
    }

    #[test]
    fn test_next_delay_is_bounded_by_expiry() {
        let schedule = RefreshSchedule::new(0.99, Duration::from_secs(30));
        let token = record(1000, 3600);

        assert_eq!(
            schedule.regular_delay(&token),
            Duration::from_secs_f64(3600.0 * 0.99)
        );
        // fresh token: wait the regular delay
        assert_eq!(
            schedule.next_delay(&token, 1000),
            Duration::from_secs_f64(3600.0 * 0.99)
        );
        // cache-loaded token 3000s into its life: only 600s of validity left
        assert_eq!(schedule.next_delay(&token, 4000), Duration::from_secs(600));
        // leniency >= 1: expiry wins
        let late = RefreshSchedule::new(1.5, Duration::from_secs(30));
        assert_eq!(late.next_delay(&token, 4000), Duration::from_secs(600));
        // already expired: refresh now
        assert_eq!(schedule.next_delay(&token, 5000), Duration::ZERO);
    }

    #[test]
    fn test_huge_delays_saturate() {
        let token = record(0, 3600);
        let reckless = RefreshSchedule::new(1e20, Duration::from_secs(30));
        assert_eq!(reckless.regular_delay(&token), LONGEST_REFRESH_DELAY);
        assert_eq!(reckless.next_delay(&token, 0), Duration::from_secs(3600));

        let endless = record(1_700_000_000, u64::MAX);
        assert!(endless.is_valid_at(1_700_000_000));
        let schedule = RefreshSchedule::new(0.5, Duration::from_secs(30));
        assert_eq!(
            schedule.next_delay(&endless, 1_700_000_000),
            LONGEST_REFRESH_DELAY
        );
    }

    #[tokio::test]
    async fn test_start_uses_valid_cached_token() {
        let source = Arc::new(CountingSource::new(3600));
        let cache = Arc::new(MemoryCache::default());
        let mut cached = record(Utc::now().timestamp() - 60, 3600);
        cached.access_token = "from-cache".to_string();
        *cache.stored.lock().unwrap() = Some(cached);

        let manager = TokenManager::start(
            source.clone(),
            Some(cache.clone()),
            RefreshSchedule::new(0.99, Duration::from_secs(30)),
        )
        .await
        .unwrap();

        assert_eq!(manager.current().await.access_token, "from-cache");
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_start_discards_expired_cached_token() {
        let source = Arc::new(CountingSource::new(3600));
        let cache = Arc::new(MemoryCache::default());
        *cache.stored.lock().unwrap() = Some(record(Utc::now().timestamp() - 7200, 3600));

        let manager = TokenManager::start(
            source.clone(),
            Some(cache.clone()),
            RefreshSchedule::new(0.99, Duration::from_secs(30)),
        )
        .await
        .unwrap();

        assert_eq!(manager.current().await.access_token, "token-1");
        assert_eq!(source.calls(), 1);
        // the fresh token replaced the stale one in the cache
        let stored = cache.stored.lock().unwrap().clone().unwrap();
        assert_eq!(stored.access_token, "token-1");
    }

    #[tokio::test]
    async fn test_start_survives_broken_cache() {
        let source = Arc::new(CountingSource::new(3600));
        let cache = Arc::new(MemoryCache {
            stored: Mutex::new(None),
            broken: true,
        });

        let manager = TokenManager::start(
            source.clone(),
            Some(cache),
            RefreshSchedule::new(0.99, Duration::from_secs(30)),
        )
        .await
        .unwrap();

        assert_eq!(manager.current().await.access_token, "token-1");
    }

    #[tokio::test]
    async fn test_start_fails_without_any_token() {
        let source = Arc::new(CountingSource::new(3600).failing_on(&[1]));

        let result = TokenManager::start(
            source,
            None,
            RefreshSchedule::new(0.99, Duration::from_secs(30)),
        )
        .await;

        assert!(matches!(
            result,
            Err(CoreError::RedditApi(
                RedditApiError::AuthenticationFailed { .. }
            ))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_replaces_token() {
        let source = Arc::new(CountingSource::new(100));
        let manager = Arc::new(TokenManager::from_record(
            record(Utc::now().timestamp(), 100),
            source.clone(),
            None,
            RefreshSchedule::new(0.5, Duration::from_secs(5)),
        ));

        let handle = manager.spawn_refresh_loop();

        sleep(Duration::from_secs(49)).await;
        assert_eq!(source.calls(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(source.calls(), 1);
        assert_eq!(manager.current().await.access_token, "token-1");

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_persists_each_token() {
        let source = Arc::new(CountingSource::new(100));
        let cache = Arc::new(MemoryCache::default());
        let manager = Arc::new(TokenManager::from_record(
            record(Utc::now().timestamp(), 100),
            source.clone(),
            Some(cache.clone()),
            RefreshSchedule::new(0.5, Duration::from_secs(5)),
        ));

        let handle = manager.spawn_refresh_loop();

        sleep(Duration::from_secs(51)).await;
        assert_eq!(source.calls(), 1);
        let stored = cache.stored.lock().unwrap().clone().unwrap();
        assert_eq!(stored.access_token, "token-1");

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_survives_broken_cache() {
        let source = Arc::new(CountingSource::new(100));
        let cache = Arc::new(MemoryCache {
            stored: Mutex::new(None),
            broken: true,
        });
        let manager = Arc::new(TokenManager::from_record(
            record(Utc::now().timestamp(), 100),
            source.clone(),
            Some(cache),
            RefreshSchedule::new(0.5, Duration::from_secs(5)),
        ));

        let handle = manager.spawn_refresh_loop();

        // the write fails but the new token is still published
        sleep(Duration::from_secs(51)).await;
        assert_eq!(source.calls(), 1);
        assert_eq!(manager.current().await.access_token, "token-1");

        // and the next cycle is scheduled off the new token
        sleep(Duration::from_secs(50)).await;
        assert_eq!(source.calls(), 2);
        assert_eq!(manager.current().await.access_token, "token-2");

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_continues_after_failure() {
        let source = Arc::new(CountingSource::new(100).failing_on(&[1]));
        let manager = Arc::new(TokenManager::from_record(
            record(Utc::now().timestamp(), 100),
            source.clone(),
            None,
            RefreshSchedule::new(0.5, Duration::from_secs(5)),
        ));

        let handle = manager.spawn_refresh_loop();

        // first attempt at ~50s fails, the retry follows the retry delay
        sleep(Duration::from_secs(51)).await;
        assert_eq!(source.calls(), 1);
        assert_eq!(manager.current().await.access_token, "secret-token");

        sleep(Duration::from_secs(6)).await;
        assert_eq!(source.calls(), 2);
        assert_eq!(manager.current().await.access_token, "token-2");

        handle.abort();
    }
}
