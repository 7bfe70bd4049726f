use crate::tracked::TrackedSet;
use chrono::Utc;
use futures::future::join_all;
use reddit_client::{Disposition, Feed, RedditClient, TokenManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use votewatch_core::{log_by_severity, CoreError, Fullname, Item, WatchSettings};

/// Slack after a token's refresh is due before checking that it happened.
pub const TOKEN_CHECK_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub discovery_interval: Duration,
    pub refresh_interval: Duration,
    pub cull_interval: Duration,
    pub posts_per_walk: usize,
    pub max_listing_age: Duration,
    pub token_check_grace: Duration,
}

impl From<&WatchSettings> for SchedulerConfig {
    fn from(settings: &WatchSettings) -> Self {
        Self {
            discovery_interval: settings.discovery_interval(),
            refresh_interval: settings.refresh_interval(),
            cull_interval: settings.cull_interval(),
            posts_per_walk: settings.posts_per_walk,
            max_listing_age: settings.max_listing_age(),
            token_check_grace: TOKEN_CHECK_GRACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    pub feeds_walked: usize,
    pub feeds_failed: usize,
    /// Items seen by first walks; neither tracked nor stored
    pub baseline_items: usize,
    pub new_items: usize,
    /// Items from earlier ticks whose save failed, pushed again with this delta
    pub retried: usize,
    pub saved: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub requested: usize,
    pub refreshed: usize,
    pub missing: usize,
    pub failed_batches: usize,
    pub recorded: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CullReport {
    pub untracked: usize,
    pub deleted: u64,
}

/// Drives discovery, refresh and culling on independent timers, feeding
/// results into the tracked set and on to storage.
pub struct Scheduler {
    config: SchedulerConfig,
    client: RedditClient,
    tokens: Arc<TokenManager>,
    store: Arc<dyn database::ListingStore>,
    feeds: Vec<Feed>,
    tracked: Arc<TrackedSet>,
    /// Discovered items not yet accepted by storage
    unsaved: HashMap<Fullname, Item>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        client: RedditClient,
        tokens: Arc<TokenManager>,
        store: Arc<dyn database::ListingStore>,
        feed_names: &[String],
    ) -> Self {
        Self {
            config,
            client,
            tokens,
            store,
            feeds: feed_names.iter().map(Feed::new).collect(),
            tracked: Arc::new(TrackedSet::new()),
            unsaved: HashMap::new(),
        }
    }

    pub fn feeds(&self) -> &[Feed] {
        &self.feeds
    }

    pub fn tracked(&self) -> &Arc<TrackedSet> {
        &self.tracked
    }

    /// Number of discovered items waiting for a successful save.
    pub fn unsaved_len(&self) -> usize {
        self.unsaved.len()
    }

    /// Loads previously stored listings so a restart keeps tracking them.
    pub async fn seed_from_store(&self) -> Result<usize, CoreError> {
        let stored = self
            .store
            .pull_all(self.config.max_listing_age.as_secs())
            .await?;
        let pulled = stored.len();
        let added = self.tracked.merge_absent(stored).await;
        info!(
            "Seeded tracked set with {} of {} stored listings",
            added, pulled
        );
        Ok(added)
    }

    /// Walks every feed concurrently, tracks what is new and saves it along
    /// with anything a previous tick failed to save.
    pub async fn discover(&mut self) -> Result<DiscoveryReport, CoreError> {
        let client = &self.client;
        let target = self.config.posts_per_walk;
        let pending: Vec<_> = self
            .feeds
            .iter_mut()
            .map(|feed| async move {
                let result = client.walk(feed, target).await;
                (feed.name().to_string(), result)
            })
            .collect();
        let walks = join_all(pending).await;

        let mut report = DiscoveryReport::default();
        let mut delta: Vec<Item> = Vec::new();
        for (feed, result) in walks {
            match result {
                Ok(walk) => {
                    report.feeds_walked += 1;
                    match walk.disposition {
                        Disposition::Baseline => {
                            if !walk.items.is_empty() {
                                info!(
                                    "Established baseline for r/{} at {} existing items",
                                    feed,
                                    walk.items.len()
                                );
                            }
                            report.baseline_items += walk.items.len();
                        }
                        Disposition::Delta => delta.extend(walk.items),
                    }
                }
                Err(e) => {
                    report.feeds_failed += 1;
                    log_by_severity(&format!("Walking r/{}", feed), &e);
                }
            }
        }

        report.new_items = delta.len();
        report.retried = self.unsaved.len();
        if !delta.is_empty() {
            self.tracked.upsert(delta.iter().cloned()).await;
        }
        for item in delta {
            self.unsaved.insert(item.fullname(), item);
        }
        if self.unsaved.is_empty() {
            return Ok(report);
        }

        let batch: Vec<Item> = self.unsaved.values().cloned().collect();
        match self.store.save_new(&batch).await {
            Ok(saved) => {
                report.saved = saved;
                self.unsaved.clear();
                Ok(report)
            }
            Err(e) => {
                warn!(
                    "Holding {} discovered items until storage accepts them",
                    self.unsaved.len()
                );
                Err(e)
            }
        }
    }

    /// Looks up every tracked item and records the fresh metrics.
    pub async fn refresh_tracked(&self) -> Result<RefreshReport, CoreError> {
        let ids = self.tracked.ids().await;
        let mut report = RefreshReport {
            requested: ids.len(),
            ..RefreshReport::default()
        };
        if ids.is_empty() {
            debug!("Nothing tracked yet, skipping refresh");
            return Ok(report);
        }

        let fetch = self.client.fetch_many(&ids).await;
        report.missing = fetch.missing.len();
        report.failed_batches = fetch.failures.len();

        let items: Vec<Item> = fetch.items.into_values().collect();
        report.refreshed = items.len();
        if items.is_empty() {
            return Ok(report);
        }

        self.tracked.upsert(items.iter().cloned()).await;
        report.recorded = self.store.update_existing(&items).await?;
        Ok(report)
    }

    /// Stops tracking listings past the maximum age and deletes them from storage.
    pub async fn cull_expired(&mut self) -> Result<CullReport, CoreError> {
        let max_age = self.config.max_listing_age.as_secs();
        let cutoff = Utc::now().timestamp() - max_age as i64;

        let untracked = self.tracked.retain_created_since(cutoff).await;
        self.unsaved.retain(|_, item| item.created_utc >= cutoff);
        let deleted = self.store.cull_expired(max_age).await?;
        Ok(CullReport { untracked, deleted })
    }

    /// Checks on the background token refresh and logs client health.
    /// Returns how long until the next check.
    pub async fn token_checkpoint(&self) -> Duration {
        let token = self.tokens.current().await;
        if !token.is_valid() {
            warn!("Access token has expired and the refresh loop has not replaced it");
        }

        let status = self.client.rate_limiter().get_rate_limit_status().await;
        info!(
            "Rate limiter: {}/{} tokens available, {} requests this window",
            status.available_tokens, status.max_tokens, status.current_window_requests
        );
        if status.is_near_limit() {
            warn!(
                "Rate limiter is at {:.0}% utilization",
                status.utilization_percentage()
            );
        }
        if let Some(metrics) = self.client.api().metrics().await {
            info!("API usage: {}", metrics);
        }

        self.tokens.time_to_next_refresh().await + self.config.token_check_grace
    }

    async fn discovery_tick(&mut self) {
        match self.discover().await {
            Ok(report) => info!(
                "Discovery: {} feeds walked ({} failed), {} new items, {} retried, {} saved, {} baseline",
                report.feeds_walked,
                report.feeds_failed,
                report.new_items,
                report.retried,
                report.saved,
                report.baseline_items
            ),
            Err(e) => log_by_severity("Discovery tick", &e),
        }
    }

    async fn refresh_tick(&self) {
        match self.refresh_tracked().await {
            Ok(report) => info!(
                "Refresh: {} of {} tracked items refreshed, {} missing, {} failed batches, {} recorded",
                report.refreshed,
                report.requested,
                report.missing,
                report.failed_batches,
                report.recorded
            ),
            Err(e) => log_by_severity("Refresh tick", &e),
        }
    }

    async fn cull_tick(&mut self) {
        match self.cull_expired().await {
            Ok(report) => info!(
                "Cull: {} items untracked, {} deleted from storage",
                report.untracked, report.deleted
            ),
            Err(e) => log_by_severity("Cull tick", &e),
        }
    }

    /// Runs the control loop. Never returns; stop it by dropping the future.
    pub async fn run(mut self) {
        let mut discovery = ticker(self.config.discovery_interval);
        let mut refresh = ticker(self.config.refresh_interval);
        let mut cull = ticker(self.config.cull_interval);

        let first_check = self.tokens.time_to_next_refresh().await + self.config.token_check_grace;
        let token_check = sleep(first_check);
        tokio::pin!(token_check);

        info!(
            "Watching {} feeds: discovery every {:?}, refresh every {:?}, cull every {:?}",
            self.feeds.len(),
            self.config.discovery_interval,
            self.config.refresh_interval,
            self.config.cull_interval
        );

        loop {
            tokio::select! {
                _ = discovery.tick() => self.discovery_tick().await,
                _ = refresh.tick() => self.refresh_tick().await,
                _ = cull.tick() => self.cull_tick().await,
                _ = &mut token_check => {
                    let next = self.token_checkpoint().await;
                    debug!("Next token check in {:?}", next);
                    token_check.as_mut().reset(Instant::now() + next);
                }
            }
        }
    }
}

/// An interval whose first tick comes one period from now.
fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
