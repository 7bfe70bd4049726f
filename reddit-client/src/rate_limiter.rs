use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use votewatch_core::RateLimitSettings;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub time_window: Duration,
    pub burst_allowance: u32,
}

impl RateLimitConfig {
    pub fn reddit_oauth() -> Self {
        Self {
            max_requests: 60,                     // Reddit allows 60 requests per minute for OAuth2
            time_window: Duration::from_secs(60), // 1 minute window
            burst_allowance: 60,                  // the full minute's quota may be spent at once
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            max_requests: settings.requests_per_minute.max(1),
            time_window: Duration::from_secs(60),
            burst_allowance: settings.burst.max(1),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.burst_allowance as f64;
        let refill_rate = config.max_requests as f64 / config.time_window.as_secs_f64();

        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_rate,
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Takes `tokens_needed` tokens, or reports how long until they will be there.
    pub async fn acquire(&self, tokens_needed: f64) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.tokens >= tokens_needed {
            state.tokens -= tokens_needed;
            Ok(())
        } else {
            let missing = tokens_needed - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }

    pub async fn get_available_tokens(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Global limiter shared by every outbound API call.
#[derive(Debug)]
pub struct RateLimiter {
    token_bucket: TokenBucket,
    config: RateLimitConfig,
    window_tracker: Arc<Mutex<WindowTracker>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let token_bucket = TokenBucket::new(&config);
        let window_tracker = Arc::new(Mutex::new(WindowTracker::new(config.time_window)));

        Self {
            token_bucket,
            config,
            window_tracker,
        }
    }

    /// Blocks until `permits` tokens are available and consumes them.
    ///
    /// Requests larger than the burst capacity are taken in capacity-sized
    /// installments, since the bucket can never hold them all at once.
    pub async fn acquire(&self, permits: u32) -> RateLimitPermit {
        let start_time = Instant::now();
        let mut outstanding = permits as f64;

        while outstanding > 0.0 {
            let installment = outstanding.min(self.token_bucket.capacity());
            loop {
                match self.token_bucket.acquire(installment).await {
                    Ok(()) => break,
                    Err(wait_time) => {
                        tracing::debug!("Rate limit reached, waiting {:?}", wait_time);
                        sleep(wait_time).await;
                    }
                }
            }
            outstanding -= installment;
        }

        {
            let mut window_tracker = self.window_tracker.lock().await;
            window_tracker.record_requests(permits);
        }

        RateLimitPermit {
            permits,
            queue_wait_time: start_time.elapsed(),
        }
    }

    pub async fn acquire_permit(&self) -> RateLimitPermit {
        self.acquire(1).await
    }

    pub async fn get_rate_limit_status(&self) -> RateLimitStatus {
        let available_tokens = self.token_bucket.get_available_tokens().await;
        let window_tracker = self.window_tracker.lock().await;
        let window_stats = window_tracker.get_current_window_stats();

        let estimated_wait_time = if available_tokens < 1.0 {
            Some(Duration::from_secs_f64(
                (1.0 - available_tokens) * self.config.time_window.as_secs_f64()
                    / self.config.max_requests as f64,
            ))
        } else {
            None
        };

        RateLimitStatus {
            available_tokens: available_tokens as u32,
            max_tokens: self.config.burst_allowance,
            requests_per_minute: self.config.max_requests,
            current_window_requests: window_stats.request_count,
            window_start_time: window_stats.window_start,
            estimated_wait_time,
        }
    }
}

#[derive(Debug)]
pub struct RateLimitPermit {
    pub permits: u32,
    pub queue_wait_time: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub available_tokens: u32,
    pub max_tokens: u32,
    pub requests_per_minute: u32,
    pub current_window_requests: u32,
    pub window_start_time: SystemTime,
    pub estimated_wait_time: Option<Duration>,
}

impl RateLimitStatus {
    pub fn utilization_percentage(&self) -> f64 {
        let used_tokens = self.max_tokens.saturating_sub(self.available_tokens);
        (used_tokens as f64 / self.max_tokens as f64) * 100.0
    }

    pub fn is_near_limit(&self) -> bool {
        self.utilization_percentage() > 80.0
    }

    pub fn requests_remaining_in_window(&self) -> u32 {
        self.requests_per_minute
            .saturating_sub(self.current_window_requests)
    }
}

#[derive(Debug)]
pub struct WindowTracker {
    window_duration: Duration,
    current_window: WindowStats,
}

#[derive(Debug, Clone)]
pub struct WindowStats {
    pub window_start: SystemTime,
    pub request_count: u32,
}

impl WindowTracker {
    pub fn new(window_duration: Duration) -> Self {
        Self {
            window_duration,
            current_window: WindowStats {
                window_start: SystemTime::now(),
                request_count: 0,
            },
        }
    }

    pub fn record_requests(&mut self, count: u32) {
        self.ensure_current_window();
        self.current_window.request_count += count;
    }

    pub fn get_current_window_stats(&self) -> WindowStats {
        self.current_window.clone()
    }

    fn ensure_current_window(&mut self) {
        let now = SystemTime::now();
        let window_age = now
            .duration_since(self.current_window.window_start)
            .unwrap_or_default();

        if window_age >= self.window_duration {
            self.current_window = WindowStats {
                window_start: now,
                request_count: 0,
            };
        }
    }
}
