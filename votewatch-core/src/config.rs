//! Configuration for the watcher.
//!
//! Settings come from a TOML file. Reddit credentials may also be supplied
//! through the environment (`REDDIT_CLIENT_ID`, `REDDIT_CLIENT_SECRET`,
//! `REDDIT_USERNAME`, `REDDIT_PASSWORD`, `REDDIT_USERAGENT_STRING`), which
//! take precedence over the file so secrets can stay out of it.

use crate::error::{ConfigError, CoreError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
pub const DEFAULT_API_BASE: &str = "https://oauth.reddit.com";

/// A subreddit name, or several joined with `+`.
static FEED_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[A-Za-z0-9_]+(\\+[A-Za-z0-9_]+)*$").expect("feed pattern is a valid regex")
});

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub reddit: RedditConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    pub watch: WatchSettings,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RedditConfig {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
    pub token_url: String,
    pub api_base: String,
    pub request_timeout_secs: u64,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            username: String::new(),
            password: String::new(),
            user_agent: String::new(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout_secs: 30,
        }
    }
}

// Secrets stay out of logs
impl fmt::Debug for RedditConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedditConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<REDACTED>")
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .field("user_agent", &self.user_agent)
            .field("token_url", &self.token_url)
            .field("api_base", &self.api_base)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl RedditConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub cache_token: bool,
    pub token_cache_path: String,
    /// Fraction of a token's lifetime to wait before refreshing it.
    pub refresh_leniency: f64,
    pub refresh_retry_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cache_token: true,
            token_cache_path: "access_token.json".to_string(),
            refresh_leniency: 0.99,
            refresh_retry_secs: 30,
        }
    }
}

impl AuthConfig {
    pub fn refresh_retry_delay(&self) -> Duration {
        Duration::from_secs(self.refresh_retry_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        // Reddit allows 60 OAuth requests per minute
        Self {
            requests_per_minute: 60,
            burst: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSettings {
    pub feeds: Vec<String>,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_posts_per_walk")]
    pub posts_per_walk: usize,
    #[serde(default = "default_max_listing_age")]
    pub max_listing_age_secs: u64,
    #[serde(default = "default_cull_interval")]
    pub cull_interval_secs: u64,
}

fn default_discovery_interval() -> u64 {
    60
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_posts_per_walk() -> usize {
    100
}

fn default_max_listing_age() -> u64 {
    86_400
}

fn default_cull_interval() -> u64 {
    3_600
}

impl WatchSettings {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn cull_interval(&self) -> Duration {
        Duration::from_secs(self.cull_interval_secs)
    }

    pub fn max_listing_age(&self) -> Duration {
        Duration::from_secs(self.max_listing_age_secs)
    }
}

impl WatchConfig {
    /// Reads, env-overrides and validates the config at `path`.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }

        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        debug!("Loaded configuration from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides: [(&str, &mut String); 5] = [
            ("REDDIT_CLIENT_ID", &mut self.reddit.client_id),
            ("REDDIT_CLIENT_SECRET", &mut self.reddit.client_secret),
            ("REDDIT_USERNAME", &mut self.reddit.username),
            ("REDDIT_PASSWORD", &mut self.reddit.password),
            ("REDDIT_USERAGENT_STRING", &mut self.reddit.user_agent),
        ];

        for (key, field) in overrides {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *field = value;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("reddit.client_id", &self.reddit.client_id),
            ("reddit.client_secret", &self.reddit.client_secret),
            ("reddit.username", &self.reddit.username),
            ("reddit.password", &self.reddit.password),
            ("reddit.user_agent", &self.reddit.user_agent),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        for (field, value) in [
            ("reddit.token_url", &self.reddit.token_url),
            ("reddit.api_base", &self.reddit.api_base),
        ] {
            if Url::parse(value).is_err() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.clone(),
                });
            }
        }

        if self.watch.feeds.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "watch.feeds must name at least one subreddit".to_string(),
            });
        }
        if let Some(feed) = self.watch.feeds.iter().find(|f| !FEED_PATTERN.is_match(f)) {
            return Err(ConfigError::InvalidValue {
                field: "watch.feeds".to_string(),
                value: format!("{:?}", feed),
            });
        }

        let positive = [
            ("watch.discovery_interval_secs", self.watch.discovery_interval_secs),
            ("watch.refresh_interval_secs", self.watch.refresh_interval_secs),
            ("watch.cull_interval_secs", self.watch.cull_interval_secs),
            ("watch.max_listing_age_secs", self.watch.max_listing_age_secs),
            ("watch.posts_per_walk", self.watch.posts_per_walk as u64),
            ("rate_limit.requests_per_minute", self.rate_limit.requests_per_minute as u64),
            ("rate_limit.burst", self.rate_limit.burst as u64),
            ("reddit.request_timeout_secs", self.reddit.request_timeout_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0".to_string(),
                });
            }
        }

        // Out-of-range leniency is clamped where it is used; only garbage is rejected here
        if !self.auth.refresh_leniency.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "auth.refresh_leniency".to_string(),
                value: self.auth.refresh_leniency.to_string(),
            });
        }

        Ok(())
    }
}
