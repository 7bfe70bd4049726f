use background_service::{Scheduler, SchedulerConfig};
use clap::Parser;
use database::MemoryStore;
use reddit_client::{
    FileTokenCache, PasswordGrant, RateLimitConfig, RateLimiter, RedditApiClient, RedditClient,
    RefreshSchedule, TokenCache, TokenManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use votewatch_core::{CoreError, WatchConfig};

const DEFAULT_LOG_FILTER: &str =
    "votewatch=info,reddit_client=info,background_service=info,database=info";

/// Tracks new Reddit posts and records how their votes and comments evolve.
#[derive(Debug, Parser)]
#[command(name = "votewatch", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "votewatch.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), CoreError> {
    // a missing .env is fine; credentials may come from the config file
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting votewatch with {}", args.config.display());

    let config = WatchConfig::load(&args.config).map_err(|e| {
        tracing::error!("Unable to load configuration: {}", e);
        e
    })?;

    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig::from(&config.rate_limit)));

    let cache: Option<Arc<dyn TokenCache>> = if config.auth.cache_token {
        Some(Arc::new(FileTokenCache::new(&config.auth.token_cache_path)))
    } else {
        None
    };
    let tokens = TokenManager::start(
        Arc::new(PasswordGrant::new(&config.reddit)?),
        cache,
        RefreshSchedule::from_config(&config.auth),
    )
    .await
    .map_err(|e| {
        tracing::error!("Could not obtain an access token: {}", e);
        e
    })?;
    let tokens = Arc::new(tokens);
    let refresh_loop = tokens.spawn_refresh_loop();

    let api = RedditApiClient::new(&config.reddit, Arc::clone(&rate_limiter), Arc::clone(&tokens))?;
    let client = RedditClient::new(Arc::new(api), rate_limiter);
    let store = Arc::new(MemoryStore::new());

    let scheduler = Scheduler::new(
        SchedulerConfig::from(&config.watch),
        client,
        tokens,
        store,
        &config.watch.feeds,
    );
    if let Err(e) = scheduler.seed_from_store().await {
        tracing::warn!("Starting with an empty tracked set: {}", e);
    }

    tokio::select! {
        _ = scheduler.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Unable to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        }
    }

    refresh_loop.abort();
    Ok(())
}
