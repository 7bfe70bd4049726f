use votewatch_core::{
    log_by_severity, ConfigError, CoreError, ErrorExt, RedditApiError, StorageError,
};
use std::time::Duration;

#[test]
fn test_error_codes() {
    let reddit_error = CoreError::RedditApi(RedditApiError::InvalidToken);
    assert_eq!(reddit_error.error_code(), "REDDIT_API");

    let storage_error = CoreError::Storage(StorageError::Unavailable {
        reason: "connection refused".to_string(),
    });
    assert_eq!(storage_error.error_code(), "STORAGE");

    let config_error = CoreError::Config(ConfigError::MissingField {
        field: "reddit.client_id".to_string(),
    });
    assert_eq!(config_error.error_code(), "CONFIG");
}

#[test]
fn test_retryable_errors() {
    let retryable_error =
        CoreError::RedditApi(RedditApiError::RateLimitExceeded { retry_after: 60 });
    assert!(retryable_error.is_retryable());

    let server_error = CoreError::RedditApi(RedditApiError::ServerError { status_code: 503 });
    assert!(server_error.is_retryable());

    let non_retryable_error = CoreError::Config(ConfigError::MissingField {
        field: "reddit.client_id".to_string(),
    });
    assert!(!non_retryable_error.is_retryable());

    let forbidden = CoreError::RedditApi(RedditApiError::Forbidden {
        resource: "/r/private/new".to_string(),
    });
    assert!(!forbidden.is_retryable());
}

#[test]
fn test_retry_after() {
    let rate_limit_error =
        CoreError::RedditApi(RedditApiError::RateLimitExceeded { retry_after: 60 });
    assert_eq!(
        rate_limit_error.retry_after(),
        Some(Duration::from_secs(60))
    );

    let server_error = CoreError::RedditApi(RedditApiError::ServerError { status_code: 502 });
    assert_eq!(server_error.retry_after(), None);
}

#[test]
fn test_error_display_carries_context() {
    let error = CoreError::RedditApi(RedditApiError::UnexpectedStatus {
        status_code: 418,
        endpoint: "/r/rust/new".to_string(),
    });
    let message = error.to_string();
    assert!(message.contains("418"));
    assert!(message.contains("/r/rust/new"));
}

#[test]
fn test_log_by_severity_without_subscriber() {
    // Only checks that logging without a subscriber installed is harmless
    log_by_severity("Refresh tick", &CoreError::RedditApi(RedditApiError::InvalidToken));
    log_by_severity(
        "Walking r/private",
        &CoreError::RedditApi(RedditApiError::Forbidden {
            resource: "/r/private/new".to_string(),
        }),
    );
}
