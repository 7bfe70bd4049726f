use crate::auth::{auth_failed, TokenRecord, TokenSource};
use async_trait::async_trait;
use chrono::Utc;
use oauth2::basic::{BasicClient, BasicTokenType};
use oauth2::{
    AuthType, AuthUrl, ClientId, ClientSecret, HttpRequest, HttpResponse, RequestTokenError,
    ResourceOwnerPassword, ResourceOwnerUsername, TokenResponse, TokenUrl,
};
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use tracing::{debug, error};
use votewatch_core::{ConfigError, CoreError, RedditApiError, RedditConfig};

// Never visited: the password grant skips the browser step, but the client type wants one
const REDDIT_AUTHORIZE_URL: &str = "https://www.reddit.com/api/v1/authorize";
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// Script-app authentication: trades the bot account's username and password
/// for a bearer token, authenticating the client with HTTP basic auth.
pub struct PasswordGrant {
    client_id: String,
    account: String,
    oauth_client: BasicClient,
    http_client: Client,
    username: ResourceOwnerUsername,
    password: ResourceOwnerPassword,
}

impl PasswordGrant {
    pub fn new(config: &RedditConfig) -> Result<Self, CoreError> {
        let auth_url = AuthUrl::new(REDDIT_AUTHORIZE_URL.to_string()).map_err(|e| {
            ConfigError::InvalidValue {
                field: "authorize_url".to_string(),
                value: e.to_string(),
            }
        })?;
        let token_url =
            TokenUrl::new(config.token_url.clone()).map_err(|_| ConfigError::InvalidValue {
                field: "reddit.token_url".to_string(),
                value: config.token_url.clone(),
            })?;

        let oauth_client = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            auth_url,
            Some(token_url),
        )
        .set_auth_type(AuthType::BasicAuth);

        // Reddit throttles requests without a descriptive user agent
        let http_client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client_id: config.client_id.clone(),
            account: config.username.clone(),
            oauth_client,
            http_client,
            username: ResourceOwnerUsername::new(config.username.clone()),
            password: ResourceOwnerPassword::new(config.password.clone()),
        })
    }
}

impl fmt::Debug for PasswordGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordGrant")
            .field("client_id", &self.client_id)
            .field("account", &self.account)
            .finish()
    }
}

#[async_trait]
impl TokenSource for PasswordGrant {
    async fn acquire(&self) -> Result<TokenRecord, CoreError> {
        let http_client = self.http_client.clone();
        let response = self
            .oauth_client
            .exchange_password(&self.username, &self.password)
            .request_async(move |request| send_token_request(http_client, request))
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(response) => {
                    auth_failed(response.error().to_string())
                }
                RequestTokenError::Request(e) => {
                    error!("Network error requesting access token: {}", e);
                    CoreError::Network(e)
                }
                RequestTokenError::Parse(e, body) => rejection_from_body(&body)
                    .map(auth_failed)
                    .unwrap_or_else(|| {
                        CoreError::RedditApi(RedditApiError::InvalidResponse {
                            details: format!("unreadable access token response: {}", e),
                        })
                    }),
                RequestTokenError::Other(reason) => auth_failed(reason),
            })?;

        let token_type = match response.token_type() {
            BasicTokenType::Bearer => "bearer".to_string(),
            BasicTokenType::Mac => "mac".to_string(),
            BasicTokenType::Extension(other) => other.clone(),
        };
        let scope = response
            .scopes()
            .map(|scopes| {
                scopes
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        let record = TokenRecord {
            access_token: response.access_token().secret().clone(),
            token_type,
            expires_in: response
                .expires_in()
                .map(|d| d.as_secs())
                .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
            scope,
            // Local time rather than the response's Date header; close enough for expiry math
            obtained_at: Utc::now().timestamp(),
        };
        debug!("Exchanged credentials for {:?}", record);
        Ok(record)
    }
}

/// Reddit answers bad account credentials with `200 OK` and a body of
/// `{"error": "invalid_grant"}`, which the standard parser rejects.
fn rejection_from_body(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Rejection {
        error: serde_json::Value,
        #[serde(default)]
        message: Option<String>,
    }

    let rejection: Rejection = serde_json::from_slice(body).ok()?;
    let reason = match (rejection.error, rejection.message) {
        (serde_json::Value::String(error), _) => error,
        (error, Some(message)) => format!("{} {}", error, message),
        (error, None) => error.to_string(),
    };
    Some(reason)
}

async fn send_token_request(
    http_client: Client,
    request: HttpRequest,
) -> Result<HttpResponse, reqwest::Error> {
    let response = http_client
        .request(request.method, request.url.as_str())
        .headers(request.headers)
        .body(request.body)
        .send()
        .await?;
    let status_code = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> RedditConfig {
        RedditConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            username: "watcher".to_string(),
            password: "hunter2".to_string(),
            user_agent: "votewatch-test/1.0".to_string(),
            token_url: format!("{}/api/v1/access_token", server.uri()),
            ..RedditConfig::default()
        }
    }

    #[tokio::test]
    async fn test_password_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .and(header("user-agent", "votewatch-test/1.0"))
            .and(header_exists("authorization"))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("username=watcher"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc123",
                "token_type": "bearer",
                "expires_in": 86400,
                "scope": "*"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = PasswordGrant::new(&config_for(&server)).unwrap();
        let before = Utc::now().timestamp();
        let record = grant.acquire().await.unwrap();

        assert_eq!(record.access_token, "abc123");
        assert_eq!(record.token_type, "bearer");
        assert_eq!(record.expires_in, 86400);
        assert_eq!(record.scope, "*");
        assert!(record.obtained_at >= before);
        assert!(record.is_valid());
    }

    #[tokio::test]
    async fn test_error_body_with_ok_status_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "error": "invalid_grant" })),
            )
            .mount(&server)
            .await;

        let grant = PasswordGrant::new(&config_for(&server)).unwrap();
        match grant.acquire().await {
            Err(CoreError::RedditApi(RedditApiError::AuthenticationFailed { reason })) => {
                assert_eq!(reason, "invalid_grant")
            }
            other => panic!("Expected AuthenticationFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_client_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(
                serde_json::json!({ "message": "Unauthorized", "error": 401 }),
            ))
            .mount(&server)
            .await;

        let grant = PasswordGrant::new(&config_for(&server)).unwrap();
        let result = grant.acquire().await;
        assert!(matches!(
            result,
            Err(CoreError::RedditApi(
                RedditApiError::AuthenticationFailed { .. }
            ))
        ));
    }

    #[test]
    fn test_rejection_from_body() {
        assert_eq!(
            rejection_from_body(br#"{"error":"invalid_grant"}"#),
            Some("invalid_grant".to_string())
        );
        assert_eq!(
            rejection_from_body(br#"{"message":"Unauthorized","error":401}"#),
            Some("401 Unauthorized".to_string())
        );
        assert_eq!(rejection_from_body(b"<html>"), None);
    }

    #[test]
    fn test_debug_hides_password() {
        let config = RedditConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            username: "watcher".to_string(),
            password: "hunter2".to_string(),
            user_agent: "votewatch-test/1.0".to_string(),
            ..RedditConfig::default()
        };
        let grant = PasswordGrant::new(&config).unwrap();
        let rendered = format!("{:?}", grant);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("secret"));
    }
}
