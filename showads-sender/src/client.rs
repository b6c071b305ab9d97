use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use showads_common::record::ValidatedRecord;
use showads_common::retry::RetryPolicy;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::dispatcher::BulkSender;
use crate::error::{AuthError, ClientError};

/// Token lifetime assumed when the auth endpoint omits `ExpiresIn`.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// A bearer token and the instant it stops being usable.
/// Tokens are replaced whole, never updated in place.
pub struct AuthToken {
    access_token: String,
    expires_at: Instant,
}

impl AuthToken {
    /// A `ttl` too large to represent as an instant is capped at `DEFAULT_TOKEN_TTL`.
    pub fn new(access_token: String, ttl: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).unwrap_or_else(|| now + DEFAULT_TOKEN_TTL);

        Self {
            access_token,
            expires_at,
        }
    }

    pub fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    #[serde(rename = "ProjectKey")]
    project_key: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(rename = "AccessToken")]
    access_token: String,
    #[serde(rename = "ExpiresIn")]
    expires_in: Option<u64>,
}

/// Outcome of a bulk request that was not converted into an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkResponse {
    pub status: StatusCode,
    /// Attempts made after the first one.
    pub retries: u32,
}

impl BulkResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

pub fn build_http_client(request_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("ShowAds Bulk Sender")
        .timeout(request_timeout)
        .build()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Hex encoded SHA-256 of a serialized batch. Stable across retries of the same batch.
pub fn derive_idempotency_key(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// Client of the ShowAds API. Cheap to share behind an `Arc`: the token cache is internally
/// synchronized and refreshes are serialized so concurrent callers authenticate once.
pub struct ShowAdsClient {
    base_url: String,
    project_key: String,
    http_client: reqwest::Client,
    retry_policy: RetryPolicy,
    token: RwLock<Option<Arc<AuthToken>>>,
    refresh: Mutex<()>,
}

impl fmt::Debug for ShowAdsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShowAdsClient")
            .field("base_url", &self.base_url)
            .field("project_key", &"<redacted>")
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl ShowAdsClient {
    pub fn new(
        base_url: &str,
        project_key: &str,
        request_timeout: Duration,
        retry_policy: RetryPolicy,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            project_key: project_key.to_owned(),
            http_client: build_http_client(request_timeout)?,
            retry_policy,
            token: RwLock::new(None),
            refresh: Mutex::new(()),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Exchange the project key for a new access token and publish it.
    /// Nothing is cached when the request fails.
    pub async fn authenticate(&self) -> Result<Arc<AuthToken>, AuthError> {
        let response = self
            .http_client
            .post(format!("{}/auth", self.base_url))
            .json(&AuthRequest {
                project_key: &self.project_key,
            })
            .send()
            .await
            .map_err(|e| {
                error!(error_msg = %e, "auth_error");
                metrics::counter!("showads_auth_requests", "outcome" => "error").increment(1);
                AuthError::Request(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            error!(error_code = status.as_u16(), "auth_error");
            metrics::counter!("showads_auth_requests", "outcome" => "error").increment(1);
            return Err(AuthError::Status(status));
        }

        let body: AuthResponse = response.json().await.map_err(|e| {
            error!(error_msg = %e, "auth_error");
            metrics::counter!("showads_auth_requests", "outcome" => "error").increment(1);
            AuthError::Parse(e)
        })?;

        let ttl = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);
        let token = Arc::new(AuthToken::new(body.access_token, ttl));
        *self.token.write().await = Some(token.clone());

        info!("auth_ok");
        metrics::counter!("showads_auth_requests", "outcome" => "ok").increment(1);
        Ok(token)
    }

    /// The cached token if it is still valid, otherwise a freshly obtained one.
    pub async fn ensure_token(&self) -> Result<Arc<AuthToken>, AuthError> {
        if let Some(token) = self.current_token().await {
            return Ok(token);
        }
        self.refresh_token(None).await
    }

    async fn current_token(&self) -> Option<Arc<AuthToken>> {
        self.token
            .read()
            .await
            .as_ref()
            .filter(|token| token.is_valid())
            .cloned()
    }

    /// Replace the token under the refresh lock. When `stale` is given, a token published by
    /// another caller in the meantime is reused instead of authenticating again.
    async fn refresh_token(
        &self,
        stale: Option<&Arc<AuthToken>>,
    ) -> Result<Arc<AuthToken>, AuthError> {
        let _guard = self.refresh.lock().await;

        if let Some(current) = self.current_token().await {
            let replaced = stale.map_or(true, |stale| !Arc::ptr_eq(stale, &current));
            if replaced {
                return Ok(current);
            }
        }

        self.authenticate().await
    }

    /// Deliver one batch, retrying on 401 (once, first attempt only), 429 and 5xx.
    ///
    /// Without an explicit `idempotency_key` one is derived from the serialized batch.
    /// A 429 that exhausts the retry budget or the retry ceiling becomes
    /// `ClientError::RateLimited`; a 5xx in the same position is returned as a response. Any
    /// other status is returned as is.
    pub async fn send_batch(
        &self,
        records: &[ValidatedRecord],
        idempotency_key: Option<String>,
    ) -> Result<BulkResponse, ClientError> {
        let url = format!("{}/banners/show/bulk", self.base_url);
        let payload = serde_json::to_vec(records)?;
        let idempotency_key = idempotency_key.unwrap_or_else(|| derive_idempotency_key(&payload));

        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let token = self.ensure_token().await?;

            let result = self
                .http_client
                .post(&url)
                .bearer_auth(&token.access_token)
                .header(IDEMPOTENCY_KEY_HEADER, &idempotency_key)
                .body(payload.clone())
                .send()
                .await;

            let status = match result {
                Ok(response) => response.status(),
                Err(e) => match self.retry_policy.next_delay(attempt, start.elapsed()) {
                    Some(delay) => {
                        warn!(attempt, ?delay, "transient bulk request error, retrying: {}", e);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    None => return Err(ClientError::Transport(e)),
                },
            };

            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!("access token rejected, re-authenticating");
                self.refresh_token(Some(&token)).await?;
                attempt += 1;
                continue;
            }

            if is_retryable_status(status) {
                if let Some(delay) = self.retry_policy.next_delay(attempt, start.elapsed()) {
                    warn!(
                        attempt,
                        status = status.as_u16(),
                        ?delay,
                        "retryable bulk response, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(ClientError::RateLimited {
                        attempts: attempt + 1,
                    });
                }
            }

            return Ok(BulkResponse {
                status,
                retries: attempt,
            });
        }
    }
}

#[async_trait]
impl BulkSender for ShowAdsClient {
    async fn send(&self, batch: &[ValidatedRecord]) -> Result<BulkResponse, ClientError> {
        self.send_batch(batch, None).await
    }
}
