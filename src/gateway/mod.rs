/*!
 * # Authorization Gateway Client
 *
 * Thin typed wrapper over the external payment gateway's authorization
 * resource: retrieve, update-amount (idempotent) and capture/void. All
 * HTTP calls pass through the backoff retrier with the gateway-specific
 * retry classification.
 */

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};
use url::Url;

use crate::retry::{with_retry, RetryConfig, RetryPolicy};

pub mod decline;

/// Errors surfaced by the gateway client after retry classification.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("card declined ({code})")]
    CardDeclined {
        code: String,
        decline_code: Option<String>,
    },
    #[error("idempotency key already used with different parameters")]
    IdempotencyConflict,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("gateway connectivity error: {0}")]
    Connectivity(String),
    #[error("gateway service error (status {status})")]
    Service { status: u16 },
    #[error("gateway rate limited")]
    RateLimited,
    #[error("unexpected gateway response: {0}")]
    UnexpectedResponse(String),
}

impl GatewayError {
    /// Connectivity failures, 5xx and 429 are transient; card and
    /// validation errors are terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Connectivity(_) | GatewayError::Service { .. } | GatewayError::RateLimited
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Connectivity(err.to_string())
    }
}

/// Retry classification for gateway calls. Only safe on calls that are
/// idempotent by nature (retrieve) or carry an idempotency key.
pub struct GatewayRetryPolicy;

impl RetryPolicy<GatewayError> for GatewayRetryPolicy {
    fn is_retryable(&self, error: &GatewayError) -> bool {
        error.is_transient()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuthorizationStatus {
    RequiresCapture,
    Succeeded,
    Canceled,
    Processing,
}

/// Snapshot of the gateway's hold on the customer's funds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub id: String,
    pub status: AuthorizationStatus,
    /// Authorized amount in integer minor units.
    pub amount: i64,
    /// Amount already collected, in integer minor units.
    #[serde(default)]
    pub amount_received: i64,
    pub currency: String,
    #[serde(default = "default_capture_method")]
    pub capture_method: String,
}

fn default_capture_method() -> String {
    "manual".to_string()
}

impl Authorization {
    pub fn requires_capture(&self) -> bool {
        self.status == AuthorizationStatus::RequiresCapture
    }
}

/// External authorization operations the saga depends on.
#[async_trait]
pub trait AuthorizationGateway: Send + Sync {
    async fn retrieve(&self, authorization_id: &str) -> Result<Authorization, GatewayError>;

    /// Adjust the authorized amount. The idempotency key makes a retried
    /// call with identical parameters a no-op at the gateway.
    async fn update_amount(
        &self,
        authorization_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<Authorization, GatewayError>;

    async fn capture(&self, authorization_id: &str) -> Result<Authorization, GatewayError>;

    /// Void the authorization, releasing the hold.
    async fn cancel(&self, authorization_id: &str) -> Result<Authorization, GatewayError>;
}

/// Error envelope returned by the gateway on non-2xx responses.
#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: GatewayErrorDetails,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetails {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP implementation of [`AuthorizationGateway`].
///
/// One instance is constructed by the process entry point and shared; it
/// holds the single underlying connection pool for the process.
pub struct HttpAuthorizationGateway {
    client: reqwest::Client,
    base_url: Url,
    secret_key: String,
    retry: RetryConfig,
}

impl HttpAuthorizationGateway {
    pub fn new(base_url: Url, secret_key: String, retry: RetryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            secret_key,
            retry,
        }
    }

    fn authorization_url(&self, authorization_id: &str, action: Option<&str>) -> String {
        let mut url = format!(
            "{}/v1/authorizations/{}",
            self.base_url.as_str().trim_end_matches('/'),
            authorization_id
        );
        if let Some(action) = action {
            url.push('/');
            url.push_str(action);
        }
        url
    }

    async fn decode_response(
        &self,
        response: reqwest::Response,
    ) -> Result<Authorization, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Authorization>()
                .await
                .map_err(|e| GatewayError::UnexpectedResponse(e.to_string()));
        }

        let body = response.json::<GatewayErrorBody>().await.ok();
        let details = body.map(|b| b.error);
        let code = details
            .as_ref()
            .and_then(|d| d.code.clone())
            .unwrap_or_default();

        match status {
            StatusCode::PAYMENT_REQUIRED => Err(GatewayError::CardDeclined {
                code: if code.is_empty() {
                    "card_declined".to_string()
                } else {
                    code
                },
                decline_code: details.and_then(|d| d.decline_code),
            }),
            StatusCode::CONFLICT if code == "idempotency_key_in_use" => {
                Err(GatewayError::IdempotencyConflict)
            }
            StatusCode::TOO_MANY_REQUESTS => Err(GatewayError::RateLimited),
            s if s.is_server_error() => Err(GatewayError::Service {
                status: s.as_u16(),
            }),
            _ if code == "card_declined" => Err(GatewayError::CardDeclined {
                code,
                decline_code: details.and_then(|d| d.decline_code),
            }),
            s => Err(GatewayError::InvalidRequest(
                details
                    .and_then(|d| d.message)
                    .unwrap_or_else(|| format!("gateway returned status {}", s)),
            )),
        }
    }
}

#[async_trait]
impl AuthorizationGateway for HttpAuthorizationGateway {
    #[instrument(skip(self), fields(authorization_id = %authorization_id))]
    async fn retrieve(&self, authorization_id: &str) -> Result<Authorization, GatewayError> {
        let url = self.authorization_url(authorization_id, None);
        with_retry(&self.retry, GatewayRetryPolicy, || async {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.secret_key)
                .send()
                .await?;
            self.decode_response(response).await
        })
        .await
    }

    #[instrument(skip(self, idempotency_key), fields(authorization_id = %authorization_id, amount = amount))]
    async fn update_amount(
        &self,
        authorization_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<Authorization, GatewayError> {
        let url = self.authorization_url(authorization_id, None);
        with_retry(&self.retry, GatewayRetryPolicy, || async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.secret_key)
                .header("Idempotency-Key", idempotency_key)
                .json(&serde_json::json!({ "amount": amount }))
                .send()
                .await?;
            self.decode_response(response).await
        })
        .await
    }

    #[instrument(skip(self), fields(authorization_id = %authorization_id))]
    async fn capture(&self, authorization_id: &str) -> Result<Authorization, GatewayError> {
        let url = self.authorization_url(authorization_id, Some("capture"));
        with_retry(&self.retry, GatewayRetryPolicy, || async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.secret_key)
                .send()
                .await?;
            self.decode_response(response).await
        })
        .await
    }

    #[instrument(skip(self), fields(authorization_id = %authorization_id))]
    async fn cancel(&self, authorization_id: &str) -> Result<Authorization, GatewayError> {
        let url = self.authorization_url(authorization_id, Some("cancel"));
        with_retry(&self.retry, GatewayRetryPolicy, || async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.secret_key)
                .send()
                .await?;
            let result = self.decode_response(response).await;
            if let Err(ref e) = result {
                warn!(error = %e, "authorization void attempt failed");
            }
            result
        })
        .await
    }
}
