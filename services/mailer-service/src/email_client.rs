//! Single-operation client against the downstream email provider
//! (§4.7). Every send is routed through the process-wide rate limiter
//! and authenticated via the shared token manager; callers never touch
//! either directly.

use std::time::Duration;

use error_types::{MailerError, MailerResult};
use reqwest::{Client, StatusCode};
use resilience::{presets, CircuitBreaker, CircuitBreakerError};
use serde::{Deserialize, Serialize};

use crate::config::EmailProviderConfig;
use crate::metrics::EmailMetrics;
use crate::rate_limiter::{Priority, RateLimiter};
use crate::token_manager::TokenManager;

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize, Default)]
struct SendResponse {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default, rename = "messageId")]
    message_id_camel: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

impl SendResponse {
    fn resolve_message_id(self, status: StatusCode) -> String {
        self.message_id
            .or(self.message_id_camel)
            .or(self.id)
            .unwrap_or_else(|| format!("status:{}", status.as_u16()))
    }
}

/// Outcome of a successful provider send. Carries no PII beyond what the
/// caller already had — the message id and status, nothing else.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
    pub status: u16,
}

pub struct EmailProviderClient {
    http: Client,
    config: EmailProviderConfig,
    metrics: EmailMetrics,
    circuit_breaker: CircuitBreaker,
}

impl EmailProviderClient {
    pub fn new(config: EmailProviderConfig, metrics: EmailMetrics) -> MailerResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| MailerError::internal(anyhow::anyhow!("failed to build HTTP client: {e}")))?;
        let circuit_breaker = CircuitBreaker::new(presets::http_external_config().circuit_breaker);
        Ok(Self { http, config, metrics, circuit_breaker })
    }

    /// Send one email under the global rate limiter and bearer token
    /// cache. `idempotency_key` should be stable across redeliveries of
    /// the same row (the mailing entry id is a natural choice).
    pub async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        idempotency_key: &str,
    ) -> MailerResult<SendOutcome> {
        let limiter = RateLimiter::global()?;
        limiter
            .schedule(Priority::default(), || self.send_once_with_reauth(to, subject, body, idempotency_key))
            .await
    }

    /// Performs the authenticated POST, retrying exactly once after a
    /// token invalidate-and-renew on a 401 (§4.7 step 4).
    async fn send_once_with_reauth(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        idempotency_key: &str,
    ) -> MailerResult<SendOutcome> {
        let token_manager = TokenManager::global()?;
        let token = token_manager.get_token().await?;

        let first = self.post(to, subject, body, idempotency_key, &token).await;
        match first {
            Err(MailerError::AuthFailure { .. }) => {
                let token = token_manager.invalidate_and_renew().await?;
                self.post(to, subject, body, idempotency_key, &token).await
            }
            other => other,
        }
    }

    async fn post(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        idempotency_key: &str,
        token: &str,
    ) -> MailerResult<SendOutcome> {
        // Trips on network-level failures (timeouts, connection resets) so a
        // provider outage fails fast instead of piling up in-flight requests
        // behind the rate limiter.
        let response = self
            .circuit_breaker
            .call(|| {
                self.http
                    .post(&self.config.api_url)
                    .bearer_auth(token)
                    .header("Idempotency-Key", idempotency_key)
                    .header("Content-Type", "application/json")
                    .json(&SendRequest { to, subject, body })
                    .send()
            })
            .await
            .map_err(|e| match e {
                CircuitBreakerError::Open => {
                    MailerError::CircuitBreakerOpen { service: "email_provider".to_string() }
                }
                CircuitBreakerError::CallFailed(detail) => {
                    MailerError::TransientProviderFailure { status: None, detail: format!("request failed: {detail}") }
                }
            })?;

        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(status = status.as_u16(), "provider returned 401, invalidating token");
            return Err(MailerError::AuthFailure { source: None });
        }

        if !status.is_success() {
            self.metrics.failed.inc();
            let classification = crate::retry_policy::classify_status(Some(status.as_u16()));
            let detail = format!("provider returned {}", status.as_u16());
            return match classification {
                crate::retry_policy::Classification::Retryable => {
                    Err(MailerError::TransientProviderFailure { status: Some(status.as_u16()), detail })
                }
                crate::retry_policy::Classification::NonRetryable => {
                    Err(MailerError::PermanentProviderFailure { status: status.as_u16(), detail })
                }
            };
        }

        let parsed: SendResponse = response.json().await.unwrap_or_default();
        let message_id = parsed.resolve_message_id(status);

        tracing::info!(message_id = %message_id, status = status.as_u16(), "email dispatched");
        self.metrics.sent.inc();

        Ok(SendOutcome { message_id, status: status.as_u16() })
    }

    /// Row-level 429 handling (§4.4 step 5d): up to 3 local retries with
    /// fixed 2s/4s/8s backoff, distinct from the job-level retry queue.
    pub async fn send_with_local_429_retry(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        idempotency_key: &str,
    ) -> MailerResult<SendOutcome> {
        const DELAYS_SECS: [u64; 3] = [2, 4, 8];

        let mut attempt = 0usize;
        loop {
            match self.send_email(to, subject, body, idempotency_key).await {
                Err(MailerError::TransientProviderFailure { status: Some(429), .. }) if attempt < DELAYS_SECS.len() => {
                    self.metrics.rate_limited_retries.inc();
                    tokio::time::sleep(Duration::from_secs(DELAYS_SECS[attempt])).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_message_id_from_snake_case_field() {
        let r = SendResponse { message_id: Some("abc".into()), message_id_camel: None, id: None };
        assert_eq!(r.resolve_message_id(StatusCode::OK), "abc");
    }

    #[test]
    fn resolves_message_id_from_camel_case_field() {
        let r = SendResponse { message_id: None, message_id_camel: Some("def".into()), id: None };
        assert_eq!(r.resolve_message_id(StatusCode::OK), "def");
    }

    #[test]
    fn falls_back_to_id_field() {
        let r = SendResponse { message_id: None, message_id_camel: None, id: Some("ghi".into()) };
        assert_eq!(r.resolve_message_id(StatusCode::OK), "ghi");
    }

    #[test]
    fn falls_back_to_synthetic_status_when_no_id_present() {
        let r = SendResponse::default();
        assert_eq!(r.resolve_message_id(StatusCode::OK), "status:200");
    }
}
