//! Bearer credential cache shared by every outbound email send (§4.6).
//!
//! Holds at most one live token and its expiry, renewing proactively
//! inside a renewal window and on-demand after a provider 401. An
//! exclusive lock around the renew path collapses concurrent callers
//! onto a single in-flight POST rather than stampeding the auth
//! endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use error_types::{AuthError, MailerError, MailerResult};

use crate::config::AuthConfig;

static INSTANCE: OnceCell<Arc<TokenManager>> = OnceCell::new();

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds until expiry, if the auth provider sends it directly.
    #[serde(default)]
    expires_in: Option<i64>,
    /// Absolute expiry, used when the provider sends it instead.
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

struct Inner {
    cached: Option<CachedToken>,
}

/// Single-instance bearer credential cache. Construct with
/// [`TokenManager::init`] once at worker startup.
pub struct TokenManager {
    http: Client,
    config: AuthConfig,
    renewal_window: Duration,
    state: Mutex<Inner>,
    metrics: crate::metrics::TokenManagerMetrics,
}

/// Mask a token for logs: first 6 + last 4 characters, per §4.6.
fn mask(token: &str) -> String {
    if token.len() <= 10 {
        return "*".repeat(token.len());
    }
    format!("{}...{}", &token[..6], &token[token.len() - 4..])
}

impl TokenManager {
    pub fn init(
        http: Client,
        config: AuthConfig,
        metrics: crate::metrics::TokenManagerMetrics,
    ) -> Arc<TokenManager> {
        let renewal_window = config.renewal_window;
        let manager = Arc::new(TokenManager {
            http,
            config,
            renewal_window,
            state: Mutex::new(Inner { cached: None }),
            metrics,
        });
        let _ = INSTANCE.set(manager.clone());
        manager
    }

    pub fn global() -> MailerResult<Arc<TokenManager>> {
        INSTANCE
            .get()
            .cloned()
            .ok_or_else(|| MailerError::Precondition("token manager accessed before init".into()))
    }

    /// Return the cached token if live and outside the renewal window;
    /// otherwise renew under the exclusive lock and return the fresh
    /// token. Concurrent callers serialize on the same lock, so a
    /// renewal in flight is shared rather than duplicated.
    pub async fn get_token(&self) -> MailerResult<String> {
        let mut state = self.state.lock().await;
        if let Some(cached) = &state.cached {
            let renew_at = cached.expires_at - chrono::Duration::from_std(self.renewal_window)
                .map_err(|e| MailerError::internal(anyhow::anyhow!("invalid renewal window: {e}")))?;
            if Utc::now() < renew_at {
                return Ok(cached.token.clone());
            }
        }
        self.renew_locked(&mut state).await
    }

    /// Drop the cache and renew unconditionally. Used after a provider
    /// 401 — the cached token is presumed revoked or stale.
    pub async fn invalidate_and_renew(&self) -> MailerResult<String> {
        let mut state = self.state.lock().await;
        state.cached = None;
        self.renew_locked(&mut state).await
    }

    async fn renew_locked(&self, state: &mut Inner) -> MailerResult<String> {
        let response = self
            .http
            .post(&self.config.api_url)
            .json(&serde_json::json!({
                "username": self.config.username,
                "password": self.config.password,
            }))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                self.metrics.renewal_failures.inc();
                MailerError::internal(anyhow::anyhow!("auth endpoint request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            tracing::warn!(status, "auth endpoint returned non-success status");
            self.metrics.renewal_failures.inc();
            return Err(MailerError::AuthFailure { source: Some(AuthError::Generic) });
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| {
            self.metrics.renewal_failures.inc();
            MailerError::internal(anyhow::anyhow!("failed to parse auth response: {e}"))
        })?;

        let expires_at = parsed
            .expires_at
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(parsed.expires_in.unwrap_or(3600)));

        tracing::info!(token = %mask(&parsed.access_token), expires_at = %expires_at, "renewed bearer token");
        self.metrics.renewals.inc();

        state.cached = Some(CachedToken { token: parsed.access_token.clone(), expires_at });
        Ok(parsed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_tokens_to_first_six_and_last_four() {
        assert_eq!(mask("abcdefghijklmnop"), "abcdef...mnop");
    }

    #[test]
    fn masks_short_tokens_entirely() {
        assert_eq!(mask("short"), "*****");
    }
}
