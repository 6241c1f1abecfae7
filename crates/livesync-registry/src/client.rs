//! HTTP client for the upstream per-account API.
//!
//! Endpoints:
//! - `GET {base_url}/accounts/{id}/account-information`
//! - `GET {base_url}/accounts/{id}/positions`
//!
//! Bodies are returned as raw JSON; decoding into snapshots happens in the
//! monitor so that the cache stores one payload type.

use crate::error::{RegistryError, RegistryResult, UpstreamError};
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of per-account payloads.
pub trait AccountSource: Send + Sync + 'static {
    fn fetch_account_information(
        &self,
        account_id: &str,
    ) -> impl Future<Output = Result<Value, UpstreamError>> + Send;

    fn fetch_positions(
        &self,
        account_id: &str,
    ) -> impl Future<Output = Result<Value, UpstreamError>> + Send;
}

/// reqwest-backed `AccountSource`.
pub struct AccountApi {
    client: Client,
    base_url: String,
}

impl AccountApi {
    /// Create a client with the default 10s timeout.
    ///
    /// # Arguments
    /// * `base_url` - API root (e.g., "http://localhost:8000/api")
    pub fn new(base_url: impl Into<String>) -> RegistryResult<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> RegistryResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, url: String) -> Result<Value, UpstreamError> {
        debug!(%url, "GET");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(format!("Failed to parse response: {e}")))
    }
}

impl AccountSource for AccountApi {
    async fn fetch_account_information(&self, account_id: &str) -> Result<Value, UpstreamError> {
        self.get_json(format!(
            "{}/accounts/{account_id}/account-information",
            self.base_url
        ))
        .await
    }

    async fn fetch_positions(&self, account_id: &str) -> Result<Value, UpstreamError> {
        self.get_json(format!("{}/accounts/{account_id}/positions", self.base_url))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api = AccountApi::new("http://localhost:8000/api/").unwrap();
        assert_eq!(api.base_url(), "http://localhost:8000/api");
    }
}
