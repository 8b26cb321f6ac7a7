//! Shared JSON-over-HTTP client for the provider adapters.

use std::time::Duration;

use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::AdapterError;

/// Header carrying the per-step idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Thin wrapper around `reqwest::Client` bound to one base URL
#[derive(Debug, Clone)]
pub struct JsonClient {
    client: Client,
    base_url: String,
}

impl JsonClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("contractflow/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` to `path` and decode the JSON response
    pub async fn post<B, R>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<R, AdapterError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "POST");

        let mut request = self.client.post(&url).json(body);
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }

        let response = request.send().await.map_err(AdapterError::from_reqwest)?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            return Err(AdapterError::from_status(status, &body));
        }

        response.json::<R>().await.map_err(AdapterError::from_reqwest)
    }
}
